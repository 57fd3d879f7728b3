use anyhow::Context;
use tracing::{info, warn};

use caiproxy_core::bootstrap::bootstrap_from_env;
use caiproxy_router::proxy_router;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("caiproxy failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let boot = bootstrap_from_env().await?;
    let global = &boot.global;
    info!(
        host = %global.host,
        port = global.port,
        backend = global.backend.as_str(),
        backend_base_url = %global.backend_base_url,
        proxy = %global.proxy.as_deref().unwrap_or(""),
        session_idle_secs = global.session_idle_secs,
        conversation_idle_secs = global.conversation_idle_secs,
        "config loaded"
    );

    let (sweeper, stop_sweeper) = boot
        .state
        .registry
        .spawn_sweeper(boot.state.sweep_interval());

    let app = proxy_router(boot.state.clone());
    let bind = global.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    // Releases every live backend session before exiting.
    let _ = stop_sweeper.send(()).await;
    if let Err(err) = sweeper.await {
        warn!(error = %err, "sweeper task failed");
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("caiproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
