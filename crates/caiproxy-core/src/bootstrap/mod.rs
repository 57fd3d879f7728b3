use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use caiproxy_common::{BackendKind, GlobalConfig, GlobalConfigPatch};
use caiproxy_provider_core::{CharacterBackend, EventHub, SystemClock, TracingEventSink};
use caiproxy_provider_impl::{
    CharacterAiBackend, CharacterAiConfig, HttpClientConfig, ScriptedBackend,
};

use crate::state::AppState;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "caiproxy",
    version,
    about = "OpenAI-compatible chat-completions proxy for character-chat backends"
)]
pub struct CliArgs {
    /// TOML config file, the lowest-priority layer above built-in defaults.
    #[arg(long, env = "CAIPROXY_CONFIG")]
    pub config: Option<String>,

    /// Bind host.
    #[arg(long, env = "CAIPROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "CAIPROXY_PORT")]
    pub port: Option<String>,

    /// Optional outbound proxy for backend requests.
    #[arg(long, env = "CAIPROXY_PROXY")]
    pub proxy: Option<String>,

    /// `characterai` or `demo`.
    #[arg(long, env = "CAIPROXY_BACKEND")]
    pub backend: Option<String>,

    #[arg(long, env = "CAIPROXY_BACKEND_BASE_URL")]
    pub backend_base_url: Option<String>,

    /// Comma-separated namespace tags stripped from `model`.
    #[arg(long, env = "CAIPROXY_PERSONA_PREFIXES")]
    pub persona_prefixes: Option<String>,

    #[arg(long, env = "CAIPROXY_SESSION_IDLE_SECS")]
    pub session_idle_secs: Option<String>,

    #[arg(long, env = "CAIPROXY_CONVERSATION_IDLE_SECS")]
    pub conversation_idle_secs: Option<String>,

    #[arg(long, env = "CAIPROXY_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: Option<String>,

    #[arg(long, env = "CAIPROXY_AUTH_TIMEOUT_SECS")]
    pub auth_timeout_secs: Option<String>,

    #[arg(long, env = "CAIPROXY_EXCHANGE_TIMEOUT_SECS")]
    pub exchange_timeout_secs: Option<String>,

    #[arg(long, env = "CAIPROXY_RATE_LIMIT_ATTEMPTS")]
    pub rate_limit_attempts: Option<String>,

    #[arg(long, env = "CAIPROXY_RATE_LIMIT_BASE_DELAY_MS")]
    pub rate_limit_base_delay_ms: Option<String>,

    #[arg(long, env = "CAIPROXY_RATE_LIMIT_MAX_DELAY_MS")]
    pub rate_limit_max_delay_ms: Option<String>,

    #[arg(long, env = "CAIPROXY_HISTORY_LIMIT")]
    pub history_limit: Option<String>,
}

pub struct Bootstrap {
    pub global: GlobalConfig,
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    // 1) file layer (optional).
    let mut merged = match sanitize_optional_env_value(args.config.clone()) {
        Some(path) => load_config_file(Path::new(&path))?,
        None => GlobalConfigPatch::default(),
    };

    // 2) clap already applies CLI > ENV per field; overlay that on the file.
    merged.overlay(cli_patch(&args)?);
    let global: GlobalConfig = merged
        .into_config()
        .context("finalize merged global config")?;

    // 3) events, backend, state.
    let events = EventHub::new(1024);
    events.add_sink(Arc::new(TracingEventSink::new())).await;
    let backend = build_backend(&global);
    info!(event = "backend_selected", backend = backend.name());
    let state = AppState::new(
        global.clone(),
        backend,
        Arc::new(SystemClock),
        events,
    );

    Ok(Bootstrap {
        global,
        state: Arc::new(state),
    })
}

pub fn build_backend(global: &GlobalConfig) -> Arc<dyn CharacterBackend> {
    match global.backend {
        BackendKind::CharacterAi => Arc::new(CharacterAiBackend::new(CharacterAiConfig {
            base_url: global.backend_base_url.clone(),
            http: HttpClientConfig {
                proxy: global.proxy.clone(),
                read_timeout: std::time::Duration::from_secs(global.exchange_timeout_secs),
                ..HttpClientConfig::default()
            },
        })),
        BackendKind::Demo => Arc::new(ScriptedBackend::demo()),
    }
}

fn load_config_file(path: &Path) -> anyhow::Result<GlobalConfigPatch> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
}

fn cli_patch(args: &CliArgs) -> anyhow::Result<GlobalConfigPatch> {
    let backend = match sanitize_optional_env_value(args.backend.clone()) {
        Some(raw) => Some(
            BackendKind::parse(&raw)
                .ok_or_else(|| anyhow::anyhow!("invalid CAIPROXY_BACKEND value: {raw}"))?,
        ),
        None => None,
    };
    let persona_prefixes = sanitize_optional_env_value(args.persona_prefixes.clone()).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    });

    Ok(GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host.clone()),
        port: parse_number_env_value(args.port.clone(), "CAIPROXY_PORT")?,
        proxy: sanitize_optional_env_value(args.proxy.clone()),
        backend,
        backend_base_url: sanitize_optional_env_value(args.backend_base_url.clone()),
        persona_prefixes,
        session_idle_secs: parse_number_env_value(
            args.session_idle_secs.clone(),
            "CAIPROXY_SESSION_IDLE_SECS",
        )?,
        conversation_idle_secs: parse_number_env_value(
            args.conversation_idle_secs.clone(),
            "CAIPROXY_CONVERSATION_IDLE_SECS",
        )?,
        sweep_interval_secs: parse_number_env_value(
            args.sweep_interval_secs.clone(),
            "CAIPROXY_SWEEP_INTERVAL_SECS",
        )?,
        auth_timeout_secs: parse_number_env_value(
            args.auth_timeout_secs.clone(),
            "CAIPROXY_AUTH_TIMEOUT_SECS",
        )?,
        exchange_timeout_secs: parse_number_env_value(
            args.exchange_timeout_secs.clone(),
            "CAIPROXY_EXCHANGE_TIMEOUT_SECS",
        )?,
        rate_limit_attempts: parse_number_env_value(
            args.rate_limit_attempts.clone(),
            "CAIPROXY_RATE_LIMIT_ATTEMPTS",
        )?,
        rate_limit_base_delay_ms: parse_number_env_value(
            args.rate_limit_base_delay_ms.clone(),
            "CAIPROXY_RATE_LIMIT_BASE_DELAY_MS",
        )?,
        rate_limit_max_delay_ms: parse_number_env_value(
            args.rate_limit_max_delay_ms.clone(),
            "CAIPROXY_RATE_LIMIT_MAX_DELAY_MS",
        )?,
        history_limit: parse_number_env_value(
            args.history_limit.clone(),
            "CAIPROXY_HISTORY_LIMIT",
        )?,
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems inject unresolved placeholders like `${VAR}`.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_number_env_value<T: FromStr>(
    value: Option<String>,
    env_name: &str,
) -> anyhow::Result<Option<T>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}
