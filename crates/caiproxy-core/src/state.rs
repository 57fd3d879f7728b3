use std::sync::Arc;
use std::time::Duration;

use caiproxy_common::GlobalConfig;
use caiproxy_provider_core::{
    CharacterBackend, Clock, EventHub, RateLimitBackoff, RegistryConfig, SessionRegistry,
};

use crate::engine::ProxyEngine;
use crate::exchange::{ExchangeEngine, RetryPolicy};

/// Everything a request handler needs, built once at startup.
pub struct AppState {
    pub global: GlobalConfig,
    pub registry: SessionRegistry,
    pub engine: ProxyEngine,
    pub events: EventHub,
}

impl AppState {
    pub fn new(
        global: GlobalConfig,
        backend: Arc<dyn CharacterBackend>,
        clock: Arc<dyn Clock>,
        events: EventHub,
    ) -> Self {
        let registry = SessionRegistry::new(
            backend,
            clock,
            registry_config(&global),
            events.clone(),
        );
        let exchange = ExchangeEngine::new(retry_policy(&global));
        let engine = ProxyEngine::new(
            registry.clone(),
            exchange,
            global.persona_prefixes.clone(),
            Duration::from_secs(global.auth_timeout_secs),
        );
        Self {
            global,
            registry,
            engine,
            events,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.global.sweep_interval_secs)
    }
}

pub fn registry_config(global: &GlobalConfig) -> RegistryConfig {
    RegistryConfig {
        session_idle: Duration::from_secs(global.session_idle_secs),
        conversation_idle: Duration::from_secs(global.conversation_idle_secs),
        auth_timeout: Duration::from_secs(global.auth_timeout_secs),
        history_limit: global.history_limit,
        rate_limit: rate_limit_backoff(global),
    }
}

pub fn retry_policy(global: &GlobalConfig) -> RetryPolicy {
    RetryPolicy {
        rate_limit: rate_limit_backoff(global),
        exchange_timeout: Duration::from_secs(global.exchange_timeout_secs),
    }
}

fn rate_limit_backoff(global: &GlobalConfig) -> RateLimitBackoff {
    RateLimitBackoff {
        attempts: global.rate_limit_attempts,
        base_delay: Duration::from_millis(global.rate_limit_base_delay_ms),
        max_delay: Duration::from_millis(global.rate_limit_max_delay_ms),
    }
}
