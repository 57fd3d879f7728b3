use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Which backend adapter serves persona conversations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// HTTP adapter for the character-chat service.
    #[default]
    CharacterAi,
    /// Canned in-process replies, no network access.
    Demo,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "characterai" | "character-ai" | "cai" => Some(Self::CharacterAi),
            "demo" | "scripted" => Some(Self::Demo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CharacterAi => "characterai",
            Self::Demo => "demo",
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for backend egress).
    pub proxy: Option<String>,
    pub backend: BackendKind,
    pub backend_base_url: String,
    /// Namespace tags stripped from the front of the `model` field.
    pub persona_prefixes: Vec<String>,
    /// Idle time after which a backend connection is released.
    pub session_idle_secs: u64,
    /// Idle time after which a cached conversation handle is considered stale.
    pub conversation_idle_secs: u64,
    pub sweep_interval_secs: u64,
    pub auth_timeout_secs: u64,
    /// Bound on the initial send and on each gap between streamed fragments.
    pub exchange_timeout_secs: u64,
    pub rate_limit_attempts: u32,
    pub rate_limit_base_delay_ms: u64,
    pub rate_limit_max_delay_ms: u64,
    /// Exchanges remembered per conversation.
    pub history_limit: usize,
}

pub const DEFAULT_BACKEND_BASE_URL: &str = "https://beta.character.ai";
pub const DEFAULT_PERSONA_PREFIX: &str = "character-ai:";

/// Optional layer used for merging global config.
///
/// Also the on-disk shape of the TOML config file, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub backend: Option<BackendKind>,
    pub backend_base_url: Option<String>,
    pub persona_prefixes: Option<Vec<String>>,
    pub session_idle_secs: Option<u64>,
    pub conversation_idle_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub auth_timeout_secs: Option<u64>,
    pub exchange_timeout_secs: Option<u64>,
    pub rate_limit_attempts: Option<u32>,
    pub rate_limit_base_delay_ms: Option<u64>,
    pub rate_limit_max_delay_ms: Option<u64>,
    pub history_limit: Option<usize>,
}

macro_rules! overlay_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_fields!(
            self,
            other,
            host,
            port,
            proxy,
            backend,
            backend_base_url,
            persona_prefixes,
            session_idle_secs,
            conversation_idle_secs,
            sweep_interval_secs,
            auth_timeout_secs,
            exchange_timeout_secs,
            rate_limit_attempts,
            rate_limit_base_delay_ms,
            rate_limit_max_delay_ms,
            history_limit,
        );
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let config = GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            proxy: self.proxy,
            backend: self.backend.unwrap_or_default(),
            backend_base_url: self
                .backend_base_url
                .unwrap_or_else(|| DEFAULT_BACKEND_BASE_URL.to_string()),
            persona_prefixes: self
                .persona_prefixes
                .unwrap_or_else(|| vec![DEFAULT_PERSONA_PREFIX.to_string()]),
            session_idle_secs: self.session_idle_secs.unwrap_or(30 * 60),
            conversation_idle_secs: self.conversation_idle_secs.unwrap_or(24 * 60 * 60),
            sweep_interval_secs: self.sweep_interval_secs.unwrap_or(60),
            auth_timeout_secs: self.auth_timeout_secs.unwrap_or(30),
            exchange_timeout_secs: self.exchange_timeout_secs.unwrap_or(120),
            rate_limit_attempts: self.rate_limit_attempts.unwrap_or(3),
            rate_limit_base_delay_ms: self.rate_limit_base_delay_ms.unwrap_or(500),
            rate_limit_max_delay_ms: self.rate_limit_max_delay_ms.unwrap_or(8_000),
            history_limit: self.history_limit.unwrap_or(32),
        };
        config.validate()?;
        Ok(config)
    }
}

impl GlobalConfig {
    fn validate(&self) -> Result<(), GlobalConfigError> {
        if self.backend_base_url.trim().is_empty() {
            return Err(GlobalConfigError::MissingField("backend_base_url"));
        }
        if self.rate_limit_attempts == 0 {
            return Err(GlobalConfigError::Invalid {
                field: "rate_limit_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.session_idle_secs == 0 {
            return Err(GlobalConfigError::Invalid {
                field: "session_idle_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(GlobalConfigError::Invalid {
                field: "sweep_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            proxy: value.proxy,
            backend: Some(value.backend),
            backend_base_url: Some(value.backend_base_url),
            persona_prefixes: Some(value.persona_prefixes),
            session_idle_secs: Some(value.session_idle_secs),
            conversation_idle_secs: Some(value.conversation_idle_secs),
            sweep_interval_secs: Some(value.sweep_interval_secs),
            auth_timeout_secs: Some(value.auth_timeout_secs),
            exchange_timeout_secs: Some(value.exchange_timeout_secs),
            rate_limit_attempts: Some(value.rate_limit_attempts),
            rate_limit_base_delay_ms: Some(value.rate_limit_base_delay_ms),
            rate_limit_max_delay_ms: Some(value.rate_limit_max_delay_ms),
            history_limit: Some(value.history_limit),
        }
    }
}
