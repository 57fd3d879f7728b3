use std::time::Duration;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend refused the credential. Never cached by the registry.
    #[error("backend rejected the credential: {0}")]
    Authentication(String),
    /// The backend refused to continue a conversation handle.
    #[error("backend rejected conversation continuation: {0}")]
    ContinuationRejected(String),
    #[error("backend rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("backend {0} timed out")]
    Timeout(&'static str),
    #[error("backend transport error: {0}")]
    Transport(String),
    #[error("malformed backend reply: {0}")]
    Malformed(String),
    #[error("backend returned no reply text")]
    EmptyReply,
    #[error("unsupported backend operation: {0}")]
    Unsupported(&'static str),
    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },
}

impl BackendError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, BackendError::Authentication(_))
    }

    pub fn is_continuation_rejected(&self) -> bool {
        matches!(self, BackendError::ContinuationRejected(_))
    }

    pub fn retry_after(&self) -> Option<Option<Duration>> {
        match self {
            BackendError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short machine-readable tag used in logs and error codes.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Authentication(_) => "backend_auth_failed",
            BackendError::ContinuationRejected(_) => "continuation_rejected",
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::Timeout(_) => "backend_timeout",
            BackendError::Transport(_) => "backend_transport",
            BackendError::Malformed(_) => "backend_malformed_reply",
            BackendError::EmptyReply => "empty_reply",
            BackendError::Unsupported(_) => "unsupported",
            BackendError::Status { .. } => "backend_status",
        }
    }
}
