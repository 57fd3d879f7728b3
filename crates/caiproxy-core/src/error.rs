use std::fmt;

use bytes::Bytes;
use http::StatusCode;
use tracing::error;

use caiproxy_protocol::error::ErrorResponse;
use caiproxy_provider_core::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authentication,
    MethodNotAllowed,
    NotFound,
    Backend,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Backend | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "invalid_request_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::MethodNotAllowed => "method_not_allowed",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::Backend => "backend_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MethodNotAllowed, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend, message)
    }

    /// The detail is logged; the caller only sees a generic message.
    pub fn internal(detail: impl fmt::Display) -> Self {
        error!(event = "internal_error", detail = %detail);
        Self::new(ErrorKind::Internal, "internal server error")
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }

    pub fn to_response(&self) -> ErrorResponse {
        let body = ErrorResponse::new(self.kind.type_str(), self.message.clone());
        match &self.code {
            Some(code) => body.with_code(code.clone()),
            None => body,
        }
    }

    pub fn to_json_bytes(&self) -> Bytes {
        match serde_json::to_vec(&self.to_response()) {
            Ok(body) => Bytes::from(body),
            Err(_) => Bytes::from_static(
                br#"{"error":{"message":"internal server error","type":"internal_error"}}"#,
            ),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.type_str(), self.message)
    }
}

impl std::error::Error for ProxyError {}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        let code = err.code();
        let kind = match err {
            BackendError::Authentication(_) => ErrorKind::Authentication,
            _ => ErrorKind::Backend,
        };
        ProxyError::new(kind, err.to_string()).with_code(code)
    }
}
