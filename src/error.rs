//! Platform error classification and JSON error responses

use crate::diagnostics::LogEntry;
use crate::instance::{full, InstanceIdentity, InstanceResponse};
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Failure reported by a container runtime.
///
/// Runtimes translate their raw failures (client errors, spawn errors,
/// Docker API errors) into one of these kinds before the core sees them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// The instance's port is not accepting connections yet
    #[error("container port is not listening: {0}")]
    NotListening(String),
    /// The platform refused to provide an instance
    #[error("there is no container instance that can be provided: {0}")]
    NoCapacity(String),
    /// A ready instance became unreachable while forwarding a request
    #[error("container became unreachable: {0}")]
    ProxyUnreachable(String),
    /// Anything else. Never retried.
    #[error("{0}")]
    Unknown(String),
}

impl PlatformError {
    /// Whether the failure is recovered by retrying after a delay
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::NotListening(_) | PlatformError::ProxyUnreachable(_)
        )
    }
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Readiness gave up on the instance
    InstanceUnavailable,
    /// The platform refused capacity while forwarding
    NoCapacity,
    /// The instance stopped answering after it was ready
    ProxyUnreachable,
    /// The inbound request could not be read
    BadRequest,
    /// Request timed out waiting for the instance
    RequestTimeout,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InstanceUnavailable => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoCapacity => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ProxyUnreachable => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InstanceUnavailable => "INSTANCE_UNAVAILABLE",
            ProxyErrorCode::NoCapacity => "NO_CAPACITY",
            ProxyErrorCode::ProxyUnreachable => "PROXY_UNREACHABLE",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Code for a forwarding failure
    pub fn for_forward_error(error: &PlatformError) -> Self {
        match error {
            PlatformError::NoCapacity(_) => ProxyErrorCode::NoCapacity,
            PlatformError::NotListening(_) | PlatformError::ProxyUnreachable(_) => {
                ProxyErrorCode::ProxyUnreachable
            }
            PlatformError::Unknown(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
    /// Instance the error concerns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<InstanceIdentity>,
    /// Diagnostic log of the instance at the time of the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogEntry>>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            identity: None,
            logs: None,
        }
    }

    pub fn with_identity(mut self, identity: &InstanceIdentity) -> Self {
        self.identity = Some(identity.clone());
        self
    }

    pub fn with_logs(mut self, logs: Vec<LogEntry>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }

    /// Render as an HTTP response with X-Proxy-Error header
    pub fn into_response(self) -> InstanceResponse {
        let status = self.code.status_code();
        let header = self.code.as_header_value();
        let body = self.to_json();

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("X-Proxy-Error", header)
            .body(full(body))
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> InstanceResponse {
    ErrorResponse::new(code, message).into_response()
}
