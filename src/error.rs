//! Error types for the proxy.
//!
//! `ErrorKind` is the closed taxonomy classified requests fall into (see
//! `retry::classifier`). `AppError` is the request-facing error surfaced to
//! axum handlers; `IntoResponse` renders it as a Claude-compatible error body.
//! `StartupError` is a separate, smaller enum for failures before the server
//! is serving traffic, mapped to process exit codes in `main`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Closed taxonomy of request failure kinds, numbered for stable wire logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unknown = 0,
    Network = 1,
    Timeout = 2,
    Http4xx = 3,
    Server5xx = 4,
    Stream = 5,
    Auth = 6,
    RateLimit = 7,
    Parsing = 8,
    ClientCancel = 9,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Http4xx => "http-4xx",
            Self::Server5xx => "server-5xx",
            Self::Stream => "stream",
            Self::Auth => "auth",
            Self::RateLimit => "rate-limit",
            Self::Parsing => "parsing",
            Self::ClientCancel => "client-cancel",
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Request-facing error type. Errors that reach this enum are terminal: the
/// retry controller has already exhausted retry/switch/suspend options.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no endpoint available: {0}")]
    NoEndpointAvailable(String),

    #[error("upstream error ({status}): {message}")]
    Upstream { status: StatusCode, message: String },

    #[error("request timed out after {timeout_seconds}s")]
    Timeout { timeout_seconds: u64 },

    #[error("rate limited")]
    RateLimited,

    #[error("authentication failed upstream")]
    AuthFailed,

    #[error("suspension queue is full")]
    SuspensionQueueFull,

    #[error("request cancelled by client")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The `ErrorKind` a given `AppError` corresponds to, used when the
    /// lifecycle record's final status needs the taxonomy code alongside the
    /// HTTP status actually returned to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Http4xx,
            Self::NoEndpointAvailable(_) => ErrorKind::Server5xx,
            Self::Upstream { status, .. } if status.is_client_error() => ErrorKind::Http4xx,
            Self::Upstream { .. } => ErrorKind::Server5xx,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited => ErrorKind::RateLimit,
            Self::AuthFailed => ErrorKind::Auth,
            Self::SuspensionQueueFull => ErrorKind::Server5xx,
            Self::Cancelled => ErrorKind::ClientCancel,
            Self::Internal(_) => ErrorKind::Unknown,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg.clone()),
            Self::NoEndpointAvailable(msg) => {
                (StatusCode::BAD_GATEWAY, "api_error", msg.clone())
            }
            Self::Upstream { status, message } => (*status, "api_error", message.clone()),
            Self::Timeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                self.to_string(),
            ),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                self.to_string(),
            ),
            Self::AuthFailed => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            Self::SuspensionQueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                self.to_string(),
            ),
            Self::Cancelled => (StatusCode::BAD_REQUEST, "cancelled", self.to_string()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", msg.clone()),
        };

        let body = Json(serde_json::json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures before the server starts serving traffic. Mapped to process exit
/// codes in `main` (0 clean shutdown, 1 config, 2 bind, 3 durable store).
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to load configuration: {0}")]
    Config(String),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open durable store at {path}: {source}")]
    Store {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Bind { .. } => 2,
            Self::Store { .. } => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_returns_400() {
        let err = AppError::Validation("missing field".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn timeout_error_returns_504() {
        let err = AppError::Timeout { timeout_seconds: 30 };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn rate_limited_returns_429() {
        let err = AppError::RateLimited;
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn auth_failed_returns_401() {
        let err = AppError::AuthFailed;
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn upstream_4xx_classifies_http4xx() {
        let err = AppError::Upstream {
            status: StatusCode::NOT_FOUND,
            message: "not found".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Http4xx);
    }

    #[test]
    fn upstream_5xx_classifies_server5xx() {
        let err = AppError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: "bad gateway".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Server5xx);
    }

    #[test]
    fn startup_exit_codes_match_spec() {
        assert_eq!(StartupError::Config("x".into()).exit_code(), 1);
        assert_eq!(
            StartupError::Bind {
                addr: "0.0.0.0:3000".into(),
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            }
            .exit_code(),
            2
        );
    }

    #[test]
    fn error_kind_codes_are_stable() {
        assert_eq!(ErrorKind::Unknown.code(), 0);
        assert_eq!(ErrorKind::ClientCancel.code(), 9);
    }
}
