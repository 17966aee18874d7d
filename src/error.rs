use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error codes carried across the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Transport,
    InvalidArgument,
    DeadlineExceeded,
    Internal,
    /// The lock or token is no longer valid. Never retryable.
    Unavailable,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Transport => 2,
            ErrorCode::InvalidArgument => 3,
            ErrorCode::DeadlineExceeded => 4,
            ErrorCode::Internal => 13,
            ErrorCode::Unavailable => 14,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            2 => Some(ErrorCode::Transport),
            3 => Some(ErrorCode::InvalidArgument),
            4 => Some(ErrorCode::DeadlineExceeded),
            13 => Some(ErrorCode::Internal),
            14 => Some(ErrorCode::Unavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timed out after {timeout_ms}ms waiting for lock '{key}'")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("Lock no longer valid: {0}")]
    LockReleased(String),

    #[error("Transport error ({code:?}): {message}")]
    Transport { code: ErrorCode, message: String },

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Request queue closed before the request completed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn transport(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::InvalidArgument,
            Error::LockTimeout { .. } => ErrorCode::DeadlineExceeded,
            Error::LockReleased(_) => ErrorCode::Unavailable,
            Error::Transport { code, .. } => *code,
            Error::Redis(_) | Error::Configuration(_) | Error::QueueClosed | Error::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Only transient transport failures and lock waits are worth another
    /// attempt. Stale resources, bad input and local faults are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { code, .. } => *code != ErrorCode::Unavailable,
            Error::LockTimeout { .. } => true,
            _ => false,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::transport(ErrorCode::Transport, err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Validation(err.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::Validation(_) => "validation_error",
            Error::LockTimeout { .. } => "lock_timeout",
            Error::LockReleased(_) => "lock_released",
            Error::Transport { .. } => "transport_error",
            Error::Redis(_) => "service_unavailable",
            Error::Configuration(_) => "configuration_error",
            Error::QueueClosed | Error::Internal(_) => "internal_error",
        };
        Self::new(kind, &err.to_string(), err.code().as_u16())
    }

    /// Rebuilds the error on the client side of the RPC boundary.
    pub fn into_error(self) -> Error {
        match self.error.as_str() {
            "validation_error" => Error::Validation(self.message),
            "lock_timeout" => Error::LockTimeout {
                key: String::new(),
                timeout_ms: 0,
            },
            "lock_released" => Error::LockReleased(self.message),
            _ => Error::transport(
                ErrorCode::from_u16(self.code).unwrap_or(ErrorCode::Transport),
                self.message,
            ),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::LockTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Error::LockReleased(_) => StatusCode::CONFLICT,
            Error::Transport { .. } => StatusCode::BAD_GATEWAY,
            Error::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(ErrorResponse::from_error(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_and_lock_waits_are_retryable() {
        assert!(!Error::LockReleased("token".into()).is_retryable());
        assert!(!Error::transport(ErrorCode::Unavailable, "gone").is_retryable());
        assert!(Error::transport(ErrorCode::Transport, "503").is_retryable());
        assert!(Error::LockTimeout {
            key: "identify".into(),
            timeout_ms: 10
        }
        .is_retryable());
    }

    #[test]
    fn test_local_faults_are_final() {
        assert!(!Error::Validation("bad method".into()).is_retryable());
        assert!(!Error::Configuration("port".into()).is_retryable());
        assert!(!Error::Internal("poisoned".into()).is_retryable());
        assert!(!Error::Redis("down".into()).is_retryable());
        assert!(!Error::QueueClosed.is_retryable());
    }

    #[test]
    fn test_error_response_round_trip_keeps_kind() {
        let released = ErrorResponse::from_error(&Error::LockReleased("x".into()));
        assert_eq!(released.code, 14);
        assert!(matches!(released.into_error(), Error::LockReleased(_)));

        let timeout = ErrorResponse::from_error(&Error::LockTimeout {
            key: "identify".into(),
            timeout_ms: 50,
        });
        assert!(matches!(timeout.into_error(), Error::LockTimeout { .. }));

        let invalid = ErrorResponse::from_error(&Error::Validation("missing".into()));
        assert!(matches!(invalid.into_error(), Error::Validation(_)));
    }
}
