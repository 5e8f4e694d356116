//! Error types and HTTP response conversion
//!
//! Every fallible path in the core funnels into [`Error`]. Each variant maps
//! to a fixed HTTP status and a stable string code in REST responses; internal
//! detail stays in the log chain and never reaches response bodies.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error taxonomy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is missing or invalid
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A required transport (MQTT, KNX daemon) is not connected
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Establishing a connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A write to an external sink (TSDB, bus, broker) failed
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or state conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or invalid credentials
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated but not permitted
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Rate limit exceeded; carries the retry-after hint in seconds
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request payload failed validation
    #[error("validation: {0}")]
    Validation(String),

    /// An operation exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Anything that should never surface as-is to a client
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for REST responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::NotConnected(_) => "not_connected",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::Validation(_) => "validation",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotConnected(_) | Self::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::WriteFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when the variant is safe to echo to the client verbatim
    fn client_safe(&self) -> bool {
        !matches!(self, Self::Internal(_) | Self::ConfigInvalid(_))
    }

    /// Predicate for sentinel checks without destructuring
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Predicate for auth failures (401/403)
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Unauthenticated(_) | Self::Forbidden(_))
    }
}

/// JSON error body returned by every REST endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        }

        let message = if self.client_safe() {
            self.to_string()
        } else {
            "internal error".to_string()
        };

        let body = Json(ErrorBody {
            error: self.code().to_string(),
            message,
        });

        let mut response = (status, body).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict("unique constraint violated".to_string())
            }
            sqlx::Error::PoolTimedOut => Self::Timeout("database pool acquire".to_string()),
            _ => Self::Internal(format!("database: {err}")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid JSON: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(format!("http: {err}"))
        } else if err.is_connect() {
            Self::ConnectionFailed(format!("http: {err}"))
        } else {
            Self::WriteFailed(format!("http: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::RateLimited { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn internal_detail_never_leaks() {
        let err = Error::Internal("database password is hunter2".into());
        assert!(!err.client_safe());
    }

    #[test]
    fn sentinel_predicates() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::Conflict("x".into()).is_not_found());
        assert!(Error::Unauthenticated("x".into()).is_denied());
        assert!(Error::Forbidden("x".into()).is_denied());
        assert!(!Error::Timeout("x".into()).is_denied());
    }

    #[test]
    fn codes_are_snake_case() {
        for err in [
            Error::NotConnected("x".into()),
            Error::WriteFailed("x".into()),
            Error::Timeout("x".into()),
        ] {
            let code = err.code();
            assert!(code.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
