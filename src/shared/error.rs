//! Crate-wide error taxonomy.
//!
//! Only `Transient` crosses a component boundary as retryable; every other
//! kind is terminal to the caller. Admin callers receive the structured
//! `{ error_code, message, correlation_id }` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Bad signature or bad JWT. Never retried, always audited by the caller.
    Auth(String),
    /// Unparsable payload, missing tenant, malformed field.
    Validation(String),
    /// Unknown tenant / channel / rule / asset.
    NotFound(String),
    /// Idempotency collision with a different payload.
    Conflict(String),
    /// Timeouts, 5xx, connection resets. Retryable in-process; 503 outward.
    Transient(String),
    /// Quota exhausted, unsupported format. Terminal, written to failure_reason.
    Permanent(String),
    /// Embedding failed, retrieval empty. Logged; pipeline continues degraded.
    Degraded(String),
}

impl AppError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "unauthorized",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient_error",
            Self::Permanent(_) => "permanent_error",
            Self::Degraded(_) => "degraded",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Permanent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Degraded(_) => StatusCode::OK,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Auth(m)
            | Self::Validation(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Transient(m)
            | Self::Permanent(m)
            | Self::Degraded(m) => m,
        }
    }

    /// Attach a correlation id for the response body.
    pub fn with_correlation(self, correlation_id: &str) -> CorrelatedError {
        CorrelatedError {
            error: self,
            correlation_id: correlation_id.to_string(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<diesel::result::Error> for AppError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => Self::NotFound("record not found".into()),
            other => Self::Transient(format!("database error: {}", other)),
        }
    }
}

impl From<diesel::r2d2::PoolError> for AppError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        Self::Transient(format!("connection pool exhausted: {}", err))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transient(format!("redis error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient(format!("http error: {}", err))
        } else {
            Self::Permanent(format!("http error: {}", err))
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error_code: &'a str,
    message: &'a str,
    correlation_id: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error_code(),
            message: self.message(),
            correlation_id: "",
        };
        (self.status_code(), Json(&body)).into_response()
    }
}

/// An error carrying the request correlation id, for admin responses.
#[derive(Debug)]
pub struct CorrelatedError {
    pub error: AppError,
    pub correlation_id: String,
}

impl IntoResponse for CorrelatedError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error.error_code(),
            message: self.error.message(),
            correlation_id: &self.correlation_id,
        };
        (self.error.status_code(), Json(&body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(AppError::Transient("timeout".into()).is_retryable());
        assert!(!AppError::Auth("bad signature".into()).is_retryable());
        assert!(!AppError::Permanent("quota".into()).is_retryable());
        assert!(!AppError::Conflict("payload mismatch".into()).is_retryable());
    }

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(
            AppError::Auth("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Transient("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err: AppError = diesel::result::Error::NotFound.into();
        assert_eq!(err.error_code(), "not_found");
    }
}
