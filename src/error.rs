use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Error kinds per the worker error taxonomy. The variant carries enough
/// context for logs; client-visible text stays generic (`error_code` is the
/// stable machine-readable part of the contract).
#[derive(Debug)]
pub enum LakeError {
    Validation(String),
    Auth(String),
    UpstreamTransient(String),
    UpstreamRejected { status: u16, message: String },
    RateLimited { retry_after: Option<u64> },
    HotStore(String),
    ColdStore(String),
    Integrity(String),
    Timeout(String),
    CacheUnavailable(String),
    Internal(String),
}

impl LakeError {
    pub fn internal(err: impl fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Auth(_) => "auth_error",
            Self::UpstreamTransient(_) => "upstream_transient",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::RateLimited { .. } => "rate_limited",
            Self::HotStore(_) => "hot_store_error",
            Self::ColdStore(_) => "cold_store_error",
            Self::Integrity(_) => "integrity_error",
            Self::Timeout(_) => "timeout",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamRejected { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::HotStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ColdStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::CacheUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller of `retry()` should attempt this kind again.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTransient(_)
                | Self::RateLimited { .. }
                | Self::HotStore(_)
                | Self::ColdStore(_)
                | Self::Timeout(_)
        )
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Text safe to hand back to an HTTP client. Internal/store failures are
    /// flattened to a generic message; full detail stays in logs.
    fn client_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::Auth(msg) => msg.clone(),
            Self::UpstreamRejected { message, .. } => message.clone(),
            Self::RateLimited { .. } => "upstream rate limit exceeded".to_string(),
            Self::UpstreamTransient(_) => "upstream temporarily unavailable".to_string(),
            Self::HotStore(_) => "storage error".to_string(),
            Self::ColdStore(_) => "storage error".to_string(),
            Self::Integrity(_) => "data integrity check failed".to_string(),
            Self::Timeout(_) => "request timed out".to_string(),
            Self::CacheUnavailable(_) => "cache unavailable".to_string(),
            Self::Internal(_) => "internal server error".to_string(),
        }
    }
}

impl fmt::Display for LakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Auth(msg) => write!(f, "auth error: {msg}"),
            Self::UpstreamTransient(msg) => write!(f, "upstream transient: {msg}"),
            Self::UpstreamRejected { status, message } => {
                write!(f, "upstream rejected ({status}): {message}")
            }
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry_after={retry_after:?}")
            }
            Self::HotStore(msg) => write!(f, "hot store error: {msg}"),
            Self::ColdStore(msg) => write!(f, "cold store error: {msg}"),
            Self::Integrity(msg) => write!(f, "integrity error: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::CacheUnavailable(msg) => write!(f, "cache unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for LakeError {}

impl From<sqlx::Error> for LakeError {
    fn from(err: sqlx::Error) -> Self {
        Self::HotStore(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
    request_id: String,
}

impl IntoResponse for LakeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.error_code();
        let request_id = Uuid::new_v4().to_string();
        tracing::error!(
            error = %self,
            error_code,
            request_id = %request_id,
            status = %status,
            "request failed"
        );
        let body = ErrorBody {
            error: self.client_message(),
            error_code,
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

pub type LakeResult<T> = Result<T, LakeError>;
