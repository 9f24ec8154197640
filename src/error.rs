//! Gateway error types with HTTP and protocol status mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Each variant
//! maps to a numeric error code, an HTTP status code for the REST surface and
//! a [`StatusCode`] category that is reported to stream clients inside
//! `OperationProcessed` acknowledgements.

use axum::http::StatusCode as HttpStatus;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Structured JSON error response body.
///
/// All REST error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "device not found: dev-1",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see [`GatewayError`] code ranges).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Transport-independent status category reported to stream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Operation succeeded.
    Ok,
    /// Referenced subscription, device or resource does not exist or is not visible.
    NotFound,
    /// Caller is not allowed to perform the operation.
    PermissionDenied,
    /// Request is malformed or cannot be satisfied as stated.
    InvalidArgument,
    /// Unexpected server-side failure.
    Internal,
    /// An upstream dependency (store, bus, transport) is unreachable.
    Unavailable,
}

/// Server-side error enum with status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category              | HTTP Status                  |
/// |-----------|-----------------------|------------------------------|
/// | 1000–1999 | Validation / Protocol | 400 Bad Request / 403        |
/// | 2000–2999 | State / Not Found     | 404 Not Found / 409 Conflict |
/// | 3000–3999 | Server / Upstream     | 500 / 503                    |
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Device, resource or subscription is unknown, or excluded by owner scoping.
    #[error("not found: {0}")]
    NotFound(String),

    /// Subscription filter matches no capability of the selected variant.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Operation token or subscription reused after it was already resolved.
    #[error("duplicate operation: {0}")]
    DuplicateOperation(String),

    /// Event store or bus unreachable.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Event type delivered to a subscription that never declared it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Caller has no authenticated owner or may not touch the target.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Duplex stream failed while sending or receiving.
    #[error("transport error: {0}")]
    Transport(String),

    /// Append raced with another writer on the same aggregate.
    #[error("version conflict on {aggregate}: expected {expected}, got {actual}")]
    VersionConflict {
        /// Aggregate identifier.
        aggregate: String,
        /// Version the writer expected to append.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Server ended a subscription with a reason.
    #[error("subscription canceled: {0}")]
    Canceled(String),

    /// Operation got no reply in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::InvalidSubscription(_) => 1002,
            Self::ProtocolViolation(_) => 1003,
            Self::DuplicateOperation(_) => 1004,
            Self::PermissionDenied(_) => 1005,
            Self::NotFound(_) => 2001,
            Self::VersionConflict { .. } => 2002,
            Self::Canceled(_) => 2003,
            Self::Internal(_) => 3000,
            Self::PersistenceError(_) => 3001,
            Self::UpstreamUnavailable(_) => 3002,
            Self::Transport(_) => 3003,
            Self::Timeout(_) => 3004,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn http_status(&self) -> HttpStatus {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidSubscription(_)
            | Self::ProtocolViolation(_)
            | Self::DuplicateOperation(_) => HttpStatus::BAD_REQUEST,
            Self::PermissionDenied(_) => HttpStatus::FORBIDDEN,
            Self::NotFound(_) => HttpStatus::NOT_FOUND,
            Self::VersionConflict { .. } => HttpStatus::CONFLICT,
            Self::Canceled(_) => HttpStatus::GONE,
            Self::PersistenceError(_) | Self::Internal(_) => HttpStatus::INTERNAL_SERVER_ERROR,
            Self::UpstreamUnavailable(_) | Self::Transport(_) => HttpStatus::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => HttpStatus::GATEWAY_TIMEOUT,
        }
    }

    /// Returns the protocol status category reported to stream clients.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NotFound,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::InvalidRequest(_)
            | Self::InvalidSubscription(_)
            | Self::ProtocolViolation(_)
            | Self::DuplicateOperation(_)
            | Self::VersionConflict { .. } => StatusCode::InvalidArgument,
            Self::UpstreamUnavailable(_) | Self::Transport(_) | Self::Timeout(_) => {
                StatusCode::Unavailable
            }
            Self::Canceled(_) | Self::PersistenceError(_) | Self::Internal(_) => StatusCode::Internal,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::UpstreamUnavailable(err.to_string())
            }
            other => Self::PersistenceError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
