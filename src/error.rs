//! Error types shared across the control plane.
//!
//! Every fallible operation in the library returns [`FileMeshError`]; the
//! binaries wrap top-level failures in `anyhow`. The HTTP status mapping for
//! the public API lives in one place here so handlers never hand-roll codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FileMeshError>;

/// All error kinds surfaced by the control plane.
#[derive(Debug, thiserror::Error)]
pub enum FileMeshError {
    /// Request validation failed (bad headers, malformed names, bad ids).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The referenced entity (node, file id) is not known.
    #[error("not found: {0}")]
    NotFound(String),

    /// An id is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Declared payload size exceeds the configured bound.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Declared size in bytes.
        size: u64,
        /// Configured maximum in bytes.
        max: u64,
    },

    /// The bounded request queue is at capacity.
    #[error("request queue is full")]
    QueueFull,

    /// No healthy backend node was available for dispatch.
    #[error("no healthy storage nodes available")]
    NoHealthyNodes,

    /// A forward to a backend node exceeded the forwarding timeout.
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// A backend node failed the forwarded request.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The message bus rejected or could not deliver a publish/subscribe.
    #[error("message bus unavailable: {0}")]
    BusUnavailable(String),

    /// A container runtime invocation failed.
    #[error("container runtime failure: {0}")]
    RuntimeFailure(String),

    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Anything that should not happen in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FileMeshError {
    /// Stable machine-readable code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            FileMeshError::BadRequest(_) => "bad_request",
            FileMeshError::NotFound(_) => "not_found",
            FileMeshError::AlreadyExists(_) => "already_exists",
            FileMeshError::PayloadTooLarge { .. } => "payload_too_large",
            FileMeshError::QueueFull => "queue_full",
            FileMeshError::NoHealthyNodes => "no_healthy_nodes",
            FileMeshError::UpstreamTimeout => "upstream_timeout",
            FileMeshError::Upstream(_) => "upstream_error",
            FileMeshError::BusUnavailable(_) => "bus_unavailable",
            FileMeshError::RuntimeFailure(_) => "runtime_failure",
            FileMeshError::ConfigInvalid(_) => "config_invalid",
            FileMeshError::Internal(_) => "internal",
        }
    }

    /// HTTP status the public API reports for this kind.
    pub fn status(&self) -> StatusCode {
        match self {
            FileMeshError::BadRequest(_) => StatusCode::BAD_REQUEST,
            FileMeshError::NotFound(_) => StatusCode::NOT_FOUND,
            FileMeshError::AlreadyExists(_) => StatusCode::CONFLICT,
            FileMeshError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            FileMeshError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            FileMeshError::NoHealthyNodes => StatusCode::SERVICE_UNAVAILABLE,
            FileMeshError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            FileMeshError::Upstream(_) => StatusCode::BAD_GATEWAY,
            FileMeshError::BusUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FileMeshError::RuntimeFailure(_)
            | FileMeshError::ConfigInvalid(_)
            | FileMeshError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for FileMeshError {
    fn from(err: config::ConfigError) -> Self {
        FileMeshError::ConfigInvalid(err.to_string())
    }
}

impl From<serde_json::Error> for FileMeshError {
    fn from(err: serde_json::Error) -> Self {
        FileMeshError::Internal(format!("serialization failure: {err}"))
    }
}

impl IntoResponse for FileMeshError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
