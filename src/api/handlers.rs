//! HTTP handlers for the balancer's file API.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::{AppState, FileMeta};
use crate::error::{FileMeshError, Result};
use crate::queue::{QueuedRequest, RequestKind};
use crate::registry::NodeStatus;
use crate::stats::{LbStats, StatsSnapshot};

/// Acknowledgement returned for every accepted request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAck {
    /// File the request refers to.
    pub file_id: String,
    /// Always `"queued"`.
    pub status: &'static str,
    /// Correlation id forwarded to the backend.
    pub request_id: String,
}

/// Payload of `GET /api/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Entries currently queued.
    pub queue_size: usize,
    /// Healthy backend nodes.
    pub healthy_nodes: usize,
    /// Registered backend nodes.
    pub total_nodes: usize,
    /// Active selection policy.
    pub scheduler: String,
    /// Seconds since process start.
    pub uptime_seconds: u64,
    /// Counter snapshot.
    pub stats: StatsSnapshot,
    /// Per-node detail.
    pub nodes: Vec<NodeStatus>,
}

/// `POST /api/files/upload`
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<QueuedAck>)> {
    let outcome = try_upload(&state, &headers, body);
    settle(&state, outcome.map(|ack| (StatusCode::CREATED, Json(ack))))
}

/// `GET /api/files/{file_id}/download`
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<(StatusCode, Json<QueuedAck>)> {
    let outcome = try_enqueue_by_id(&state, &file_id, RequestKind::Download);
    settle(&state, outcome.map(|ack| (StatusCode::OK, Json(ack))))
}

/// `DELETE /api/files/{file_id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<(StatusCode, Json<QueuedAck>)> {
    let outcome = try_enqueue_by_id(&state, &file_id, RequestKind::Delete);
    settle(&state, outcome.map(|ack| (StatusCode::OK, Json(ack))))
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queue_size: state.queue.len(),
        healthy_nodes: state.registry.healthy_count(),
        total_nodes: state.registry.len(),
        scheduler: state.scheduler.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        stats: state.stats.snapshot(),
        nodes: state.registry.status(),
    })
}

fn try_upload(state: &AppState, headers: &HeaderMap, body: Bytes) -> Result<QueuedAck> {
    let name = required_header(headers, "X-File-Name")?;
    sanitize_file_name(&name)?;
    let file_id = required_header(headers, "X-File-ID")?;
    validate_file_id(&file_id)?;
    let size: u64 = required_header(headers, "X-File-Size")?
        .parse()
        .map_err(|_| FileMeshError::BadRequest("X-File-Size is not an integer".into()))?;
    if size > state.max_file_size {
        return Err(FileMeshError::PayloadTooLarge {
            size,
            max: state.max_file_size,
        });
    }

    let request_id = Uuid::new_v4().to_string();
    let request = QueuedRequest::new(request_id.clone(), file_id.clone(), RequestKind::Upload, size)
        .with_file_name(name.clone())
        .with_body(body);
    state.queue.offer(request)?;
    state.files.insert(file_id.clone(), FileMeta { name, size });
    debug!(file = %file_id, request = %request_id, size, "upload queued");

    Ok(QueuedAck {
        file_id,
        status: "queued",
        request_id,
    })
}

fn try_enqueue_by_id(state: &AppState, file_id: &str, kind: RequestKind) -> Result<QueuedAck> {
    validate_file_id(file_id)?;
    let meta = state
        .files
        .get(file_id)
        .ok_or_else(|| FileMeshError::NotFound(format!("file '{file_id}'")))?;

    let request_id = Uuid::new_v4().to_string();
    let request = QueuedRequest::new(request_id.clone(), file_id, kind, meta.size)
        .with_file_name(meta.name);
    state.queue.offer(request)?;
    if kind == RequestKind::Delete {
        state.files.remove(file_id);
    }
    debug!(file = %file_id, request = %request_id, kind = kind.as_str(), "request queued");

    Ok(QueuedAck {
        file_id: file_id.to_string(),
        status: "queued",
        request_id,
    })
}

fn settle<T>(state: &AppState, outcome: Result<T>) -> Result<T> {
    match &outcome {
        Ok(_) => LbStats::inc(&state.stats.accepted),
        Err(_) => LbStats::inc(&state.stats.rejected),
    }
    outcome
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(name)
        .ok_or_else(|| FileMeshError::BadRequest(format!("missing {name} header")))?
        .to_str()
        .map(str::to_owned)
        .map_err(|_| FileMeshError::BadRequest(format!("{name} header is not valid text")))
}

/// Reject names that could escape the backend's storage root.
fn sanitize_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FileMeshError::BadRequest("file name is empty".into()));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(FileMeshError::BadRequest(
            "file name must not contain path separators or '..'".into(),
        ));
    }
    Ok(())
}

/// File ids are opaque but must stay a single clean path segment.
fn validate_file_id(file_id: &str) -> Result<()> {
    if file_id.is_empty() {
        return Err(FileMeshError::BadRequest("file id is empty".into()));
    }
    let clean = file_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !clean || file_id.contains("..") {
        return Err(FileMeshError::BadRequest(format!(
            "file id '{file_id}' is not a canonical identifier"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_sanitization_rejects_traversal() {
        assert!(sanitize_file_name("report.pdf").is_ok());
        assert!(sanitize_file_name("../etc/passwd").is_err());
        assert!(sanitize_file_name("a/b").is_err());
        assert!(sanitize_file_name("a\\b").is_err());
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("").is_err());
    }

    #[test]
    fn file_id_must_be_canonical() {
        assert!(validate_file_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_file_id("file_1.bin").is_ok());
        assert!(validate_file_id("").is_err());
        assert!(validate_file_id("a/b").is_err());
        assert!(validate_file_id("a..b").is_err());
        assert!(validate_file_id("a b").is_err());
    }
}
