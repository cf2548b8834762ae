//! Public HTTP surface of the load balancer.
//!
//! The API validates, enqueues, and acknowledges; it never talks to a
//! backend itself. Downloads and deletes are queued-mode: the caller gets
//! an ack and polls the front-end, the worker performs the backend call.

pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use dashmap::DashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::queue::PriorityQueue;
use crate::registry::NodeRegistry;
use crate::stats::LbStats;

/// Metadata the balancer keeps per accepted file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Declared file name.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
}

/// In-memory index of file ids this balancer has accepted uploads for.
///
/// Deliberately non-durable: it exists so download/delete can 404 on ids
/// the cluster has never seen, and to give queued downloads their size for
/// scoring. A restart forgets it, like the queue itself.
#[derive(Debug, Default)]
pub struct FileIndex {
    entries: DashMap<String, FileMeta>,
}

impl FileIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted upload.
    pub fn insert(&self, file_id: impl Into<String>, meta: FileMeta) {
        self.entries.insert(file_id.into(), meta);
    }

    /// Look up a file id.
    pub fn get(&self, file_id: &str) -> Option<FileMeta> {
        self.entries.get(file_id).map(|e| e.value().clone())
    }

    /// Remove a file id, returning its metadata.
    pub fn remove(&self, file_id: &str) -> Option<FileMeta> {
        self.entries.remove(file_id).map(|(_, meta)| meta)
    }

    /// Number of known files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The priority queue requests are admitted into.
    pub queue: Arc<PriorityQueue>,
    /// Backend node registry, for the health endpoint.
    pub registry: Arc<NodeRegistry>,
    /// Accepted-file index.
    pub files: Arc<FileIndex>,
    /// Shared counters.
    pub stats: Arc<LbStats>,
    /// Active policy name, reported by `/api/health`.
    pub scheduler: &'static str,
    /// Upload size bound in bytes.
    pub max_file_size: u64,
    /// Process start, for uptime reporting.
    pub started: Instant,
}

/// Build the public router.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_file_size as usize;
    Router::new()
        .route("/api/files/upload", post(handlers::upload_file))
        .route("/api/files/:file_id/download", get(handlers::download_file))
        .route("/api/files/:file_id", delete(handlers::delete_file))
        .route("/api/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
