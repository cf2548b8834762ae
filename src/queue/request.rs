//! Queued request model.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

/// What a queued request asks the backend to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Store a new file.
    Upload,
    /// Fetch a stored file.
    Download,
    /// Remove a stored file.
    Delete,
}

impl RequestKind {
    /// Lowercase label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Upload => "upload",
            RequestKind::Download => "download",
            RequestKind::Delete => "delete",
        }
    }
}

/// A client request waiting for dispatch.
///
/// Immutable after construction; the queue carries the payload only as a
/// cheap reference-counted handle. The effective priority is never stored —
/// it is recomputed from `base_priority`, size, and age at every scan.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// Unique request id (correlation id on the forwarded call).
    pub id: String,
    /// File the request refers to.
    pub file_id: String,
    /// Declared file name; `None` for download/delete.
    pub file_name: Option<String>,
    /// Operation kind.
    pub kind: RequestKind,
    /// Declared payload size in bytes; 0 permitted for non-uploads.
    pub size_bytes: u64,
    /// Base priority; higher dispatches earlier.
    pub base_priority: i64,
    /// Monotonic arrival time.
    pub arrival: Instant,
    /// Opaque payload handle; `None` for bodyless operations.
    pub body: Option<Bytes>,
}

impl QueuedRequest {
    /// Build a request arriving now.
    pub fn new(
        id: impl Into<String>,
        file_id: impl Into<String>,
        kind: RequestKind,
        size_bytes: u64,
    ) -> Self {
        QueuedRequest {
            id: id.into(),
            file_id: file_id.into(),
            file_name: None,
            kind,
            size_bytes,
            base_priority: 0,
            arrival: Instant::now(),
            body: None,
        }
    }

    /// Attach the declared file name.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Override the base priority.
    pub fn with_base_priority(mut self, priority: i64) -> Self {
        self.base_priority = priority;
        self
    }

    /// Attach the payload handle.
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Backdate the arrival time. Used by re-enqueues to preserve aging and
    /// by tests to exercise aging without sleeping.
    pub fn with_arrival(mut self, arrival: Instant) -> Self {
        self.arrival = arrival;
        self
    }

    /// Age of the request at `now`.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.arrival)
    }

    /// Effective priority at `now`:
    /// `base + age_factor * age_seconds - size_factor * size_mib`.
    ///
    /// Age grows without bound while the size penalty is fixed, so every
    /// request eventually outscores fresh arrivals of equal configuration.
    pub fn score_at(&self, now: Instant, age_factor: f64, size_factor: f64) -> f64 {
        let age_secs = self.age_at(now).as_secs_f64();
        let size_mib = self.size_bytes as f64 / (1024.0 * 1024.0);
        self.base_priority as f64 + age_factor * age_secs - size_factor * size_mib
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn score_penalizes_size_and_rewards_age() {
        let now = Instant::now();
        let req = QueuedRequest::new("r1", "f1", RequestKind::Upload, 5 * MIB)
            .with_arrival(now - Duration::from_secs(60));
        // 0 + 0.1 * 60 - 1.0 * 5 = 1.0
        let score = req.score_at(now, 0.1, 1.0);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn base_priority_shifts_score() {
        let now = Instant::now();
        let req = QueuedRequest::new("r1", "f1", RequestKind::Download, 0)
            .with_base_priority(7)
            .with_arrival(now);
        assert!((req.score_at(now, 0.1, 1.0) - 7.0).abs() < 1e-9);
    }
}
