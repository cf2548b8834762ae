//! In-memory priority queue with anti-starvation aging.
//!
//! Dequeue order is decided at scan time: every `take` recomputes each
//! entry's score with one shared evaluation instant and removes the maximum
//! (ties go to the earlier arrival). Nothing about enqueue order survives
//! except as the tie-break, which is what bounds starvation: age grows
//! without limit while the size penalty is fixed.
//!
//! The queue is strictly in-memory and single-process; dropping it on
//! shutdown loses pending requests by design.

mod request;

pub use request::{QueuedRequest, RequestKind};

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{FileMeshError, Result};

struct Entry {
    request: QueuedRequest,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    ids: HashSet<String>,
    next_seq: u64,
}

/// Observability row returned by [`PriorityQueue::peek_all`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryView {
    /// Request id.
    pub id: String,
    /// File the request refers to.
    pub file_id: String,
    /// Operation kind.
    pub kind: RequestKind,
    /// Declared size in bytes.
    pub size_bytes: u64,
    /// Score at the time of the peek.
    pub score: f64,
}

/// Bounded or unbounded priority queue shared by the API and the workers.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: Option<usize>,
    age_factor: f64,
    size_factor: f64,
}

impl PriorityQueue {
    /// Build a queue. `capacity = None` means unbounded.
    pub fn new(capacity: Option<usize>, age_factor: f64, size_factor: f64) -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
            age_factor,
            size_factor,
        }
    }

    /// Queue with the default scoring coefficients.
    pub fn with_defaults() -> Self {
        Self::new(None, 0.1, 1.0)
    }

    /// Non-blocking enqueue.
    ///
    /// Fails with `QueueFull` iff a capacity bound is configured and
    /// reached, and rejects an id already present in the queue.
    pub fn offer(&self, request: QueuedRequest) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(cap) = self.capacity {
                if inner.entries.len() >= cap {
                    return Err(FileMeshError::QueueFull);
                }
            }
            if !inner.ids.insert(request.id.clone()) {
                return Err(FileMeshError::BadRequest(format!(
                    "request id '{}' is already queued",
                    request.id
                )));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            debug!(request = %request.id, kind = request.kind.as_str(), seq, "request queued");
            inner.entries.push(Entry { request, seq });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Await the highest-scored entry; `None` when the token cancels first.
    pub async fn take(&self, cancel: &CancellationToken) -> Option<QueuedRequest> {
        loop {
            // Register for notification before scanning so an offer landing
            // between the scan and the await still wakes this taker.
            let notified = self.notify.notified();
            if let Some(request) = self.try_take() {
                return Some(request);
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Remove and return the highest-scored entry, if any.
    pub fn try_take(&self) -> Option<QueuedRequest> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let best = inner
            .entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| self.compare(a, b, now))
            .map(|(i, _)| i)?;
        let entry = inner.entries.remove(best);
        inner.ids.remove(&entry.request.id);
        Some(entry.request)
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Scored view of every entry, for the sensor and the status surface.
    pub fn peek_all(&self) -> Vec<QueueEntryView> {
        let inner = self.inner.lock();
        let now = Instant::now();
        inner
            .entries
            .iter()
            .map(|e| QueueEntryView {
                id: e.request.id.clone(),
                file_id: e.request.file_id.clone(),
                kind: e.request.kind,
                size_bytes: e.request.size_bytes,
                score: e.request.score_at(now, self.age_factor, self.size_factor),
            })
            .collect()
    }

    fn compare(&self, a: &Entry, b: &Entry, now: Instant) -> CmpOrdering {
        let sa = a.request.score_at(now, self.age_factor, self.size_factor);
        let sb = b.request.score_at(now, self.age_factor, self.size_factor);
        sa.partial_cmp(&sb)
            .unwrap_or(CmpOrdering::Equal)
            // On equal scores the earlier seq must win; report the earlier
            // entry as the greater one so max_by picks it.
            .then_with(|| b.seq.cmp(&a.seq))
    }
}
