//! Priority queue ordering and blocking semantics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use filemesh::queue::{PriorityQueue, QueuedRequest, RequestKind};

const MIB: u64 = 1024 * 1024;

#[test]
fn priority_beats_fifo() {
    // R1 (100 MiB) offered before R2 (1 MiB); the smaller request wins.
    let queue = PriorityQueue::with_defaults();
    queue
        .offer(QueuedRequest::new("r1", "f1", RequestKind::Upload, 100 * MIB))
        .unwrap();
    queue
        .offer(QueuedRequest::new("r2", "f2", RequestKind::Upload, MIB))
        .unwrap();

    assert_eq!(queue.try_take().unwrap().id, "r2");
    assert_eq!(queue.try_take().unwrap().id, "r1");
}

#[test]
fn aging_flips_priority() {
    // A 5 MiB request aged 60 s scores 0 + 0.1*60 - 5 = 1.0 and beats a
    // fresh 1 MiB request scoring -1.0.
    let queue = PriorityQueue::with_defaults();
    let now = Instant::now();
    queue
        .offer(
            QueuedRequest::new("aged", "f1", RequestKind::Upload, 5 * MIB)
                .with_arrival(now - Duration::from_secs(60)),
        )
        .unwrap();
    queue
        .offer(QueuedRequest::new("fresh", "f2", RequestKind::Upload, MIB))
        .unwrap();

    assert_eq!(queue.try_take().unwrap().id, "aged");
    assert_eq!(queue.try_take().unwrap().id, "fresh");
}

#[test]
fn heavy_aging_still_loses_to_much_smaller_request() {
    // 100 MiB aged 60 s scores -94; a 1 MiB request aged 59.9 s scores ~4.99.
    let queue = PriorityQueue::with_defaults();
    let now = Instant::now();
    queue
        .offer(
            QueuedRequest::new("huge", "f1", RequestKind::Upload, 100 * MIB)
                .with_arrival(now - Duration::from_secs(60)),
        )
        .unwrap();
    queue
        .offer(
            QueuedRequest::new("small", "f2", RequestKind::Upload, MIB)
                .with_arrival(now - Duration::from_millis(59_900)),
        )
        .unwrap();

    assert_eq!(queue.try_take().unwrap().id, "small");
}

#[test]
fn anti_starvation_score_overtakes_any_fresh_peer() {
    // For a fixed request, age contribution is unbounded while the size
    // penalty is constant, so a backlog of fresh equal-sized requests can
    // never hold it back forever.
    let now = Instant::now();
    let old = QueuedRequest::new("old", "f", RequestKind::Upload, 500 * MIB)
        .with_arrival(now - Duration::from_secs(5001));
    let fresh = QueuedRequest::new("fresh", "f", RequestKind::Upload, 500 * MIB);
    assert!(old.score_at(now, 0.1, 1.0) > fresh.score_at(now, 0.1, 1.0));
}

#[tokio::test]
async fn empty_queue_take_suspends_until_offer() {
    let queue = Arc::new(PriorityQueue::with_defaults());
    let cancel = CancellationToken::new();

    let taker = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.take(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!taker.is_finished(), "take() must suspend on an empty queue");

    queue
        .offer(QueuedRequest::new("r1", "f1", RequestKind::Download, 0))
        .unwrap();
    assert_eq!(taker.await.unwrap().unwrap().id, "r1");
}

#[tokio::test]
async fn shutdown_wakes_all_blocked_takers() {
    let queue = Arc::new(PriorityQueue::with_defaults());
    let cancel = CancellationToken::new();

    let takers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.take(&cancel).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    for taker in takers {
        assert!(taker.await.unwrap().is_none());
    }
}

proptest! {
    /// Equal-priority, equal-size requests always dequeue in arrival order.
    #[test]
    fn fifo_among_equals(count in 1usize..30) {
        let queue = PriorityQueue::with_defaults();
        let now = Instant::now();
        for i in 0..count {
            queue
                .offer(
                    QueuedRequest::new(format!("r{i}"), "f", RequestKind::Upload, 8 * MIB)
                        .with_arrival(now),
                )
                .unwrap();
        }
        for i in 0..count {
            prop_assert_eq!(queue.try_take().unwrap().id, format!("r{i}"));
        }
    }

    /// Whatever the mix of sizes, the dequeued entry always carries the
    /// maximum current score.
    #[test]
    fn dequeue_returns_max_score(sizes in prop::collection::vec(0u64..2048, 1..20)) {
        let queue = PriorityQueue::with_defaults();
        let now = Instant::now();
        for (i, size) in sizes.iter().enumerate() {
            queue
                .offer(
                    QueuedRequest::new(format!("r{i}"), "f", RequestKind::Upload, size * MIB)
                        .with_arrival(now),
                )
                .unwrap();
        }
        let min_size = *sizes.iter().min().unwrap();
        let taken = queue.try_take().unwrap();
        prop_assert_eq!(taken.size_bytes, min_size * MIB);
    }
}
