//! Reconciler state machine.
//!
//! Pure and synchronous: the async driver owns every runtime call and bus
//! interaction and feeds the results back in. Keeping the transitions free
//! of I/O makes the fleet-bound invariant directly checkable — for any
//! sequence of intents, `MIN <= active <= MAX` holds after each one.

use std::collections::{BTreeMap, HashSet, VecDeque};

/// Hard cap on start attempts before a container is given up on.
pub const MAX_START_ATTEMPTS: u32 = 3;

/// Hard cap on stop attempts before the entry is dropped from tracking.
pub const MAX_STOP_ATTEMPTS: u32 = 3;

/// Deterministic container name for index `i`: `<prefix><i>`.
pub fn container_name(prefix: &str, index: u32) -> String {
    format!("{prefix}{index}")
}

/// Deterministic host port for index `i`: `base + i - 1`.
pub fn container_port(base_port: u16, index: u32) -> u16 {
    base_port + (index as u16) - 1
}

/// Index of a container name in the identity namespace, if it belongs.
pub fn parse_index(prefix: &str, name: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Lifecycle of a tracked container. `Stopped` is represented by absence:
/// entries are pruned the moment they reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Waiting for a successful runtime start.
    Requested {
        /// Failed start attempts so far.
        attempts: u32,
    },
    /// Started; waiting for the first successful inspect.
    Starting,
    /// Confirmed running.
    Running {
        /// Consecutive failed inspects.
        failed_inspects: u32,
    },
    /// Waiting for a successful runtime stop.
    Stopping {
        /// Failed stop attempts so far.
        attempts: u32,
    },
}

impl Lifecycle {
    /// Whether the entry counts against the fleet bounds.
    pub fn is_active(&self) -> bool {
        !matches!(self, Lifecycle::Stopping { .. })
    }
}

/// Outcome of applying a scale intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    /// The intent's seq was already processed; nothing changed.
    Duplicate,
    /// Scale-up accepted; these indices became `Requested`.
    ScaledUp(Vec<u32>),
    /// Scale-down accepted; these indices became `Stopping`.
    ScalingDown(Vec<u32>),
    /// The intent was fresh but the bounds left nothing to do.
    NoCapacity,
}

/// Outcome of a failed start or stop attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Try again later with this attempt count.
    Retry(u32),
    /// Attempt budget exhausted; the entry was removed.
    GaveUp,
}

/// Outcome of feeding an inspect result back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectOutcome {
    /// First successful inspect; `Starting` became `Running`.
    BecameRunning,
    /// Still waiting for the container to come up.
    StillStarting,
    /// Running and confirmed.
    Healthy,
    /// Running but this inspect failed; counter incremented.
    Degraded(u32),
    /// Failed inspects reached the reset bound; entry is `Requested` again.
    Restart,
    /// The index is not tracked (or not inspectable); nothing changed.
    Untracked,
}

/// Bounded window of already-seen intent sequence ids.
#[derive(Debug, Default)]
struct SeqWindow {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
    capacity: usize,
}

impl SeqWindow {
    fn new(capacity: usize) -> Self {
        SeqWindow {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a seq; returns `false` if it was already present.
    fn insert(&mut self, seq: u64) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// What the driver should do this tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickPlan {
    /// Indices to start, ascending, with their attempt counts.
    pub start: Vec<(u32, u32)>,
    /// Indices to stop, descending.
    pub stop: Vec<u32>,
    /// Indices to inspect (starting or running), ascending.
    pub inspect: Vec<u32>,
}

/// The desired/observed container set under `[min, max]` bounds.
#[derive(Debug)]
pub struct ReconcilerState {
    min: u32,
    max: u32,
    prefix: String,
    base_port: u16,
    unhealthy_reset: u32,
    containers: BTreeMap<u32, Lifecycle>,
    seq_seen: SeqWindow,
}

impl ReconcilerState {
    /// Empty state with the given bounds and identity namespace.
    pub fn new(
        min: u32,
        max: u32,
        prefix: impl Into<String>,
        base_port: u16,
        unhealthy_reset: u32,
    ) -> Self {
        debug_assert!(min >= 1 && max >= min);
        ReconcilerState {
            min,
            max,
            prefix: prefix.into(),
            base_port,
            unhealthy_reset,
            containers: BTreeMap::new(),
            seq_seen: SeqWindow::new(1024),
        }
    }

    /// Container name for an index.
    pub fn name(&self, index: u32) -> String {
        container_name(&self.prefix, index)
    }

    /// Host port for an index.
    pub fn port(&self, index: u32) -> u16 {
        container_port(self.base_port, index)
    }

    /// Entries counting against the fleet bounds.
    pub fn active_count(&self) -> u32 {
        self.containers.values().filter(|s| s.is_active()).count() as u32
    }

    /// Current lifecycle of an index.
    pub fn lifecycle(&self, index: u32) -> Option<Lifecycle> {
        self.containers.get(&index).copied()
    }

    /// All tracked indices, ascending.
    pub fn tracked(&self) -> Vec<u32> {
        self.containers.keys().copied().collect()
    }

    /// Adopt containers discovered at startup and top the fleet up to the
    /// minimum. Returns the indices newly requested to satisfy `min`.
    pub fn bootstrap(&mut self, existing_running: &[u32]) -> Vec<u32> {
        for &index in existing_running {
            if index >= 1 && index <= self.max {
                self.containers
                    .insert(index, Lifecycle::Running { failed_inspects: 0 });
            }
        }
        let mut requested = Vec::new();
        while self.active_count() < self.min {
            match self.lowest_free_index() {
                Some(index) => {
                    self.containers.insert(index, Lifecycle::Requested { attempts: 0 });
                    requested.push(index);
                }
                None => break,
            }
        }
        requested
    }

    /// Apply a scale intent, idempotently by its seq.
    pub fn apply(&mut self, intent: crate::bus::ScaleIntent) -> IntentOutcome {
        use crate::bus::ScaleIntent;
        if !self.seq_seen.insert(intent.seq()) {
            return IntentOutcome::Duplicate;
        }
        match intent {
            ScaleIntent::Up { count, .. } => {
                let room = self.max.saturating_sub(self.containers.len() as u32);
                let take = count.min(room);
                let mut added = Vec::new();
                for _ in 0..take {
                    // Gap-fill: the lowest unused index wins.
                    let Some(index) = self.lowest_free_index() else { break };
                    self.containers.insert(index, Lifecycle::Requested { attempts: 0 });
                    added.push(index);
                }
                if added.is_empty() {
                    IntentOutcome::NoCapacity
                } else {
                    IntentOutcome::ScaledUp(added)
                }
            }
            ScaleIntent::Down { count, .. } => {
                let removable = self.active_count().saturating_sub(self.min);
                let take = count.min(removable);
                // Remove highest-numbered first.
                let victims: Vec<u32> = self
                    .containers
                    .iter()
                    .filter(|(_, s)| s.is_active())
                    .map(|(&i, _)| i)
                    .rev()
                    .take(take as usize)
                    .collect();
                for &index in &victims {
                    self.containers.insert(index, Lifecycle::Stopping { attempts: 0 });
                }
                if victims.is_empty() {
                    IntentOutcome::NoCapacity
                } else {
                    IntentOutcome::ScalingDown(victims)
                }
            }
        }
    }

    /// Work for the driver this tick.
    pub fn tick_plan(&self) -> TickPlan {
        let mut plan = TickPlan::default();
        for (&index, state) in &self.containers {
            match state {
                Lifecycle::Requested { attempts } => plan.start.push((index, *attempts)),
                Lifecycle::Starting | Lifecycle::Running { .. } => plan.inspect.push(index),
                Lifecycle::Stopping { .. } => plan.stop.push(index),
            }
        }
        plan.stop.reverse();
        plan
    }

    /// A runtime start succeeded; `Requested` becomes `Starting`.
    pub fn on_start_success(&mut self, index: u32) -> bool {
        match self.containers.get_mut(&index) {
            Some(state @ Lifecycle::Requested { .. }) => {
                *state = Lifecycle::Starting;
                true
            }
            _ => false,
        }
    }

    /// A runtime start failed; retry with backoff or give up.
    pub fn on_start_failure(&mut self, index: u32) -> RetryOutcome {
        match self.containers.get(&index).copied() {
            Some(Lifecycle::Requested { attempts }) => {
                let attempts = attempts + 1;
                if attempts >= MAX_START_ATTEMPTS {
                    self.containers.remove(&index);
                    RetryOutcome::GaveUp
                } else {
                    self.containers
                        .insert(index, Lifecycle::Requested { attempts });
                    RetryOutcome::Retry(attempts)
                }
            }
            _ => RetryOutcome::GaveUp,
        }
    }

    /// A runtime stop succeeded; the entry leaves the desired set.
    pub fn on_stop_success(&mut self, index: u32) -> bool {
        matches!(
            self.containers.remove(&index),
            Some(Lifecycle::Stopping { .. })
        )
    }

    /// A runtime stop failed; bounded retries, then the entry is dropped
    /// from tracking (the container may be orphaned; the log says so).
    pub fn on_stop_failure(&mut self, index: u32) -> RetryOutcome {
        match self.containers.get(&index).copied() {
            Some(Lifecycle::Stopping { attempts }) => {
                let attempts = attempts + 1;
                if attempts >= MAX_STOP_ATTEMPTS {
                    self.containers.remove(&index);
                    RetryOutcome::GaveUp
                } else {
                    self.containers
                        .insert(index, Lifecycle::Stopping { attempts });
                    RetryOutcome::Retry(attempts)
                }
            }
            _ => RetryOutcome::GaveUp,
        }
    }

    /// Feed back an inspect result for a starting or running container.
    pub fn on_inspect(&mut self, index: u32, running: bool) -> InspectOutcome {
        let Some(current) = self.containers.get(&index).copied() else {
            return InspectOutcome::Untracked;
        };
        match current {
            Lifecycle::Starting if running => {
                self.containers
                    .insert(index, Lifecycle::Running { failed_inspects: 0 });
                InspectOutcome::BecameRunning
            }
            Lifecycle::Starting => InspectOutcome::StillStarting,
            Lifecycle::Running { .. } if running => {
                self.containers
                    .insert(index, Lifecycle::Running { failed_inspects: 0 });
                InspectOutcome::Healthy
            }
            Lifecycle::Running { failed_inspects } => {
                let failed = failed_inspects + 1;
                if failed >= self.unhealthy_reset {
                    self.containers
                        .insert(index, Lifecycle::Requested { attempts: 0 });
                    InspectOutcome::Restart
                } else {
                    self.containers
                        .insert(index, Lifecycle::Running { failed_inspects: failed });
                    InspectOutcome::Degraded(failed)
                }
            }
            _ => InspectOutcome::Untracked,
        }
    }

    fn lowest_free_index(&self) -> Option<u32> {
        (1..=self.max).find(|i| !self.containers.contains_key(i))
    }
}
