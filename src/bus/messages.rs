//! Wire payloads exchanged over the scaling bus.

use serde::{Deserialize, Serialize};

/// Topic carrying scale intents (load balancer to host manager).
pub const TOPIC_SCALING_REQUESTS: &str = "loadbalancer/scaling/requests";

/// Topic carrying scale events (host manager to subscribers).
pub const TOPIC_HOSTMANAGER_EVENTS: &str = "hostmanager/events";

/// A demand signal published by the scaling sensor.
///
/// `seq` increases monotonically per publisher; the reconciler treats it as
/// an idempotency key, so replays and duplicate deliveries are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ScaleIntent {
    /// Add `count` containers.
    Up {
        /// Containers requested; at least 1.
        count: u32,
        /// Idempotency sequence id.
        seq: u64,
    },
    /// Remove `count` containers.
    Down {
        /// Containers to remove; at least 1.
        count: u32,
        /// Idempotency sequence id.
        seq: u64,
    },
}

impl ScaleIntent {
    /// The intent's sequence id.
    pub fn seq(&self) -> u64 {
        match self {
            ScaleIntent::Up { seq, .. } | ScaleIntent::Down { seq, .. } => *seq,
        }
    }

    /// Direction label for logs.
    pub fn action(&self) -> &'static str {
        match self {
            ScaleIntent::Up { .. } => "up",
            ScaleIntent::Down { .. } => "down",
        }
    }
}

/// Direction of a completed scale transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleAction {
    /// A container came up.
    Up,
    /// A container went down.
    Down,
}

/// Event published by the host manager after a successful transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleEvent {
    /// Direction of the transition.
    pub action: ScaleAction,
    /// Container name the transition applies to.
    pub container: String,
    /// Epoch milliseconds at publication.
    pub ts: i64,
}

impl ScaleEvent {
    /// Event stamped with the current wall-clock time.
    pub fn now(action: ScaleAction, container: impl Into<String>) -> Self {
        ScaleEvent {
            action,
            container: container.into(),
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_wire_format_is_stable() {
        let json = serde_json::to_value(ScaleIntent::Up { count: 2, seq: 42 }).unwrap();
        assert_eq!(json, serde_json::json!({"action": "up", "count": 2, "seq": 42}));

        let parsed: ScaleIntent =
            serde_json::from_str(r#"{"action":"down","count":1,"seq":7}"#).unwrap();
        assert_eq!(parsed, ScaleIntent::Down { count: 1, seq: 7 });
    }

    #[test]
    fn event_wire_format_is_stable() {
        let event = ScaleEvent {
            action: ScaleAction::Down,
            container: "c3".into(),
            ts: 1000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "down", "container": "c3", "ts": 1000})
        );
    }
}
