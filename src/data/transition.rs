use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Status;

/// A detected change of classified status for one entity.
///
/// Produced by the state store, consumed once by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Entity key (`<monitor id>/<target>`)
    pub entity_key: String,
    /// Event type (`<monitor kind>.<to status>`)
    pub event_type: String,
    pub from: Status,
    pub to: Status,
    pub at: DateTime<Utc>,
    /// Human-readable detail (snapshot rendering or probe error)
    pub detail: String,
    /// Numeric reading carried by the snapshot, if any
    pub value: Option<f64>,
    /// Consecutive samples in `to` when the transition was emitted
    #[serde(default = "one")]
    pub samples: u32,
    /// How long the entity had been in `from`
    #[serde(default, rename = "held_ms", with = "crate::config::duration_ms")]
    pub held: Duration,
}

fn one() -> u32 {
    1
}

impl Transition {
    pub fn new(
        entity_key: impl Into<String>,
        kind: &str,
        from: Status,
        to: Status,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            event_type: format!("{}.{}", kind, to),
            from,
            to,
            at: Utc::now(),
            detail: detail.into(),
            value: None,
            samples: 1,
            held: Duration::ZERO,
        }
    }

    pub fn with_value(mut self, value: Option<f64>) -> Self {
        self.value = value;
        self
    }

    pub fn with_time(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    pub fn with_streak(mut self, samples: u32, held: Duration) -> Self {
        self.samples = samples.max(1);
        self.held = held;
        self
    }

    /// True when the entity came back from a failing status.
    pub fn is_recovery(&self) -> bool {
        self.from.is_failing() && self.to.is_healthy()
    }
}

/// Match an event type against a trigger pattern.
///
/// `*` matches everything, `cpu.*` matches every event of kind `cpu`,
/// anything else must match exactly.
pub fn event_type_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => pattern == event_type,
    }
}
