//! Sliding event counter keyed by event type

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_HORIZON: Duration = Duration::from_secs(3600);

/// Remembers when each event type occurred, up to `horizon` ago.
#[derive(Debug)]
pub struct EventCounter {
    events: DashMap<String, VecDeque<Instant>>,
    horizon: Duration,
}

impl Default for EventCounter {
    fn default() -> Self {
        Self::with_horizon(DEFAULT_HORIZON)
    }
}

impl EventCounter {
    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            events: DashMap::new(),
            horizon,
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Record one occurrence of `event_type`
    pub fn record(&self, event_type: &str, now: Instant) {
        let mut times = self.events.entry(event_type.to_string()).or_default();
        times.push_back(now);
        Self::trim(&mut times, self.horizon, now);
    }

    /// Occurrences of `event_type` in the last `window` (inclusive)
    pub fn count_within(&self, event_type: &str, window: Duration, now: Instant) -> usize {
        let Some(times) = self.events.get(event_type) else {
            return 0;
        };
        times
            .iter()
            .rev()
            .take_while(|t| now.saturating_duration_since(**t) <= window)
            .count()
    }

    fn trim(times: &mut VecDeque<Instant>, horizon: Duration, now: Instant) {
        while let Some(front) = times.front() {
            if now.saturating_duration_since(*front) > horizon {
                times.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop expired occurrences for every event type
    pub fn prune(&self, now: Instant) {
        for mut entry in self.events.iter_mut() {
            Self::trim(entry.value_mut(), self.horizon, now);
        }
        self.events.retain(|_, times| !times.is_empty());
    }
}
