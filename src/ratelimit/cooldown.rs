//! Per-key alert cooldown

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Last firing of one alert key
#[derive(Debug, Clone, Copy)]
pub struct CooldownRecord {
    pub last_fired_at: Instant,
    pub min_interval: Duration,
}

impl CooldownRecord {
    /// Time left before the key may fire again
    pub fn remaining(&self, now: Instant) -> Duration {
        self.min_interval
            .saturating_sub(now.saturating_duration_since(self.last_fired_at))
    }
}

/// Cooldown records keyed by alert key.
///
/// Check-and-set happens under the key's entry lock, so two concurrent
/// admits for the same key can never both pass.
#[derive(Debug, Default)]
pub struct CooldownTable {
    records: DashMap<String, CooldownRecord>,
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `key` if at least `min_interval` passed since its last admit.
    pub fn admit(&self, key: &str, min_interval: Duration) -> bool {
        self.admit_at(key, min_interval, Instant::now())
    }

    pub fn admit_at(&self, key: &str, min_interval: Duration, now: Instant) -> bool {
        self.admit_if_at(key, min_interval, now, || true).unwrap_or(false)
    }

    /// Check the cooldown for `key`, then run `gate` while still holding the
    /// key's lock. The firing is recorded only when `gate` returns true.
    ///
    /// Returns `Err(remaining)` while the key is cooling down, otherwise
    /// whatever `gate` decided.
    pub fn admit_if_at<F>(
        &self,
        key: &str,
        min_interval: Duration,
        now: Instant,
        gate: F,
    ) -> Result<bool, Duration>
    where
        F: FnOnce() -> bool,
    {
        match self.records.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                if !gate() {
                    return Ok(false);
                }
                vacant.insert(CooldownRecord {
                    last_fired_at: now,
                    min_interval,
                });
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let elapsed = now.saturating_duration_since(record.last_fired_at);
                if elapsed < min_interval {
                    return Err(min_interval - elapsed);
                }
                if !gate() {
                    return Ok(false);
                }
                record.last_fired_at = now;
                record.min_interval = min_interval;
                Ok(true)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<CooldownRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Forget one key
    pub fn reset(&self, key: &str) {
        self.records.remove(key);
    }

    /// Drop records whose cooldown has fully elapsed
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.remaining(now) > Duration::ZERO);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
