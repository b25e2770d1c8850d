//! Debounce and burst control
//!
//! Two gates must pass before a trigger fires: the per-key cooldown and the
//! token buckets (global and per event type). When a bucket is empty the
//! trigger's overflow policy decides what happens to the firing.

pub mod bucket;
pub mod cooldown;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

pub use bucket::{BucketConfig, TokenBucket};
pub use cooldown::{CooldownRecord, CooldownTable};

const GLOBAL_SCOPE: &str = "global";

/// What to do with a firing when the burst limiter is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the firing
    #[default]
    Silence,
    /// Count the firing and fold it into the next admitted one
    Merge,
    /// Delay the firing until a token is available
    Throttle,
}

/// Result of asking the controller whether a firing may proceed
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Fire. `merged` is the number of earlier firings folded into this one.
    Admitted { merged: u64 },
    /// Same alert key fired too recently
    Cooldown { remaining: Duration },
    /// Burst limit hit, firing dropped
    Dropped,
    /// Burst limit hit, firing counted for the next admitted one
    Merged { pending: u64 },
    /// Burst limit hit, retry after `delay`
    Throttled { delay: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// One admission request
#[derive(Debug, Clone)]
pub struct AdmitRequest<'a> {
    pub alert_key: &'a str,
    pub trigger_id: &'a str,
    pub event_type: &'a str,
    pub min_interval: Duration,
    pub policy: OverflowPolicy,
}

/// Burst limiter configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BurstSettings {
    /// Bucket shared by every firing
    #[serde(default)]
    pub global: Option<BucketConfig>,
    /// One bucket per event type
    #[serde(default)]
    pub per_event_type: Option<BucketConfig>,
}

/// Cooldowns, buckets and merge counters
pub struct RateController {
    cooldowns: CooldownTable,
    buckets: DashMap<String, TokenBucket>,
    merged: DashMap<String, u64>,
    settings: BurstSettings,
}

impl RateController {
    pub fn new(settings: BurstSettings) -> Self {
        Self {
            cooldowns: CooldownTable::new(),
            buckets: DashMap::new(),
            merged: DashMap::new(),
            settings,
        }
    }

    /// Run both gates for one firing.
    ///
    /// The cooldown is checked first but only charged when the firing goes
    /// ahead (admitted, or throttled and waiting for a token). A firing the
    /// buckets drop or merge leaves the alert key free.
    pub fn admit(&self, request: &AdmitRequest<'_>) -> Admission {
        let now = Instant::now();
        let mut outcome = None;

        let gated = self
            .cooldowns
            .admit_if_at(request.alert_key, request.min_interval, now, || {
                let admission = self.burst(request, now);
                let charge = matches!(
                    admission,
                    Admission::Admitted { .. } | Admission::Throttled { .. }
                );
                outcome = Some(admission);
                charge
            });

        match (gated, outcome) {
            (Err(remaining), _) => Admission::Cooldown { remaining },
            (Ok(_), Some(admission)) => admission,
            (Ok(_), None) => Admission::Dropped,
        }
    }

    fn burst(&self, request: &AdmitRequest<'_>, now: Instant) -> Admission {
        if self.consume(request.event_type, now) {
            return Admission::Admitted {
                merged: self.take_merged(request.trigger_id),
            };
        }

        match request.policy {
            OverflowPolicy::Silence => Admission::Dropped,
            OverflowPolicy::Merge => {
                let mut pending = self.merged.entry(request.trigger_id.to_string()).or_insert(0);
                *pending += 1;
                Admission::Merged { pending: *pending }
            }
            OverflowPolicy::Throttle => match self.delay_until_token(request.event_type, now) {
                Some(delay) => Admission::Throttled { delay },
                None => Admission::Dropped,
            },
        }
    }

    /// Retry a throttled firing. Only the buckets are consulted; the cooldown
    /// was charged when the firing was first throttled.
    pub fn retry(&self, trigger_id: &str, event_type: &str) -> Admission {
        let now = Instant::now();
        if self.consume(event_type, now) {
            return Admission::Admitted {
                merged: self.take_merged(trigger_id),
            };
        }
        match self.delay_until_token(event_type, now) {
            Some(delay) => Admission::Throttled { delay },
            None => Admission::Dropped,
        }
    }

    fn scopes(&self, event_type: &str) -> Vec<(String, BucketConfig)> {
        let mut scopes = Vec::with_capacity(2);
        if let Some(config) = self.settings.per_event_type {
            scopes.push((format!("event:{}", event_type), config));
        }
        if let Some(config) = self.settings.global {
            scopes.push((GLOBAL_SCOPE.to_string(), config));
        }
        scopes
    }

    /// Take a token from every applicable bucket, or from none.
    fn consume(&self, event_type: &str, now: Instant) -> bool {
        let mut taken: Vec<String> = Vec::new();

        for (scope, config) in self.scopes(event_type) {
            let mut bucket = self
                .buckets
                .entry(scope.clone())
                .or_insert_with(|| TokenBucket::new_at(config, now));
            if bucket.try_consume_at(now) {
                drop(bucket);
                taken.push(scope);
            } else {
                drop(bucket);
                for scope in taken {
                    if let Some(mut bucket) = self.buckets.get_mut(&scope) {
                        bucket.refund();
                    }
                }
                return false;
            }
        }
        true
    }

    fn delay_until_token(&self, event_type: &str, now: Instant) -> Option<Duration> {
        let mut delay = Duration::ZERO;
        for (scope, _) in self.scopes(event_type) {
            if let Some(mut bucket) = self.buckets.get_mut(&scope) {
                delay = delay.max(bucket.time_until_token(now)?);
            }
        }
        Some(delay)
    }

    fn take_merged(&self, trigger_id: &str) -> u64 {
        self.merged.remove(trigger_id).map(|(_, n)| n).unwrap_or(0)
    }

    /// Drop expired cooldown records
    pub fn prune(&self) -> usize {
        self.cooldowns.prune(Instant::now())
    }

    pub fn cooldowns(&self) -> &CooldownTable {
        &self.cooldowns
    }

    /// Current token count of a scope (`global` or `event:<type>`)
    pub fn tokens(&self, scope: &str) -> Option<f64> {
        self.buckets.get(scope).map(|b| b.tokens())
    }
}

/// Clamp a requested volume to `[0, max]`
pub fn clamp_volume(requested: f32, max: f32) -> f32 {
    if requested.is_nan() {
        return 0.0;
    }
    requested.min(max).max(0.0)
}
