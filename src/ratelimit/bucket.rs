//! Token bucket burst limiter

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Bucket sizing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens held
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 0.5,
        }
    }
}

/// Token bucket. `0 <= tokens <= capacity` holds after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: BucketConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    pub fn new_at(config: BucketConfig, now: Instant) -> Self {
        let capacity = config.capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: config.refill_per_sec.max(0.0),
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill_at = now;
    }

    /// Take one token if available.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Give back a token taken by a firing that was rejected by another scope.
    pub fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    /// Time until one token is available, `None` if the bucket never refills.
    pub fn time_until_token(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate <= 0.0 || self.capacity < 1.0 {
            return None;
        }
        Some(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}
