//! Entity table and transition emission

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use tokio::time::Instant;

use super::hysteresis::{Classifier, Hysteresis};
use crate::data::{Snapshot, Status, Transition};
use crate::probe::ProbeError;

/// Build the entity key for a monitor target
pub fn entity_key(monitor_id: &str, target: &str) -> String {
    format!("{}/{}", monitor_id, target)
}

/// Last-known state of one monitored entity
#[derive(Debug, Clone, Serialize)]
pub struct MonitoredEntity {
    pub key: String,
    pub monitor_id: String,
    pub target: String,
    pub status: Status,
    pub last_snapshot: Option<Snapshot>,
    /// Consecutive probe failures
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_sample_at: DateTime<Utc>,
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Status the entity is trending towards, with its streak length
    pub pending: Option<(Status, u32)>,
    #[serde(skip)]
    status_since: Instant,
}

impl MonitoredEntity {
    fn new(obs: &Observation<'_>, key: String) -> Self {
        Self {
            key,
            monitor_id: obs.monitor_id.to_string(),
            target: obs.target.to_string(),
            status: Status::Unknown,
            last_snapshot: None,
            consecutive_failures: 0,
            last_error: None,
            last_sample_at: Utc::now(),
            last_transition_at: None,
            pending: None,
            status_since: Instant::now(),
        }
    }
}

/// Everything the store needs to know about the sample being recorded
pub struct Observation<'a> {
    pub monitor_id: &'a str,
    pub kind: &'a str,
    pub target: &'a str,
    pub classifier: &'a dyn Classifier,
    pub hysteresis: &'a Hysteresis,
}

/// Keyed table of monitored entities.
///
/// Each key is updated under its shard lock, so concurrent monitors only
/// contend when their keys share a shard.
#[derive(Default)]
pub struct StateStore {
    entities: DashMap<String, MonitoredEntity>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a probe result and return the transition it caused, if any.
    pub fn observe(
        &self,
        obs: &Observation<'_>,
        result: Result<Snapshot, ProbeError>,
    ) -> Option<Transition> {
        let key = entity_key(obs.monitor_id, obs.target);

        match self.entities.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                let mut entity = MonitoredEntity::new(obs, key);
                match result {
                    Ok(snapshot) => Self::baseline(&mut entity, obs, snapshot),
                    Err(e) => {
                        entity.consecutive_failures = 1;
                        entity.last_error = Some(e.to_string());
                    }
                }
                tracing::debug!(entity = %entity.key, status = %entity.status, "Entity created");
                vacant.insert(entity);
                None
            }
            Entry::Occupied(mut occupied) => {
                let entity = occupied.get_mut();
                entity.last_sample_at = Utc::now();
                match result {
                    Ok(snapshot) => Self::apply_sample(entity, obs, snapshot),
                    Err(e) => Self::apply_failure(entity, obs, e),
                }
            }
        }
    }

    /// The first sample seeds the entity without emitting a transition.
    fn baseline(entity: &mut MonitoredEntity, obs: &Observation<'_>, snapshot: Snapshot) {
        let raw = obs.classifier.classify(Status::Unknown, &snapshot);
        if raw.is_healthy() && obs.hysteresis.required_samples(raw) <= 1 {
            entity.status = raw;
        } else if raw != Status::Unknown {
            entity.pending = Some((raw, 0));
        }
        entity.last_snapshot = Some(snapshot);
    }

    fn apply_sample(
        entity: &mut MonitoredEntity,
        obs: &Observation<'_>,
        snapshot: Snapshot,
    ) -> Option<Transition> {
        entity.consecutive_failures = 0;
        entity.last_error = None;

        let raw = obs.classifier.classify(entity.status, &snapshot);
        let value = snapshot.as_f64();
        let detail = snapshot.to_string();
        entity.last_snapshot = Some(snapshot);

        if raw == entity.status {
            entity.pending = None;
            return None;
        }

        let streak = match entity.pending {
            Some((status, n)) if status == raw => n + 1,
            _ => 1,
        };
        if streak < obs.hysteresis.required_samples(raw) {
            entity.pending = Some((raw, streak));
            return None;
        }

        let from = entity.status;
        let held = entity.status_since.elapsed();
        Self::flip(entity, raw);

        if from.is_failing() && raw.is_healthy() && held < obs.hysteresis.min_down {
            tracing::debug!(
                entity = %entity.key,
                held_ms = held.as_millis() as u64,
                "Recovery within min_down, not reported"
            );
            return None;
        }

        Some(
            Transition::new(entity.key.clone(), obs.kind, from, raw, detail)
                .with_value(value)
                .with_time(entity.last_sample_at)
                .with_streak(streak, held),
        )
    }

    fn apply_failure(
        entity: &mut MonitoredEntity,
        obs: &Observation<'_>,
        error: ProbeError,
    ) -> Option<Transition> {
        entity.consecutive_failures += 1;
        entity.last_error = Some(error.to_string());
        entity.pending = None;

        if entity.status == Status::Unknown {
            return None;
        }

        let from = entity.status;
        let held = entity.status_since.elapsed();
        Self::flip(entity, Status::Unknown);
        Some(
            Transition::new(
                entity.key.clone(),
                obs.kind,
                from,
                Status::Unknown,
                error.to_string(),
            )
            .with_time(entity.last_sample_at)
            .with_streak(1, held),
        )
    }

    fn flip(entity: &mut MonitoredEntity, to: Status) {
        entity.status = to;
        entity.pending = None;
        entity.status_since = Instant::now();
        entity.last_transition_at = Some(entity.last_sample_at);
    }

    /// Get one entity
    pub fn get(&self, key: &str) -> Option<MonitoredEntity> {
        self.entities.get(key).map(|e| e.clone())
    }

    /// List all entities sorted by key
    pub fn list(&self) -> Vec<MonitoredEntity> {
        let mut entities: Vec<MonitoredEntity> =
            self.entities.iter().map(|e| e.value().clone()).collect();
        entities.sort_by(|a, b| a.key.cmp(&b.key));
        entities
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Remove one entity
    pub fn evict(&self, key: &str) -> Option<MonitoredEntity> {
        self.entities.remove(key).map(|(_, e)| e)
    }

    /// Evict every entity of `monitor_id` whose target is not in `targets`.
    ///
    /// Returns the evicted keys.
    pub fn retain_targets(&self, monitor_id: &str, targets: &HashSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .entities
            .iter()
            .filter(|e| e.monitor_id == monitor_id && !targets.contains(&e.target))
            .map(|e| e.key.clone())
            .collect();

        for key in &stale {
            self.entities.remove(key);
            tracing::info!(entity = %key, "Entity evicted, target no longer present");
        }
        stale
    }

    /// Drop every entity belonging to a monitor
    pub fn remove_monitor(&self, monitor_id: &str) -> usize {
        let before = self.entities.len();
        self.entities.retain(|_, e| e.monitor_id != monitor_id);
        before - self.entities.len()
    }
}
