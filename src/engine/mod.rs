//! Detection-to-dispatch pipeline
//!
//! The engine receives transitions from the scheduler and, for each trigger
//! whose event type matches, runs the condition evaluator, then the rate
//! controller, then spawns a workflow run. Runs are tracked so shutdown can
//! wait for them; each trigger owns a child cancellation token so disabling
//! it cancels its in-flight runs.
//!
//! A trigger with its own hysteresis only fires once the entity has held the
//! new status for the trigger's sample count. Transitions short of that are
//! parked per entity and confirmed by the samples that follow.

pub mod stats;

use chrono::NaiveDateTime;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::condition::{ConditionOutcome, EvalContext, EventCounter, Evaluator};
use crate::config::{self, CompiledTrigger, ConfigError, Settings, TriggerSet};
use crate::data::{event_type_matches, Snapshot, Transition};
use crate::probe::ProbeError;
use crate::ratelimit::{AdmitRequest, Admission, OverflowPolicy, RateController};
use crate::sinks::ActionSink;
use crate::state::{entity_key, Observation, StateStore};
use crate::workflow::{Executor, RunReport, RunRequest};

pub use stats::{EngineStats, StatsSnapshot};

const RECENT_RUNS: usize = 256;
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// What happened to one matching trigger for one transition
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Condition unmet or quiet hours
    Skipped(ConditionOutcome),
    /// Rate control held the firing back
    Suppressed(Admission),
    /// Waiting for a token under the throttle policy
    Deferred { delay: Duration },
    /// Recovery came sooner than the trigger's `min_down`
    Debounced { held: Duration },
    /// Parked until the entity holds the new status for more samples
    Confirming { remaining: u32 },
    Started { run_id: u64, merged: u64 },
}

/// Runtime wrapper around a compiled trigger
pub struct TriggerSlot {
    pub trigger: Arc<CompiledTrigger>,
    enabled: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl TriggerSlot {
    fn new(trigger: Arc<CompiledTrigger>, parent: &CancellationToken) -> Self {
        Self {
            enabled: AtomicBool::new(trigger.enabled),
            cancel: Mutex::new(parent.child_token()),
            trigger,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Build the slot for a reloaded trigger that already existed.
    ///
    /// In-flight runs stay attached to the old token and an API disable
    /// survives, unless the new config disables the trigger outright.
    fn carry(trigger: Arc<CompiledTrigger>, previous: &TriggerSlot, parent: &CancellationToken) -> Self {
        if !trigger.enabled {
            previous.token().cancel();
            return Self::new(trigger, parent);
        }

        let enabled = if previous.trigger.enabled {
            previous.is_enabled()
        } else {
            true
        };
        Self {
            enabled: AtomicBool::new(enabled),
            cancel: Mutex::new(previous.token()),
            trigger,
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }
}

/// A transition waiting for more samples before one trigger fires on it
struct Confirmation {
    trigger_id: String,
    transition: Transition,
    samples: u32,
    required: u32,
}

struct ActiveTriggers {
    evaluator: Evaluator,
    slots: Vec<Arc<TriggerSlot>>,
}

impl ActiveTriggers {
    fn new(set: TriggerSet, parent: &CancellationToken) -> Self {
        Self {
            evaluator: set.evaluator,
            slots: set
                .triggers
                .into_iter()
                .map(|t| Arc::new(TriggerSlot::new(t, parent)))
                .collect(),
        }
    }
}

/// Trigger summary for the control API
#[derive(Debug, Clone, Serialize)]
pub struct TriggerInfo {
    pub id: String,
    pub event_type: String,
    pub condition: Option<String>,
    pub enabled: bool,
    pub cooldown_secs: u64,
    pub overflow: OverflowPolicy,
    pub quiet_hours_exempt: bool,
    pub workflows: Vec<String>,
}

/// The dispatch engine
pub struct Engine {
    store: Arc<StateStore>,
    counter: Arc<EventCounter>,
    rate: RateController,
    executor: Executor,
    triggers: RwLock<Arc<ActiveTriggers>>,
    confirming: DashMap<String, Vec<Confirmation>>,
    recent: Mutex<VecDeque<RunReport>>,
    next_run_id: AtomicU64,
    stats: EngineStats,
    cancel: CancellationToken,
    tracker: TaskTracker,
    config_path: Option<PathBuf>,
}

impl Engine {
    /// Create an engine. `cancel` is the process-wide stop signal.
    pub fn new(
        settings: &Settings,
        triggers: TriggerSet,
        sink: Arc<dyn ActionSink>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let counter = Arc::new(EventCounter::with_horizon(Duration::from_secs(
            settings.counter_horizon_secs,
        )));
        let executor = Executor::new(
            sink,
            Arc::clone(&counter),
            settings.max_volume,
            tracker.clone(),
        );
        let active = ActiveTriggers::new(triggers, &cancel);

        Self {
            store: Arc::new(StateStore::new()),
            counter,
            rate: RateController::new(settings.burst),
            executor,
            triggers: RwLock::new(Arc::new(active)),
            confirming: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_RUNS)),
            next_run_id: AtomicU64::new(0),
            stats: EngineStats::default(),
            cancel,
            tracker,
            config_path: None,
        }
    }

    /// File that `reload` re-reads
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn rate(&self) -> &RateController {
        &self.rate
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Record a probe result and dispatch the transition it caused
    pub fn observe(
        self: &Arc<Self>,
        obs: &Observation<'_>,
        result: Result<Snapshot, ProbeError>,
    ) -> Vec<(String, Decision)> {
        match self.store.observe(obs, result) {
            Some(transition) => self.handle_transition(transition),
            None => {
                let key = entity_key(obs.monitor_id, obs.target);
                self.confirm(&key, chrono::Local::now().naive_local())
            }
        }
    }

    /// Dispatch one transition using the local wall clock
    pub fn handle_transition(self: &Arc<Self>, transition: Transition) -> Vec<(String, Decision)> {
        self.dispatch(transition, chrono::Local::now().naive_local())
    }

    /// Dispatch one transition as if the local time were `local_time`
    pub fn dispatch(
        self: &Arc<Self>,
        transition: Transition,
        local_time: NaiveDateTime,
    ) -> Vec<(String, Decision)> {
        let now = Instant::now();
        self.stats.record_transition();
        self.counter.record(&transition.event_type, now);

        tracing::info!(
            entity = %transition.entity_key,
            event_type = %transition.event_type,
            from = %transition.from,
            to = %transition.to,
            "Transition"
        );

        let active = self.triggers.read().clone();
        let ctx = EvalContext {
            transition: &transition,
            local_time,
            counter: &self.counter,
            now,
        };

        // A new transition restarts every confirmation for the entity
        self.confirming.remove(&transition.entity_key);

        let mut decisions = Vec::new();
        let mut parked = Vec::new();
        for slot in &active.slots {
            let trigger = &slot.trigger;
            if !event_type_matches(&trigger.event_type, &transition.event_type) {
                continue;
            }
            if !slot.is_enabled() {
                tracing::debug!(trigger_id = %trigger.id, "Trigger disabled, skipped");
                continue;
            }

            if let Some(hysteresis) = &trigger.hysteresis {
                if transition.is_recovery() && transition.held < hysteresis.min_down {
                    tracing::debug!(
                        trigger_id = %trigger.id,
                        held_ms = transition.held.as_millis() as u64,
                        "Recovery within min_down, trigger not fired"
                    );
                    self.stats.record_debounced();
                    decisions.push((trigger.id.clone(), Decision::Debounced { held: transition.held }));
                    continue;
                }

                let required = hysteresis.required_samples(transition.to);
                if transition.samples < required {
                    let remaining = required - transition.samples;
                    tracing::debug!(trigger_id = %trigger.id, remaining, "Waiting for confirmation");
                    self.stats.record_confirming();
                    parked.push(Confirmation {
                        trigger_id: trigger.id.clone(),
                        transition: transition.clone(),
                        samples: transition.samples,
                        required,
                    });
                    decisions.push((trigger.id.clone(), Decision::Confirming { remaining }));
                    continue;
                }
            }

            let decision = self.fire(&active.evaluator, slot, &ctx);
            decisions.push((trigger.id.clone(), decision));
        }

        if !parked.is_empty() {
            self.confirming.insert(transition.entity_key.clone(), parked);
        }
        decisions
    }

    /// Count one more sample towards the entity's parked confirmations and
    /// fire the triggers whose streak is now long enough.
    ///
    /// A sample that disagrees with the entity's status restarts the streak.
    fn confirm(self: &Arc<Self>, entity_key: &str, local_time: NaiveDateTime) -> Vec<(String, Decision)> {
        if !self.confirming.contains_key(entity_key) {
            return Vec::new();
        }
        let Some(entity) = self.store.get(entity_key) else {
            self.confirming.remove(entity_key);
            return Vec::new();
        };

        let ready = match self.confirming.entry(entity_key.to_string()) {
            Entry::Vacant(_) => return Vec::new(),
            Entry::Occupied(mut occupied) => {
                let parked_in = occupied.get().first().map(|c| c.transition.to);
                if parked_in != Some(entity.status) {
                    occupied.remove();
                    return Vec::new();
                }
                if entity.pending.is_some() {
                    tracing::debug!(entity = %entity_key, "Streak broken, confirmation restarted");
                    for c in occupied.get_mut().iter_mut() {
                        c.samples = 0;
                    }
                    return Vec::new();
                }

                let (ready, waiting): (Vec<_>, Vec<_>) = occupied
                    .get_mut()
                    .drain(..)
                    .map(|mut c| {
                        c.samples += 1;
                        c
                    })
                    .partition(|c| c.samples >= c.required);
                if waiting.is_empty() {
                    occupied.remove();
                } else {
                    *occupied.get_mut() = waiting;
                }
                ready
            }
        };

        let active = self.triggers.read().clone();
        let now = Instant::now();
        let mut decisions = Vec::new();
        for confirmed in ready {
            let Some(slot) = active.slots.iter().find(|s| s.trigger.id == confirmed.trigger_id) else {
                continue;
            };
            if !slot.is_enabled() {
                continue;
            }
            let ctx = EvalContext {
                transition: &confirmed.transition,
                local_time,
                counter: &self.counter,
                now,
            };
            tracing::debug!(
                trigger_id = %confirmed.trigger_id,
                entity = %entity_key,
                samples = confirmed.samples,
                "Transition confirmed"
            );
            let decision = self.fire(&active.evaluator, slot, &ctx);
            decisions.push((confirmed.trigger_id, decision));
        }
        decisions
    }

    /// Condition, rate control, then a run
    fn fire(self: &Arc<Self>, evaluator: &Evaluator, slot: &Arc<TriggerSlot>, ctx: &EvalContext<'_>) -> Decision {
        let trigger = &slot.trigger;
        let transition = ctx.transition;

        let outcome = evaluator.evaluate(trigger.condition.as_ref(), trigger.quiet_hours_exempt, ctx);
        self.stats.record_condition(outcome);
        if outcome != ConditionOutcome::Matched {
            tracing::debug!(trigger_id = %trigger.id, outcome = ?outcome, "Trigger not matched");
            return Decision::Skipped(outcome);
        }

        let alert_key = format!("{}|{}", trigger.id, transition.entity_key);
        let admission = self.rate.admit(&AdmitRequest {
            alert_key: &alert_key,
            trigger_id: &trigger.id,
            event_type: &transition.event_type,
            min_interval: trigger.cooldown,
            policy: trigger.overflow,
        });
        self.stats.record_admission(&admission);

        match admission {
            Admission::Admitted { merged } => {
                let run_id = self.spawn_run(slot, transition.clone(), merged);
                Decision::Started { run_id, merged }
            }
            Admission::Throttled { delay } => {
                self.defer(Arc::clone(slot), transition.clone(), delay);
                Decision::Deferred { delay }
            }
            other => {
                tracing::debug!(
                    trigger_id = %trigger.id,
                    alert_key = %alert_key,
                    admission = ?other,
                    "Firing suppressed"
                );
                Decision::Suppressed(other)
            }
        }
    }

    fn spawn_run(self: &Arc<Self>, slot: &TriggerSlot, transition: Transition, merged: u64) -> u64 {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let trigger = &slot.trigger;
        let request = RunRequest {
            run_id,
            trigger_id: trigger.id.clone(),
            plan: Arc::clone(&trigger.plan),
            transition,
            merged,
            timeout: trigger.timeout,
            cancel: slot.token(),
        };

        tracing::info!(run_id, trigger_id = %trigger.id, merged, "Workflow run started");
        self.stats.record_run_started();

        let engine = Arc::clone(self);
        self.tracker.spawn(async move {
            let report = engine.executor.run(request).await;
            engine.finish(report);
        });
        run_id
    }

    /// Retry a throttled firing once tokens are available
    fn defer(self: &Arc<Self>, slot: Arc<TriggerSlot>, transition: Transition, delay: Duration) {
        let engine = Arc::clone(self);
        let cancel = slot.token();
        self.tracker.spawn(async move {
            let mut delay = delay.max(MIN_RETRY_DELAY);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let admission = engine
                    .rate
                    .retry(&slot.trigger.id, &transition.event_type);
                match admission {
                    Admission::Admitted { merged } => {
                        engine.spawn_run(&slot, transition, merged);
                        return;
                    }
                    Admission::Throttled { delay: next } => delay = next.max(MIN_RETRY_DELAY),
                    other => {
                        engine.stats.record_admission(&other);
                        return;
                    }
                }
            }
        });
    }

    fn finish(&self, report: RunReport) {
        self.stats.record_run_finished(report.state);
        tracing::info!(
            run_id = report.run_id,
            trigger_id = %report.trigger_id,
            state = ?report.state,
            "Workflow run finished"
        );

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_RUNS {
            recent.pop_front();
        }
        recent.push_back(report);
    }

    /// Most recent finished runs, newest first
    pub fn recent_runs(&self, limit: usize) -> Vec<RunReport> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn triggers(&self) -> Vec<TriggerInfo> {
        let active = self.triggers.read().clone();
        active
            .slots
            .iter()
            .map(|slot| {
                let t = &slot.trigger;
                TriggerInfo {
                    id: t.id.clone(),
                    event_type: t.event_type.clone(),
                    condition: t.condition_source.clone(),
                    enabled: slot.is_enabled(),
                    cooldown_secs: t.cooldown.as_secs(),
                    overflow: t.overflow,
                    quiet_hours_exempt: t.quiet_hours_exempt,
                    workflows: t.plan.iter().map(|g| g.id.clone()).collect(),
                }
            })
            .collect()
    }

    /// Enable or disable a trigger. Disabling cancels its in-flight runs.
    ///
    /// Returns `None` for an unknown trigger.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Option<bool> {
        let active = self.triggers.read().clone();
        let slot = active.slots.iter().find(|s| s.trigger.id == id)?;

        let was = slot.enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            let mut token = slot.cancel.lock();
            token.cancel();
            *token = self.cancel.child_token();
            tracing::info!(trigger_id = %id, "Trigger disabled, in-flight runs cancelled");
        } else if !was && enabled {
            tracing::info!(trigger_id = %id, "Trigger enabled");
        }
        Some(enabled)
    }

    /// Swap in a new trigger set. Runs already in flight keep their plan.
    ///
    /// Triggers that survive keep their runs and runtime enabled flag. Runs of
    /// triggers the new set removes or disables are cancelled.
    pub fn replace_triggers(&self, set: TriggerSet) -> usize {
        let mut guard = self.triggers.write();
        let previous = Arc::clone(&guard);

        let slots: Vec<Arc<TriggerSlot>> = set
            .triggers
            .into_iter()
            .map(|trigger| {
                let slot = match previous.slots.iter().find(|s| s.trigger.id == trigger.id) {
                    Some(old) => TriggerSlot::carry(trigger, old, &self.cancel),
                    None => TriggerSlot::new(trigger, &self.cancel),
                };
                Arc::new(slot)
            })
            .collect();

        for old in &previous.slots {
            if !slots.iter().any(|s| s.trigger.id == old.trigger.id) {
                old.token().cancel();
                tracing::info!(trigger_id = %old.trigger.id, "Trigger removed, in-flight runs cancelled");
            }
        }

        let count = slots.len();
        *guard = Arc::new(ActiveTriggers {
            evaluator: set.evaluator,
            slots,
        });
        drop(guard);

        tracing::info!(triggers = count, "Trigger set replaced");
        count
    }

    /// Re-read the configuration file and replace the trigger set.
    ///
    /// Monitors are not restarted; on error the running set is kept.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let Some(path) = &self.config_path else {
            return Err(ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no configuration file to reload",
            )));
        };
        let compiled = config::load(path)?;
        Ok(self.replace_triggers(compiled.triggers))
    }

    /// Drop expired cooldowns, counter entries and confirmations for
    /// entities that are gone
    pub fn prune(&self) -> usize {
        self.counter.prune(Instant::now());
        self.confirming.retain(|key, _| self.store.contains(key));
        self.rate.prune()
    }

    /// Periodic housekeeping until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) {
        let engine = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pruned = engine.prune();
                        if pruned > 0 {
                            tracing::debug!(pruned, "Pruned expired cooldowns");
                        }
                    }
                    _ = engine.cancel.cancelled() => break,
                }
            }
        });
    }

    /// Cancel everything and wait for tracked tasks to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Status;
    use crate::sinks::recording::RecordingSink;
    use crate::state::{Hysteresis, ThresholdClassifier};
    use crate::workflow::RunState;
    use chrono::NaiveDate;

    fn engine_with(json: &str) -> (Arc<Engine>, Arc<RecordingSink>) {
        let compiled = config::parse(json).unwrap();
        let sink = Arc::new(RecordingSink::new());
        let engine = Engine::new(
            &compiled.settings,
            compiled.triggers,
            Arc::clone(&sink) as Arc<dyn ActionSink>,
            CancellationToken::new(),
            TaskTracker::new(),
        );
        (Arc::new(engine), sink)
    }

    async fn settle(engine: &Engine) {
        engine.tracker.close();
        engine.tracker.wait().await;
        engine.tracker.reopen();
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn critical(entity: &str) -> Transition {
        Transition::new(entity, "cpu", Status::Ok, Status::Critical, "96").with_value(Some(96.0))
    }

    const CPU_TRIGGER: &str = r#"{
        "triggers": [{
            "id": "cpu-critical",
            "event_type": "cpu.critical",
            "condition": "value >= 90",
            "cooldown_secs": 300,
            "actions": [{ "kind": "log", "message": "{entity} {to} at {value}" }]
        }]
    }"#;

    #[tokio::test(start_paused = true)]
    async fn test_cpu_end_to_end() {
        let (engine, sink) = engine_with(CPU_TRIGGER);
        let classifier = ThresholdClassifier::critical(90.0, 80.0);
        let hysteresis = Hysteresis {
            enter_samples: 2,
            ..Hysteresis::default()
        };
        let obs = Observation {
            monitor_id: "cpu",
            kind: "cpu",
            target: "host",
            classifier: &classifier,
            hysteresis: &hysteresis,
        };
        let poll = Duration::from_secs(10);

        // 95 at t=0 is the baseline, 92 and 96 complete the streak
        assert!(engine.observe(&obs, Ok(Snapshot::Number(95.0))).is_empty());
        tokio::time::advance(poll).await;
        assert!(engine.observe(&obs, Ok(Snapshot::Number(92.0))).is_empty());
        tokio::time::advance(poll).await;
        let decisions = engine.observe(&obs, Ok(Snapshot::Number(96.0)));
        assert_eq!(decisions.len(), 1);
        assert!(matches!(decisions[0].1, Decision::Started { .. }));

        // Staying critical emits nothing further
        for _ in 0..5 {
            tokio::time::advance(poll).await;
            assert!(engine.observe(&obs, Ok(Snapshot::Number(97.0))).is_empty());
        }

        // Dip to ok and back: the new critical transition hits the cooldown
        tokio::time::advance(poll).await;
        engine.observe(&obs, Ok(Snapshot::Number(50.0)));
        tokio::time::advance(poll).await;
        engine.observe(&obs, Ok(Snapshot::Number(95.0)));
        tokio::time::advance(poll).await;
        let decisions = engine.observe(&obs, Ok(Snapshot::Number(95.0)));
        assert!(matches!(
            decisions[0].1,
            Decision::Suppressed(Admission::Cooldown { .. })
        ));

        settle(&engine).await;
        assert_eq!(sink.logs(), vec!["cpu/host critical at 96".to_string()]);

        let stats = engine.stats();
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.cooldown, 1);
        assert_eq!(engine.recent_runs(10)[0].state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_condition_checked_before_cooldown() {
        let (engine, sink) = engine_with(CPU_TRIGGER);

        let low = Transition::new("cpu/host", "cpu", Status::Ok, Status::Critical, "85")
            .with_value(Some(85.0));
        let decisions = engine.dispatch(low, noon());
        assert_eq!(decisions[0].1, Decision::Skipped(ConditionOutcome::Unmet));
        assert!(engine.rate().cooldowns().is_empty());

        let decisions = engine.dispatch(critical("cpu/host"), noon());
        assert!(matches!(decisions[0].1, Decision::Started { .. }));

        settle(&engine).await;
        assert_eq!(sink.logs().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_is_per_entity() {
        let (engine, _) = engine_with(CPU_TRIGGER);
        let a = engine.dispatch(critical("cpu/a"), noon());
        let b = engine.dispatch(critical("cpu/b"), noon());
        let a_again = engine.dispatch(critical("cpu/a"), noon());

        assert!(matches!(a[0].1, Decision::Started { .. }));
        assert!(matches!(b[0].1, Decision::Started { .. }));
        assert!(matches!(a_again[0].1, Decision::Suppressed(_)));
    }

    #[tokio::test]
    async fn test_quiet_hours_and_wildcards() {
        let (engine, _) = engine_with(
            r#"{
                "settings": { "quiet_hours": ["22:00-07:00"], "default_cooldown_secs": 0 },
                "triggers": [
                    { "id": "all", "event_type": "*",
                      "actions": [{ "kind": "log", "message": "x" }] },
                    { "id": "cpu-any", "event_type": "cpu.*", "quiet_hours_exempt": true,
                      "actions": [{ "kind": "log", "message": "y" }] },
                    { "id": "disk", "event_type": "disk.*",
                      "actions": [{ "kind": "log", "message": "z" }] }
                ]
            }"#,
        );

        let late = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap();
        let decisions = engine.dispatch(critical("cpu/host"), late);

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].0, "all");
        assert_eq!(decisions[0].1, Decision::Skipped(ConditionOutcome::QuietHours));
        assert_eq!(decisions[1].0, "cpu-any");
        assert!(matches!(decisions[1].1, Decision::Started { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_in_flight_run() {
        let (engine, sink) = engine_with(
            r#"{
                "triggers": [{
                    "id": "slow",
                    "event_type": "cpu.critical",
                    "actions": [
                        { "kind": "wait", "duration_ms": 60000 },
                        { "kind": "log", "message": "late" }
                    ]
                }]
            }"#,
        );

        engine.dispatch(critical("cpu/host"), noon());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.set_enabled("slow", false), Some(false));
        settle(&engine).await;

        assert!(sink.logs().is_empty());
        assert_eq!(engine.recent_runs(1)[0].state, RunState::Cancelled);
        assert!(!engine.triggers()[0].enabled);

        // Disabled triggers are skipped entirely
        assert!(engine.dispatch(critical("cpu/other"), noon()).is_empty());

        assert_eq!(engine.set_enabled("slow", true), Some(true));
        assert_eq!(engine.set_enabled("ghost", true), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_policy_folds_firings() {
        let (engine, sink) = engine_with(
            r#"{
                "settings": {
                    "default_cooldown_secs": 0,
                    "burst": { "global": { "capacity": 1, "refill_per_sec": 1.0 } }
                },
                "triggers": [{
                    "id": "storm",
                    "event_type": "*",
                    "overflow": "merge",
                    "actions": [{ "kind": "log", "message": "{entity} (+{merged})" }]
                }]
            }"#,
        );

        assert!(matches!(
            engine.dispatch(critical("cpu/a"), noon())[0].1,
            Decision::Started { merged: 0, .. }
        ));
        assert_eq!(
            engine.dispatch(critical("cpu/b"), noon())[0].1,
            Decision::Suppressed(Admission::Merged { pending: 1 })
        );
        assert_eq!(
            engine.dispatch(critical("cpu/c"), noon())[0].1,
            Decision::Suppressed(Admission::Merged { pending: 2 })
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(
            engine.dispatch(critical("cpu/d"), noon())[0].1,
            Decision::Started { merged: 2, .. }
        ));

        settle(&engine).await;
        assert_eq!(
            sink.logs(),
            vec!["cpu/a (+0)".to_string(), "cpu/d (+2)".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_policy_delays_firing() {
        let (engine, sink) = engine_with(
            r#"{
                "settings": {
                    "default_cooldown_secs": 0,
                    "burst": { "per_event_type": { "capacity": 1, "refill_per_sec": 2.0 } }
                },
                "triggers": [{
                    "id": "slowdown",
                    "event_type": "cpu.critical",
                    "overflow": "throttle",
                    "actions": [{ "kind": "log", "message": "{entity}" }]
                }]
            }"#,
        );

        engine.dispatch(critical("cpu/a"), noon());
        let decisions = engine.dispatch(critical("cpu/b"), noon());
        assert!(matches!(decisions[0].1, Decision::Deferred { .. }));

        let start = Instant::now();
        settle(&engine).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert_eq!(sink.logs(), vec!["cpu/a".to_string(), "cpu/b".to_string()]);
        assert_eq!(engine.stats().runs_completed, 2);
    }

    #[tokio::test]
    async fn test_reload_replaces_trigger_set() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CPU_TRIGGER.as_bytes()).unwrap();

        let compiled = config::load(file.path()).unwrap();
        let engine = Engine::new(
            &compiled.settings,
            compiled.triggers,
            Arc::new(RecordingSink::new()),
            CancellationToken::new(),
            TaskTracker::new(),
        )
        .with_config_path(file.path());
        assert_eq!(engine.triggers().len(), 1);

        let updated = r#"{
            "triggers": [
                { "id": "a", "event_type": "*", "actions": [{ "kind": "log", "message": "a" }] },
                { "id": "b", "event_type": "*", "actions": [{ "kind": "log", "message": "b" }] }
            ]
        }"#;
        std::fs::write(file.path(), updated).unwrap();
        assert_eq!(engine.reload().unwrap(), 2);

        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(engine.reload().is_err());
        assert_eq!(engine.triggers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_drop_leaves_alert_key_free() {
        let (engine, sink) = engine_with(
            r#"{
                "settings": {
                    "burst": { "global": { "capacity": 1, "refill_per_sec": 1.0 } }
                },
                "triggers": [{
                    "id": "cpu-critical",
                    "event_type": "cpu.critical",
                    "cooldown_secs": 300,
                    "actions": [{ "kind": "log", "message": "{entity}" }]
                }]
            }"#,
        );

        assert!(matches!(
            engine.dispatch(critical("cpu/a"), noon())[0].1,
            Decision::Started { .. }
        ));
        assert_eq!(
            engine.dispatch(critical("cpu/b"), noon())[0].1,
            Decision::Suppressed(Admission::Dropped)
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            engine.dispatch(critical("cpu/b"), noon())[0].1,
            Decision::Started { .. }
        ));

        settle(&engine).await;
        assert_eq!(sink.logs(), vec!["cpu/a".to_string(), "cpu/b".to_string()]);
    }

    const SLOW_TRIGGER: &str = r#"{
        "triggers": [
            {
                "id": "slow",
                "event_type": "cpu.critical",
                "timeout_ms": 600000,
                "actions": [
                    { "kind": "wait", "duration_ms": 60000 },
                    { "kind": "log", "message": "late" }
                ]
            },
            {
                "id": "other",
                "event_type": "disk.*",
                "actions": [{ "kind": "log", "message": "disk" }]
            }
        ]
    }"#;

    fn reloadable(json: &str) -> (Arc<Engine>, Arc<RecordingSink>, tempfile::NamedTempFile) {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let compiled = config::load(file.path()).unwrap();
        let sink = Arc::new(RecordingSink::new());
        let engine = Engine::new(
            &compiled.settings,
            compiled.triggers,
            Arc::clone(&sink) as Arc<dyn ActionSink>,
            CancellationToken::new(),
            TaskTracker::new(),
        )
        .with_config_path(file.path());
        (Arc::new(engine), sink, file)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_disabling_trigger_cancels_run() {
        let (engine, sink, file) = reloadable(SLOW_TRIGGER);
        engine.dispatch(critical("cpu/host"), noon());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let disabled = SLOW_TRIGGER.replacen(
            r#""timeout_ms": 600000,"#,
            r#""timeout_ms": 600000, "enabled": false,"#,
            1,
        );
        std::fs::write(file.path(), disabled).unwrap();
        assert_eq!(engine.reload().unwrap(), 2);
        settle(&engine).await;

        assert!(sink.logs().is_empty());
        assert_eq!(engine.recent_runs(1)[0].state, RunState::Cancelled);
        assert!(!engine.triggers()[0].enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_removing_trigger_cancels_run() {
        let (engine, sink, file) = reloadable(SLOW_TRIGGER);
        engine.dispatch(critical("cpu/host"), noon());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let remaining = r#"{
            "triggers": [{
                "id": "other",
                "event_type": "disk.*",
                "actions": [{ "kind": "log", "message": "disk" }]
            }]
        }"#;
        std::fs::write(file.path(), remaining).unwrap();
        assert_eq!(engine.reload().unwrap(), 1);
        settle(&engine).await;

        assert!(sink.logs().is_empty());
        assert_eq!(engine.recent_runs(1)[0].state, RunState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_surviving_runs_and_flags() {
        let (engine, sink, _file) = reloadable(SLOW_TRIGGER);
        assert_eq!(engine.set_enabled("other", false), Some(false));
        engine.dispatch(critical("cpu/host"), noon());
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Same file: the run keeps going and the API disable sticks
        assert_eq!(engine.reload().unwrap(), 2);
        let flags: Vec<(String, bool)> = engine
            .triggers()
            .into_iter()
            .map(|t| (t.id, t.enabled))
            .collect();
        assert_eq!(
            flags,
            vec![("slow".to_string(), true), ("other".to_string(), false)]
        );

        settle(&engine).await;
        assert_eq!(sink.logs(), vec!["late".to_string()]);
        assert_eq!(engine.recent_runs(1)[0].state, RunState::Completed);
    }

    const CONFIRMED_TRIGGER: &str = r#"{
        "triggers": [{
            "id": "cpu-sustained",
            "event_type": "cpu.critical",
            "cooldown_secs": 0,
            "hysteresis": { "enter_samples": 3 },
            "actions": [{ "kind": "log", "message": "{entity} sustained" }]
        }]
    }"#;

    fn cpu_observation<'a>(
        classifier: &'a ThresholdClassifier,
        hysteresis: &'a Hysteresis,
    ) -> Observation<'a> {
        Observation {
            monitor_id: "cpu",
            kind: "cpu",
            target: "host",
            classifier,
            hysteresis,
        }
    }

    #[tokio::test]
    async fn test_trigger_hysteresis_waits_for_streak() {
        let (engine, sink) = engine_with(CONFIRMED_TRIGGER);
        let classifier = ThresholdClassifier::critical(90.0, 80.0);
        let hysteresis = Hysteresis::default();
        let obs = cpu_observation(&classifier, &hysteresis);

        assert!(engine.observe(&obs, Ok(Snapshot::Number(40.0))).is_empty());
        let decisions = engine.observe(&obs, Ok(Snapshot::Number(95.0)));
        assert_eq!(decisions[0].1, Decision::Confirming { remaining: 2 });
        assert!(engine.observe(&obs, Ok(Snapshot::Number(96.0))).is_empty());

        let decisions = engine.observe(&obs, Ok(Snapshot::Number(97.0)));
        assert_eq!(decisions.len(), 1);
        assert!(matches!(decisions[0].1, Decision::Started { .. }));

        // Fired once per episode
        assert!(engine.observe(&obs, Ok(Snapshot::Number(97.0))).is_empty());

        settle(&engine).await;
        assert_eq!(sink.logs(), vec!["cpu/host sustained".to_string()]);
        assert_eq!(engine.stats().confirming, 1);
    }

    #[tokio::test]
    async fn test_trigger_streak_restarts_on_disagreeing_sample() {
        let (engine, _) = engine_with(CONFIRMED_TRIGGER);
        let classifier = ThresholdClassifier::critical(90.0, 80.0);
        // Recovery needs two samples, so one low reading leaves the entity critical
        let hysteresis = Hysteresis {
            exit_samples: 2,
            ..Hysteresis::default()
        };
        let obs = cpu_observation(&classifier, &hysteresis);

        engine.observe(&obs, Ok(Snapshot::Number(40.0)));
        engine.observe(&obs, Ok(Snapshot::Number(95.0)));
        assert!(engine.observe(&obs, Ok(Snapshot::Number(96.0))).is_empty());
        assert!(engine.observe(&obs, Ok(Snapshot::Number(50.0))).is_empty());
        assert_eq!(engine.store().get("cpu/host").unwrap().status, Status::Critical);

        assert!(engine.observe(&obs, Ok(Snapshot::Number(95.0))).is_empty());
        assert!(engine.observe(&obs, Ok(Snapshot::Number(95.0))).is_empty());
        let decisions = engine.observe(&obs, Ok(Snapshot::Number(95.0)));
        assert!(matches!(decisions[0].1, Decision::Started { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_min_down_debounces_recovery() {
        let (engine, sink) = engine_with(
            r#"{
                "triggers": [{
                    "id": "cpu-recovered",
                    "event_type": "cpu.ok",
                    "cooldown_secs": 0,
                    "hysteresis": { "min_down_ms": 60000 },
                    "actions": [{ "kind": "log", "message": "{entity} back" }]
                }]
            }"#,
        );
        let classifier = ThresholdClassifier::critical(90.0, 80.0);
        let hysteresis = Hysteresis::default();
        let obs = cpu_observation(&classifier, &hysteresis);

        engine.observe(&obs, Ok(Snapshot::Number(40.0)));
        engine.observe(&obs, Ok(Snapshot::Number(95.0)));
        tokio::time::advance(Duration::from_secs(10)).await;
        let decisions = engine.observe(&obs, Ok(Snapshot::Number(40.0)));
        assert_eq!(
            decisions[0].1,
            Decision::Debounced {
                held: Duration::from_secs(10)
            }
        );

        engine.observe(&obs, Ok(Snapshot::Number(95.0)));
        tokio::time::advance(Duration::from_secs(61)).await;
        let decisions = engine.observe(&obs, Ok(Snapshot::Number(40.0)));
        assert!(matches!(decisions[0].1, Decision::Started { .. }));

        settle(&engine).await;
        assert_eq!(sink.logs(), vec!["cpu/host back".to_string()]);
        assert_eq!(engine.stats().debounced, 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_runs() {
        let (engine, _) = engine_with(
            r#"{
                "triggers": [{
                    "id": "long",
                    "event_type": "*",
                    "actions": [{ "kind": "wait", "duration_ms": 600000 }]
                }]
            }"#,
        );
        engine.dispatch(critical("cpu/host"), noon());
        engine.shutdown().await;

        assert_eq!(engine.stats().runs_cancelled, 1);
        assert_eq!(engine.stats().runs_active, 0);
    }
}
