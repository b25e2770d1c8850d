//! Monitor scheduling
//!
//! Every monitor gets its own polling loop under a supervisor task. The loop
//! samples immediately, then on each interval tick; each sample runs under the
//! monitor's probe timeout and is dropped as soon as the monitor is cancelled.
//! A loop that panics is
//! restarted by its supervisor after one interval plus jitter, without
//! touching other monitors.

use dashmap::DashMap;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::MonitorSpec;
use crate::data::Snapshot;
use crate::engine::Engine;
use crate::probe::ProbeError;
use crate::state::Observation;

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts and stops monitor loops
pub struct Scheduler {
    engine: Arc<Engine>,
    monitors: DashMap<String, MonitorHandle>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let tracker = engine.tracker().clone();
        Self {
            engine,
            monitors: DashMap::new(),
            tracker,
        }
    }

    /// Start a supervised loop for one monitor
    pub fn spawn(&self, spec: MonitorSpec) {
        let cancel = self.engine.cancel_token().child_token();
        let engine = Arc::clone(&self.engine);
        let id = spec.id.clone();
        let task = self
            .tracker
            .spawn(supervise(engine, Arc::new(spec), cancel.clone()));

        if let Some(previous) = self.monitors.insert(id, MonitorHandle { cancel, task }) {
            previous.cancel.cancel();
        }
    }

    pub fn spawn_all(&self, specs: Vec<MonitorSpec>) {
        for spec in specs {
            self.spawn(spec);
        }
    }

    /// Stop one monitor and forget its entities.
    ///
    /// Waits for the loop to exit first, so no sample lands after the
    /// eviction.
    pub async fn stop(&self, monitor_id: &str) -> bool {
        let Some((_, handle)) = self.monitors.remove(monitor_id) else {
            return false;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::warn!(monitor_id = %monitor_id, error = %e, "Monitor task ended abnormally");
        }
        let evicted = self.engine.store().remove_monitor(monitor_id);
        tracing::info!(monitor_id = %monitor_id, evicted, "Monitor stopped");
        true
    }

    pub fn monitor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

async fn supervise(engine: Arc<Engine>, spec: Arc<MonitorSpec>, cancel: CancellationToken) {
    let mut restarts: u32 = 0;

    loop {
        let handle = tokio::spawn(run_monitor(
            Arc::clone(&engine),
            Arc::clone(&spec),
            cancel.clone(),
        ));

        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                restarts += 1;
                let jitter_cap = (spec.interval.as_millis() as u64 / 10).max(1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
                tracing::warn!(
                    monitor_id = %spec.id,
                    restarts,
                    "Monitor loop panicked, restarting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(spec.interval + jitter) => {}
                }
            }
            Err(_) => break,
        }
    }
}

async fn run_monitor(engine: Arc<Engine>, spec: Arc<MonitorSpec>, cancel: CancellationToken) {
    tracing::info!(
        monitor_id = %spec.id,
        interval = ?spec.interval,
        targets = spec.targets.len(),
        "Monitor started"
    );

    // First tick completes immediately
    let mut ticker = tokio::time::interval(spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut targets = spec.targets.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            found = discover(&spec) => found,
        };
        if let Some(found) = found {
            refresh_targets(&engine, &spec, &mut targets, found);
        }

        for target in &targets {
            // Dropping an in-flight sample releases whatever it started
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = sample(&spec, target) => result,
            };
            match &result {
                Ok(snapshot) => tracing::debug!(
                    monitor_id = %spec.id,
                    target = %target,
                    snapshot = %snapshot,
                    "Sampled"
                ),
                Err(e) => tracing::warn!(
                    monitor_id = %spec.id,
                    target = %target,
                    error = %e,
                    "Probe failed"
                ),
            }

            let obs = Observation {
                monitor_id: &spec.id,
                kind: &spec.kind,
                target,
                classifier: spec.classifier.as_ref(),
                hysteresis: &spec.hysteresis,
            };
            engine.observe(&obs, result);
        }
    }

    tracing::info!(monitor_id = %spec.id, "Monitor loop exited");
}

async fn sample(spec: &MonitorSpec, target: &str) -> Result<Snapshot, ProbeError> {
    tokio::time::timeout(spec.probe_timeout, spec.probe.sample(target))
        .await
        .unwrap_or(Err(ProbeError::Timeout(spec.probe_timeout)))
}

async fn discover(spec: &MonitorSpec) -> Option<Vec<String>> {
    let result = tokio::time::timeout(spec.probe_timeout, spec.probe.discover())
        .await
        .unwrap_or(Err(ProbeError::Timeout(spec.probe_timeout)));

    match result {
        Ok(found) => found,
        Err(e) => {
            // Keep the previous target list
            tracing::warn!(monitor_id = %spec.id, error = %e, "Discovery failed");
            None
        }
    }
}

fn refresh_targets(
    engine: &Engine,
    spec: &MonitorSpec,
    targets: &mut Vec<String>,
    mut found: Vec<String>,
) {
    found.sort();
    found.dedup();
    if *targets == found {
        return;
    }

    let keep: HashSet<String> = found.iter().cloned().collect();
    let evicted = engine.store().retain_targets(&spec.id, &keep);
    for key in &evicted {
        tracing::info!(monitor_id = %spec.id, entity = %key, "Target gone, entity evicted");
    }
    for target in found.iter().filter(|t| !targets.contains(*t)) {
        tracing::info!(monitor_id = %spec.id, target = %target, "Target discovered");
    }
    *targets = found;
}
