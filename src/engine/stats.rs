//! Engine counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::condition::ConditionOutcome;
use crate::ratelimit::Admission;
use crate::workflow::RunState;

#[derive(Debug, Default)]
pub struct EngineStats {
    transitions: AtomicU64,
    matched: AtomicU64,
    unmet: AtomicU64,
    quiet_hours: AtomicU64,
    debounced: AtomicU64,
    confirming: AtomicU64,
    cooldown: AtomicU64,
    dropped: AtomicU64,
    merged: AtomicU64,
    throttled: AtomicU64,
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_timed_out: AtomicU64,
    runs_cancelled: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub transitions: u64,
    pub matched: u64,
    pub unmet: u64,
    pub quiet_hours: u64,
    /// Recoveries a trigger ignored for coming too soon
    pub debounced: u64,
    /// Transitions parked for confirmation
    pub confirming: u64,
    pub cooldown: u64,
    pub dropped: u64,
    pub merged: u64,
    pub throttled: u64,
    pub runs_started: u64,
    pub runs_active: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_timed_out: u64,
    pub runs_cancelled: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineStats {
    pub fn record_transition(&self) {
        bump(&self.transitions);
    }

    pub fn record_condition(&self, outcome: ConditionOutcome) {
        match outcome {
            ConditionOutcome::Matched => bump(&self.matched),
            ConditionOutcome::Unmet => bump(&self.unmet),
            ConditionOutcome::QuietHours => bump(&self.quiet_hours),
        }
    }

    pub fn record_debounced(&self) {
        bump(&self.debounced);
    }

    pub fn record_confirming(&self) {
        bump(&self.confirming);
    }

    pub fn record_admission(&self, admission: &Admission) {
        match admission {
            Admission::Admitted { .. } => {}
            Admission::Cooldown { .. } => bump(&self.cooldown),
            Admission::Dropped => bump(&self.dropped),
            Admission::Merged { .. } => bump(&self.merged),
            Admission::Throttled { .. } => bump(&self.throttled),
        }
    }

    pub fn record_run_started(&self) {
        bump(&self.runs_started);
    }

    pub fn record_run_finished(&self, state: RunState) {
        match state {
            RunState::Completed => bump(&self.runs_completed),
            RunState::Failed => bump(&self.runs_failed),
            RunState::TimedOut => bump(&self.runs_timed_out),
            RunState::Cancelled => bump(&self.runs_cancelled),
            RunState::Pending | RunState::Running => {}
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let runs_started = load(&self.runs_started);
        let finished = load(&self.runs_completed)
            + load(&self.runs_failed)
            + load(&self.runs_timed_out)
            + load(&self.runs_cancelled);
        StatsSnapshot {
            transitions: load(&self.transitions),
            matched: load(&self.matched),
            unmet: load(&self.unmet),
            quiet_hours: load(&self.quiet_hours),
            debounced: load(&self.debounced),
            confirming: load(&self.confirming),
            cooldown: load(&self.cooldown),
            dropped: load(&self.dropped),
            merged: load(&self.merged),
            throttled: load(&self.throttled),
            runs_started,
            runs_active: runs_started.saturating_sub(finished),
            runs_completed: load(&self.runs_completed),
            runs_failed: load(&self.runs_failed),
            runs_timed_out: load(&self.runs_timed_out),
            runs_cancelled: load(&self.runs_cancelled),
        }
    }
}
