//! Trigger condition evaluation
//!
//! Conditions are parsed into an [`Expr`] tree when configuration is loaded.
//! Quiet hours are a global override checked before the trigger's own
//! condition.

pub mod counter;
pub mod expr;
pub mod parser;

use chrono::NaiveTime;
use serde::Serialize;

pub use counter::EventCounter;
pub use expr::{CmpOp, EvalContext, Expr, TimeWindow};
pub use parser::{parse_condition, ParseError};

/// Result of evaluating a trigger against a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    Matched,
    Unmet,
    /// Suppressed by quiet hours
    QuietHours,
}

/// Global quiet-hours windows
#[derive(Debug, Clone, Default, Serialize)]
pub struct QuietHours {
    pub windows: Vec<TimeWindow>,
}

impl QuietHours {
    pub fn new(windows: Vec<TimeWindow>) -> Self {
        Self { windows }
    }

    pub fn is_active(&self, t: NaiveTime) -> bool {
        self.windows.iter().any(|w| w.contains(t))
    }
}

/// Evaluates trigger conditions with the quiet-hours override
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    quiet_hours: QuietHours,
}

impl Evaluator {
    pub fn new(quiet_hours: QuietHours) -> Self {
        Self { quiet_hours }
    }

    pub fn quiet_hours(&self) -> &QuietHours {
        &self.quiet_hours
    }

    /// Evaluate one trigger. A missing condition always matches.
    pub fn evaluate(
        &self,
        condition: Option<&Expr>,
        quiet_hours_exempt: bool,
        ctx: &EvalContext<'_>,
    ) -> ConditionOutcome {
        if !quiet_hours_exempt && self.quiet_hours.is_active(ctx.local_time.time()) {
            return ConditionOutcome::QuietHours;
        }

        match condition {
            Some(expr) if !expr.evaluate(ctx) => ConditionOutcome::Unmet,
            _ => ConditionOutcome::Matched,
        }
    }
}
