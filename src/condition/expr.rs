//! Typed condition expressions

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use super::counter::EventCounter;
use crate::data::{Status, Transition};

/// Time-of-day window, `[start, end)`. Wraps midnight when `end < start`;
/// `start == end` covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    /// Parse `HH:MM-HH:MM`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("time window '{}' must look like HH:MM-HH:MM", s))?;
        Ok(Self {
            start: parse_clock(start)?,
            end: parse_clock(end)?,
        })
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

impl Serialize for TimeWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub(crate) fn parse_clock(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| format!("invalid time '{}'", s.trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    GtEq,
    Lt,
    LtEq,
    Eq,
    NotEq,
}

impl CmpOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Gt => lhs > rhs,
            CmpOp::GtEq => lhs >= rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::LtEq => lhs <= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::NotEq => lhs != rhs,
        }
    }
}

/// Condition expression, parsed once at load time
#[derive(Debug, Clone)]
pub enum Expr {
    All(Vec<Expr>),
    Any(Vec<Expr>),
    Not(Box<Expr>),
    TimeOfDay(TimeWindow),
    Days(Vec<Weekday>),
    Value { op: CmpOp, rhs: f64 },
    Detail(Regex),
    /// More/fewer than `count` events of this event type within `window`
    RecentCount { op: CmpOp, count: u64, window: Duration },
    FromStatus { status: Status, negate: bool },
    ToStatus { status: Status, negate: bool },
}

/// Inputs available while evaluating an expression
pub struct EvalContext<'a> {
    pub transition: &'a Transition,
    /// Local wall-clock time of the evaluation
    pub local_time: NaiveDateTime,
    pub counter: &'a EventCounter,
    pub now: Instant,
}

impl Expr {
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Expr::All(items) => items.iter().all(|e| e.evaluate(ctx)),
            Expr::Any(items) => items.iter().any(|e| e.evaluate(ctx)),
            Expr::Not(inner) => !inner.evaluate(ctx),
            Expr::TimeOfDay(window) => window.contains(ctx.local_time.time()),
            Expr::Days(days) => days.contains(&ctx.local_time.weekday()),
            Expr::Value { op, rhs } => ctx
                .transition
                .value
                .map(|v| op.apply(v, *rhs))
                .unwrap_or(false),
            Expr::Detail(re) => re.is_match(&ctx.transition.detail),
            Expr::RecentCount { op, count, window } => {
                let seen = ctx
                    .counter
                    .count_within(&ctx.transition.event_type, *window, ctx.now);
                op.apply(seen as f64, *count as f64)
            }
            Expr::FromStatus { status, negate } => (ctx.transition.from == *status) != *negate,
            Expr::ToStatus { status, negate } => (ctx.transition.to == *status) != *negate,
        }
    }

    /// Longest counting window referenced by this expression
    pub fn max_window(&self) -> Option<Duration> {
        match self {
            Expr::All(items) | Expr::Any(items) => {
                items.iter().filter_map(Expr::max_window).max()
            }
            Expr::Not(inner) => inner.max_window(),
            Expr::RecentCount { window, .. } => Some(*window),
            _ => None,
        }
    }
}
