use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time reading produced by a probe.
///
/// Snapshots are opaque to the core: only the monitor's classifier decides
/// what a reading means. The accessors exist so classifiers and condition
/// expressions can look at the common shapes without matching by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Snapshot {
    Flag(bool),
    Number(f64),
    Text(String),
    Record(serde_json::Map<String, serde_json::Value>),
}

impl Snapshot {
    pub fn type_name(&self) -> &'static str {
        match self {
            Snapshot::Flag(_) => "flag",
            Snapshot::Number(_) => "number",
            Snapshot::Text(_) => "text",
            Snapshot::Record(_) => "record",
        }
    }

    /// Numeric view of the reading.
    ///
    /// Records expose their `value` field when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Snapshot::Number(v) => Some(*v),
            Snapshot::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            Snapshot::Text(s) => s.trim().parse().ok(),
            Snapshot::Record(map) => map.get("value").and_then(|v| v.as_f64()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Snapshot::Flag(b) => Some(*b),
            Snapshot::Number(v) => Some(*v != 0.0),
            Snapshot::Text(s) => parse_flag(s),
            Snapshot::Record(map) => map.get("up").and_then(|v| v.as_bool()),
        }
    }

    /// Parse raw probe output into the narrowest snapshot shape.
    pub fn from_output(output: &str) -> Self {
        let trimmed = output.trim();
        let number = trimmed.trim_end_matches('%');
        if let Ok(v) = number.parse::<f64>() {
            return Snapshot::Number(v);
        }
        if let Some(b) = parse_flag(trimmed) {
            return Snapshot::Flag(b);
        }
        if trimmed.starts_with('{') {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
                return Snapshot::Record(map);
            }
        }
        Snapshot::Text(trimmed.to_string())
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "up" | "yes" | "on" | "connected" => Some(true),
        "false" | "down" | "no" | "off" | "disconnected" => Some(false),
        _ => None,
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Snapshot::Flag(b) => write!(f, "{}", b),
            Snapshot::Number(v) => write!(f, "{}", v),
            Snapshot::Text(s) => write!(f, "{}", s),
            Snapshot::Record(map) => write!(f, "{}", serde_json::Value::Object(map.clone())),
        }
    }
}
