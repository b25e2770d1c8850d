use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classified state of a monitored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Unknown,
    Ok,
    Warning,
    Critical,
    Connected,
    Disconnected,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Ok => "ok",
            Status::Warning => "warning",
            Status::Critical => "critical",
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
        }
    }

    /// Whether this status counts as "down" for hysteresis and recovery.
    pub fn is_failing(&self) -> bool {
        matches!(self, Status::Warning | Status::Critical | Status::Disconnected)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Status::Ok | Status::Connected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(Status::Unknown),
            "ok" => Ok(Status::Ok),
            "warning" => Ok(Status::Warning),
            "critical" => Ok(Status::Critical),
            "connected" => Ok(Status::Connected),
            "disconnected" => Ok(Status::Disconnected),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}
