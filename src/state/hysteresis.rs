//! Classification policies
//!
//! Classifiers map a snapshot to a raw status, given the status the entity
//! currently holds (needed for enter/exit bands). Sample-count hysteresis and
//! debounced recovery are applied generically by the store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::{Snapshot, Status};

/// Sample-count hysteresis and recovery debounce.
///
/// Set on a monitor it shapes the transitions the store emits; set on a
/// trigger it additionally gates when that trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hysteresis {
    /// Consecutive samples required before entering a failing status
    pub enter_samples: u32,
    /// Consecutive samples required before returning to a healthy status
    pub exit_samples: u32,
    /// Minimum time a failing status must be held for its recovery to be
    /// reported as a transition
    #[serde(rename = "min_down_ms", with = "crate::config::duration_ms")]
    pub min_down: Duration,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            enter_samples: 1,
            exit_samples: 1,
            min_down: Duration::ZERO,
        }
    }
}

impl Hysteresis {
    /// Samples needed to move into `status`
    pub fn required_samples(&self, status: Status) -> u32 {
        let n = if status.is_failing() {
            self.enter_samples
        } else if status.is_healthy() {
            self.exit_samples
        } else {
            1
        };
        n.max(1)
    }
}

/// Maps a snapshot to a status.
pub trait Classifier: Send + Sync {
    fn classify(&self, current: Status, snapshot: &Snapshot) -> Status;
}

/// Threshold band: enter at `enter`, leave only once past `exit`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub enter: f64,
    pub exit: f64,
}

impl Band {
    pub fn new(enter: f64, exit: f64) -> Self {
        Self { enter, exit }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Higher readings are worse (CPU, temperature)
    #[default]
    Above,
    /// Lower readings are worse (free disk, signal strength)
    Below,
}

/// Numeric classifier with warning/critical bands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdClassifier {
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub warning: Option<Band>,
    #[serde(default)]
    pub critical: Option<Band>,
}

impl ThresholdClassifier {
    pub fn critical(enter: f64, exit: f64) -> Self {
        Self {
            direction: Direction::Above,
            warning: None,
            critical: Some(Band::new(enter, exit)),
        }
    }

    pub fn with_warning(mut self, enter: f64, exit: f64) -> Self {
        self.warning = Some(Band::new(enter, exit));
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Check that each band's exit lies on the healthy side of its enter
    pub fn validate(&self) -> Result<(), String> {
        for (name, band) in [("warning", self.warning), ("critical", self.critical)] {
            if let Some(band) = band {
                let ok = match self.direction {
                    Direction::Above => band.exit <= band.enter,
                    Direction::Below => band.exit >= band.enter,
                };
                if !ok {
                    return Err(format!(
                        "{} band exit {} is past its enter threshold {}",
                        name, band.exit, band.enter
                    ));
                }
            }
        }
        if self.warning.is_none() && self.critical.is_none() {
            return Err("threshold classifier needs a warning or critical band".to_string());
        }
        Ok(())
    }

    fn beyond(&self, value: f64, limit: f64) -> bool {
        match self.direction {
            Direction::Above => value >= limit,
            Direction::Below => value <= limit,
        }
    }
}

impl Classifier for ThresholdClassifier {
    fn classify(&self, current: Status, snapshot: &Snapshot) -> Status {
        let Some(value) = snapshot.as_f64().filter(|v| v.is_finite()) else {
            return Status::Unknown;
        };

        if let Some(band) = self.critical {
            let held = current == Status::Critical && self.beyond(value, band.exit);
            if self.beyond(value, band.enter) || held {
                return Status::Critical;
            }
        }

        if let Some(band) = self.warning {
            let held = current.is_failing() && self.beyond(value, band.exit);
            if self.beyond(value, band.enter) || held {
                return Status::Warning;
            }
        }

        Status::Ok
    }
}

/// Boolean classifier (link up/down, process present/absent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagClassifier {
    pub healthy: Status,
    pub failing: Status,
}

impl Default for FlagClassifier {
    fn default() -> Self {
        Self {
            healthy: Status::Connected,
            failing: Status::Disconnected,
        }
    }
}

impl Classifier for FlagClassifier {
    fn classify(&self, _current: Status, snapshot: &Snapshot) -> Status {
        match snapshot.as_bool() {
            Some(true) => self.healthy,
            Some(false) => self.failing,
            None => Status::Unknown,
        }
    }
}
