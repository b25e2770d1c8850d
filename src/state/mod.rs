//! State store and transition classification

pub mod hysteresis;
pub mod store;

pub use hysteresis::{
    Band, Classifier, Direction, FlagClassifier, Hysteresis, ThresholdClassifier,
};
pub use store::{entity_key, MonitoredEntity, Observation, StateStore};
