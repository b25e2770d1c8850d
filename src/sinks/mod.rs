//! Action sinks
//!
//! Workflow steps hand their side effects to an [`ActionSink`]. The default
//! sink logs through tracing, posts webhooks with reqwest and optionally
//! runs an audio command.

pub mod notifier;

#[cfg(test)]
pub(crate) mod recording;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use notifier::DefaultSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// External side effects available to workflows.
pub trait ActionSink: Send + Sync {
    fn play<'a>(&'a self, sound: &'a str, volume: f32) -> BoxFuture<'a, Result<(), SinkError>>;

    fn notify<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), SinkError>>;

    fn log<'a>(&'a self, level: LogLevel, message: &'a str)
        -> BoxFuture<'a, Result<(), SinkError>>;

    fn webhook<'a>(
        &'a self,
        url: &'a str,
        headers: &'a HashMap<String, String>,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<(), SinkError>>;
}

/// Sink errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Play error: {0}")]
    Play(String),

    #[error("Notify error: {0}")]
    Notify(String),
}
