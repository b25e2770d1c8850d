//! In-memory sink for tests

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{ActionSink, LogLevel, SinkError};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Play { sound: String, volume: f32 },
    Notify(String),
    Log(String),
    Webhook { url: String, payload: serde_json::Value },
}

/// Records every call. Messages listed in `fail_on` fail; `delays` makes a
/// matching log message take that long.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail_on: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, message: &str) {
        self.fail_on.lock().insert(message.to_string());
    }

    pub fn delay(&self, message: &str, delay: Duration) {
        self.delays.lock().insert(message.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Log(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn outcome(&self, key: &str) -> Result<(), SinkError> {
        if self.fail_on.lock().contains(key) {
            Err(SinkError::Notify(format!("refused '{}'", key)))
        } else {
            Ok(())
        }
    }
}

impl ActionSink for RecordingSink {
    fn play<'a>(&'a self, sound: &'a str, volume: f32) -> BoxFuture<'a, Result<(), SinkError>> {
        self.calls.lock().push(SinkCall::Play {
            sound: sound.to_string(),
            volume,
        });
        let result = self.outcome(sound);
        async move { result }.boxed()
    }

    fn notify<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), SinkError>> {
        self.calls.lock().push(SinkCall::Notify(message.to_string()));
        let result = self.outcome(message);
        async move { result }.boxed()
    }

    fn log<'a>(
        &'a self,
        _level: LogLevel,
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        let delay = self.delays.lock().get(message).copied();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().push(SinkCall::Log(message.to_string()));
            self.outcome(message)
        }
        .boxed()
    }

    fn webhook<'a>(
        &'a self,
        url: &'a str,
        _headers: &'a HashMap<String, String>,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        self.calls.lock().push(SinkCall::Webhook {
            url: url.to_string(),
            payload: payload.clone(),
        });
        let result = self.outcome(url);
        async move { result }.boxed()
    }
}
