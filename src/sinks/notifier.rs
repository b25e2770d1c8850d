//! Default action sink

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::time::Duration;

use super::{ActionSink, LogLevel, SinkError};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracing-backed sink with HTTP webhooks and an optional play command
pub struct DefaultSink {
    client: reqwest::Client,
    /// Shell template for audio playback, with `{sound}` and `{volume}`
    play_command: Option<String>,
}

impl DefaultSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_default(),
            play_command: None,
        }
    }

    pub fn with_play_command(mut self, command: Option<String>) -> Self {
        self.play_command = command;
        self
    }

    async fn run_play_command(
        template: &str,
        sound: &str,
        volume: f32,
    ) -> Result<(), SinkError> {
        let command_line = template
            .replace("{sound}", sound)
            .replace("{volume}", &format!("{:.2}", volume));

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| SinkError::Play(format!("Failed to spawn player: {}", e)))?;

        if !status.success() {
            return Err(SinkError::Play(format!(
                "`{}` exited with {}",
                command_line, status
            )));
        }
        Ok(())
    }

    async fn send_webhook(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        payload: &serde_json::Value,
    ) -> Result<(), SinkError> {
        let mut request = self.client.post(url).json(payload);

        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Webhook(format!("Failed to send webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(SinkError::Webhook(format!(
                "Webhook returned status {}",
                response.status()
            )));
        }

        tracing::debug!(url = %url, "Webhook notification sent");
        Ok(())
    }
}

impl Default for DefaultSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionSink for DefaultSink {
    fn play<'a>(&'a self, sound: &'a str, volume: f32) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            match &self.play_command {
                Some(template) => Self::run_play_command(template, sound, volume).await,
                None => {
                    tracing::info!(sound = %sound, volume, "Play requested (no player configured)");
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn notify<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            tracing::warn!(notification = true, "{}", message);
            Ok(())
        }
        .boxed()
    }

    fn log<'a>(
        &'a self,
        level: LogLevel,
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            match level {
                LogLevel::Debug => tracing::debug!(target: "klaxon::action", "{}", message),
                LogLevel::Info => tracing::info!(target: "klaxon::action", "{}", message),
                LogLevel::Warn => tracing::warn!(target: "klaxon::action", "{}", message),
                LogLevel::Error => tracing::error!(target: "klaxon::action", "{}", message),
            }
            Ok(())
        }
        .boxed()
    }

    fn webhook<'a>(
        &'a self,
        url: &'a str,
        headers: &'a HashMap<String, String>,
        payload: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        self.send_webhook(url, headers, payload).boxed()
    }
}
