//! Shell command probe

use futures::future::{BoxFuture, FutureExt};
use tokio::process::Command;

use super::{Probe, ProbeError};
use crate::data::Snapshot;

/// Runs a shell command and parses its stdout into a snapshot.
///
/// `{target}` in the command line is replaced with the sampled target. The
/// shell is killed if the sample is dropped before it finishes.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: String,
    discover_command: Option<String>,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            discover_command: None,
        }
    }

    /// Command whose stdout lists one target per line
    pub fn with_discovery(mut self, command: impl Into<String>) -> Self {
        self.discover_command = Some(command.into());
        self
    }

    async fn run(command_line: &str) -> Result<String, ProbeError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed(format!(
                "`{}` exited with {}: {}",
                command_line,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Probe for CommandProbe {
    fn sample<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Snapshot, ProbeError>> {
        async move {
            let command_line = self.command.replace("{target}", target);
            let stdout = Self::run(&command_line).await?;
            Ok(Snapshot::from_output(&stdout))
        }
        .boxed()
    }

    fn discover(&self) -> BoxFuture<'_, Result<Option<Vec<String>>, ProbeError>> {
        async move {
            let Some(command_line) = &self.discover_command else {
                return Ok(None);
            };
            let stdout = Self::run(command_line).await?;
            let targets = stdout
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            Ok(Some(targets))
        }
        .boxed()
    }
}

/// Wait up to a second for `pid` to exit. A zombie counts as exited.
#[cfg(all(test, target_os = "linux"))]
pub(crate) async fn process_exited(pid: &str) -> bool {
    for _ in 0..50 {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => return true,
            Ok(stat) => {
                let state = stat
                    .rsplit(')')
                    .next()
                    .and_then(|rest| rest.split_whitespace().next());
                if matches!(state, Some("Z") | Some("X")) {
                    return true;
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}
