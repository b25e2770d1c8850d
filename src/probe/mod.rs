//! Probe capability
//!
//! A probe samples external state for one target. Sampling is async so the
//! scheduler can bound it with a timeout and drop it on shutdown; a probe
//! that wraps blocking work should move it onto the blocking pool itself.

pub mod command;

use futures::future::{BoxFuture, FutureExt};
use std::time::Duration;

use crate::data::Snapshot;

pub use command::CommandProbe;

/// Samples one kind of external state.
pub trait Probe: Send + Sync {
    /// Take a point-in-time reading of `target`.
    ///
    /// Must be safe to call repeatedly. Dropping the future abandons the
    /// sample and must release whatever it started.
    fn sample<'a>(&'a self, target: &'a str) -> BoxFuture<'a, Result<Snapshot, ProbeError>>;

    /// Enumerate the current targets, for probes whose watch list changes at
    /// runtime (devices, interfaces). `None` means the configured list is
    /// authoritative.
    fn discover(&self) -> BoxFuture<'_, Result<Option<Vec<String>>, ProbeError>> {
        async { Ok(None) }.boxed()
    }
}

/// Probe errors. Always transient from the core's point of view.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe failed: {0}")]
    Failed(String),

    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
