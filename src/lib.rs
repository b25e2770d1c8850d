//! Klaxon: detection-and-dispatch core for system monitors
//!
//! Klaxon repeatedly samples external state through probes, classifies each
//! sample into a status, and turns status transitions into actions (sounds,
//! logs, notifications, webhooks) through configurable workflows.
//!
//! # Features
//!
//! - **Independent Monitors**: one supervised polling loop per monitor, with
//!   target discovery and eviction
//! - **Hysteresis**: enter/exit threshold bands, sample-count streaks and
//!   debounced recovery
//! - **Storm Control**: per-key cooldowns plus global and per-event-type token
//!   buckets with silence, merge or throttle overflow policies
//! - **Conditions**: a small DSL over time windows, weekdays, values, detail
//!   regexes and recent event counts, with global quiet hours
//! - **Workflows**: sequential, branching, delayed and parallel steps under a
//!   per-run deadline with cancellation
//!
//! # Example
//!
//! ```no_run
//! use klaxon::config;
//! use klaxon::engine::Engine;
//! use klaxon::scheduler::Scheduler;
//! use klaxon::sinks::DefaultSink;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tokio_util::task::TaskTracker;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let compiled = config::load("klaxon.json")?;
//! let engine = Arc::new(Engine::new(
//!     &compiled.settings,
//!     compiled.triggers,
//!     Arc::new(DefaultSink::new()),
//!     CancellationToken::new(),
//!     TaskTracker::new(),
//! ));
//!
//! Scheduler::new(Arc::clone(&engine)).spawn_all(compiled.monitors);
//! tokio::signal::ctrl_c().await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod condition;
pub mod config;
pub mod data;
pub mod engine;
pub mod probe;
pub mod ratelimit;
pub mod scheduler;
pub mod sinks;
pub mod state;
pub mod workflow;

// Re-export commonly used types
pub use config::{load, CompiledConfig, ConfigError};
pub use data::{Snapshot, Status, Transition};
pub use engine::Engine;
pub use scheduler::Scheduler;
