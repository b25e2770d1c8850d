//! Workflow engine
//!
//! Workflows are validated step graphs. A trigger's action plan is a list of
//! graphs run back to back by the [`Executor`].

pub mod executor;
pub mod graph;

pub use executor::{
    BranchOutcome, Executor, RunReport, RunRequest, RunState, StepError, StepRecord, StepState,
};
pub use graph::{GraphError, Step, StepDef, StepKind, WorkflowGraph};
