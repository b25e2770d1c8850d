//! Workflow step definitions and graph validation

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::condition::{parse_condition, Expr, ParseError};
use crate::config::{duration_ms, duration_ms_opt};
use crate::sinks::LogLevel;

fn default_volume() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Play a sound (fire-and-forget)
    Play {
        sound: String,
        #[serde(default = "default_volume")]
        volume: f32,
    },
    /// Suspend this workflow instance
    Wait {
        #[serde(rename = "duration_ms", with = "duration_ms")]
        duration: Duration,
    },
    /// Jump on a condition expression
    Condition { condition: String },
    /// Jump on the outcome of the previous step
    Branch,
    /// Run `parallel_with` concurrently, then continue at `next`
    ParallelGroup {
        #[serde(default, rename = "timeout_ms", with = "duration_ms_opt")]
        timeout: Option<Duration>,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Payload template; string leaves are rendered
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    Notify { message: String },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Play { .. } => "play",
            StepKind::Wait { .. } => "wait",
            StepKind::Condition { .. } => "condition",
            StepKind::Branch => "branch",
            StepKind::ParallelGroup { .. } => "parallel_group",
            StepKind::Webhook { .. } => "webhook",
            StepKind::Log { .. } => "log",
            StepKind::Notify { .. } => "notify",
        }
    }

    fn is_branching(&self) -> bool {
        matches!(self, StepKind::Condition { .. } | StepKind::Branch)
    }
}

/// Step as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub branch_true: Option<String>,
    #[serde(default)]
    pub branch_false: Option<String>,
    #[serde(default)]
    pub parallel_with: Vec<String>,
    /// When false, a failure of this step aborts the workflow
    #[serde(default = "default_true")]
    pub continue_on_fail: bool,
}

impl StepDef {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            branch_true: None,
            branch_false: None,
            parallel_with: Vec::new(),
            continue_on_fail: true,
        }
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn branches(mut self, on_true: Option<&str>, on_false: Option<&str>) -> Self {
        self.branch_true = on_true.map(String::from);
        self.branch_false = on_false.map(String::from);
        self
    }

    pub fn parallel(mut self, steps: &[&str]) -> Self {
        self.parallel_with = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn abort_on_fail(mut self) -> Self {
        self.continue_on_fail = false;
        self
    }

    fn edges(&self) -> impl Iterator<Item = &String> {
        self.next
            .iter()
            .chain(self.branch_true.iter())
            .chain(self.branch_false.iter())
            .chain(self.parallel_with.iter())
    }
}

/// Validated step with its condition compiled
#[derive(Debug, Clone)]
pub struct Step {
    pub def: StepDef,
    pub condition: Option<Expr>,
}

/// Graph construction errors
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("workflow '{0}' has no steps")]
    Empty(String),

    #[error("workflow '{workflow}': duplicate step id '{step}'")]
    DuplicateStep { workflow: String, step: String },

    #[error("workflow '{workflow}': step '{from}' references missing step '{to}'")]
    MissingStep {
        workflow: String,
        from: String,
        to: String,
    },

    #[error("workflow '{workflow}': entry step '{entry}' does not exist")]
    MissingEntry { workflow: String, entry: String },

    #[error("workflow '{workflow}': cycle through {}", .path.join(" -> "))]
    Cycle { workflow: String, path: Vec<String> },

    #[error("workflow '{workflow}': parallel group '{step}' lists no steps")]
    EmptyParallel { workflow: String, step: String },

    #[error("workflow '{workflow}': step '{step}' is a {kind} step and cannot have {field}")]
    InvalidEdge {
        workflow: String,
        step: String,
        kind: &'static str,
        field: &'static str,
    },

    #[error("workflow '{workflow}': step '{step}' condition: {source}")]
    Condition {
        workflow: String,
        step: String,
        #[source]
        source: ParseError,
    },
}

/// Directed acyclic step graph with a single entry
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub id: String,
    pub entry: String,
    steps: HashMap<String, Step>,
}

impl WorkflowGraph {
    /// Validate and compile a set of step definitions.
    ///
    /// `entry` defaults to the first step.
    pub fn build(
        id: impl Into<String>,
        entry: Option<String>,
        defs: Vec<StepDef>,
    ) -> Result<Self, GraphError> {
        let id = id.into();
        let entry = match entry.or_else(|| defs.first().map(|d| d.id.clone())) {
            Some(entry) => entry,
            None => return Err(GraphError::Empty(id)),
        };

        let mut steps = HashMap::with_capacity(defs.len());
        for def in defs {
            Self::check_shape(&id, &def)?;
            let condition = match &def.kind {
                StepKind::Condition { condition } => {
                    Some(parse_condition(condition).map_err(|source| GraphError::Condition {
                        workflow: id.clone(),
                        step: def.id.clone(),
                        source,
                    })?)
                }
                _ => None,
            };
            let step_id = def.id.clone();
            if steps.insert(step_id.clone(), Step { def, condition }).is_some() {
                return Err(GraphError::DuplicateStep {
                    workflow: id,
                    step: step_id,
                });
            }
        }

        if !steps.contains_key(&entry) {
            return Err(GraphError::MissingEntry {
                workflow: id,
                entry,
            });
        }

        for step in steps.values() {
            for to in step.def.edges() {
                if !steps.contains_key(to) {
                    return Err(GraphError::MissingStep {
                        workflow: id.clone(),
                        from: step.def.id.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        let graph = Self { id, entry, steps };
        graph.check_acyclic()?;

        let reachable = graph.reachable();
        for step_id in graph.steps.keys() {
            if !reachable.contains(step_id.as_str()) {
                tracing::warn!(workflow = %graph.id, step = %step_id, "Step is unreachable from entry");
            }
        }

        Ok(graph)
    }

    fn check_shape(workflow: &str, def: &StepDef) -> Result<(), GraphError> {
        let invalid = |field: &'static str| GraphError::InvalidEdge {
            workflow: workflow.to_string(),
            step: def.id.clone(),
            kind: def.kind.name(),
            field,
        };

        if !def.kind.is_branching() && (def.branch_true.is_some() || def.branch_false.is_some()) {
            return Err(invalid("branch targets"));
        }
        if def.kind.is_branching() && def.next.is_some() {
            return Err(invalid("a next step"));
        }
        match def.kind {
            StepKind::ParallelGroup { .. } if def.parallel_with.is_empty() => {
                Err(GraphError::EmptyParallel {
                    workflow: workflow.to_string(),
                    step: def.id.clone(),
                })
            }
            StepKind::ParallelGroup { .. } => Ok(()),
            _ if !def.parallel_with.is_empty() => Err(invalid("parallel steps")),
            _ => Ok(()),
        }
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a WorkflowGraph,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Result<(), Vec<String>> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == id).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(id.to_string());
                    return Err(cycle);
                }
                None => {}
            }

            marks.insert(id, Mark::Visiting);
            path.push(id);
            if let Some(step) = graph.steps.get(id) {
                for to in step.def.edges() {
                    visit(graph, to, marks, path)?;
                }
            }
            path.pop();
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut ids: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        ids.sort_unstable();
        for id in ids {
            let mut path = Vec::new();
            visit(self, id, &mut marks, &mut path).map_err(|path| GraphError::Cycle {
                workflow: self.id.clone(),
                path,
            })?;
        }
        Ok(())
    }

    fn reachable(&self) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry.as_str()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(step) = self.steps.get(id) {
                stack.extend(step.def.edges().map(String::as_str));
            }
        }
        seen
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Chain inline actions into an anonymous linear workflow
    pub fn linear(id: impl Into<String>, kinds: Vec<StepKind>) -> Result<Self, GraphError> {
        let id = id.into();
        let count = kinds.len();
        let defs = kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| {
                let def = StepDef::new(format!("{}#{}", id, i), kind);
                if i + 1 < count {
                    def.then(format!("{}#{}", id, i + 1))
                } else {
                    def
                }
            })
            .collect();
        Self::build(id, None, defs)
    }
}
