//! Workflow execution
//!
//! One run executes a trigger's plan (a sequence of graphs) under a single
//! deadline. Parallel groups poll their branches concurrently inside the
//! run's task and join them before moving on; a branch that overruns the
//! group's slice is marked timed out without failing its siblings.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::graph::{StepDef, StepKind, WorkflowGraph};
use crate::condition::{EvalContext, EventCounter, Expr};
use crate::data::Transition;
use crate::ratelimit::clamp_volume;
use crate::sinks::{ActionSink, SinkError};

/// Step failures
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("step '{step}' failed: {reason}")]
    Aborted { step: String, reason: String },
}

/// Lifecycle of one workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending | RunState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Completed,
    Failed,
    TimedOut,
}

/// Outcome of one parallel branch
#[derive(Debug, Clone, Serialize)]
pub struct BranchOutcome {
    /// Entry step of the branch
    pub entry: String,
    pub state: StepState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_id: String,
    pub kind: &'static str,
    pub state: StepState,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchOutcome>,
}

/// Summary of a finished (or in-flight) run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: u64,
    pub trigger_id: String,
    pub entity_key: String,
    pub event_type: String,
    pub state: RunState,
    /// Firings folded into this run by the merge policy
    pub merged: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    pub error: Option<String>,
}

/// Everything needed to execute one firing
pub struct RunRequest {
    pub run_id: u64,
    pub trigger_id: String,
    pub plan: Arc<Vec<Arc<WorkflowGraph>>>,
    pub transition: Transition,
    pub merged: u64,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl RunReport {
    pub fn pending(request: &RunRequest) -> Self {
        Self {
            run_id: request.run_id,
            trigger_id: request.trigger_id.clone(),
            entity_key: request.transition.entity_key.clone(),
            event_type: request.transition.event_type.clone(),
            state: RunState::Pending,
            merged: request.merged,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            error: None,
        }
    }
}

/// Executes workflow runs against an action sink
pub struct Executor {
    sink: Arc<dyn ActionSink>,
    counter: Arc<EventCounter>,
    max_volume: f32,
    tracker: TaskTracker,
}

impl Executor {
    pub fn new(
        sink: Arc<dyn ActionSink>,
        counter: Arc<EventCounter>,
        max_volume: f32,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            sink,
            counter,
            max_volume,
            tracker,
        }
    }

    /// Execute a run to a terminal state
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let mut report = RunReport::pending(&request);
        report.state = RunState::Running;

        let deadline = Instant::now() + request.timeout;
        let records = Mutex::new(Vec::new());
        let ctx = RunContext {
            executor: self,
            trigger_id: &request.trigger_id,
            transition: &request.transition,
            merged: request.merged,
            deadline,
            records: &records,
            cancel: &request.cancel,
        };

        let body = async {
            for graph in request.plan.iter() {
                run_chain(&ctx, graph, &graph.entry).await?;
            }
            Ok::<(), StepError>(())
        };

        let (state, error) = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => (RunState::Cancelled, None),
            result = timeout_at(deadline, body) => match result {
                Ok(Ok(())) => (RunState::Completed, None),
                Ok(Err(e)) => (RunState::Failed, Some(e.to_string())),
                Err(_) => (
                    RunState::TimedOut,
                    Some(format!("workflow exceeded {:?}", request.timeout)),
                ),
            },
        };

        report.state = state;
        report.error = error;
        report.steps = records.into_inner();
        report.finished_at = Some(Utc::now());

        match state {
            RunState::Completed => tracing::debug!(
                run_id = report.run_id,
                trigger_id = %report.trigger_id,
                steps = report.steps.len(),
                "Workflow completed"
            ),
            _ => tracing::warn!(
                run_id = report.run_id,
                trigger_id = %report.trigger_id,
                state = ?state,
                error = ?report.error,
                "Workflow did not complete"
            ),
        }

        report
    }
}

struct RunContext<'a> {
    executor: &'a Executor,
    trigger_id: &'a str,
    transition: &'a Transition,
    merged: u64,
    deadline: Instant,
    records: &'a Mutex<Vec<StepRecord>>,
    cancel: &'a CancellationToken,
}

impl RunContext<'_> {
    fn record(
        &self,
        def: &StepDef,
        state: StepState,
        error: Option<String>,
        started: Instant,
        branches: Vec<BranchOutcome>,
    ) {
        self.records.lock().push(StepRecord {
            step_id: def.id.clone(),
            kind: def.kind.name(),
            state,
            error,
            elapsed_ms: started.elapsed().as_millis() as u64,
            branches,
        });
    }

    fn evaluate(&self, expr: &Expr) -> bool {
        let ctx = EvalContext {
            transition: self.transition,
            local_time: chrono::Local::now().naive_local(),
            counter: &self.executor.counter,
            now: Instant::now(),
        };
        expr.evaluate(&ctx)
    }

    /// Substitute transition fields into a message template
    fn render(&self, template: &str) -> String {
        let t = self.transition;
        let value = t
            .value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        template
            .replace("{entity}", &t.entity_key)
            .replace("{event}", &t.event_type)
            .replace("{from}", t.from.as_str())
            .replace("{to}", t.to.as_str())
            .replace("{detail}", &t.detail)
            .replace("{value}", &value)
            .replace("{trigger}", self.trigger_id)
            .replace("{merged}", &self.merged.to_string())
    }

    fn render_json(&self, template: &serde_json::Value) -> serde_json::Value {
        match template {
            serde_json::Value::String(s) => serde_json::Value::String(self.render(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.render_json(v)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn default_payload(&self) -> serde_json::Value {
        let t = self.transition;
        serde_json::json!({
            "trigger_id": self.trigger_id,
            "entity": t.entity_key,
            "event_type": t.event_type,
            "from": t.from,
            "to": t.to,
            "detail": t.detail,
            "value": t.value,
            "merged": self.merged,
            "timestamp": t.at.to_rfc3339(),
        })
    }

    async fn execute(&self, kind: &StepKind) -> Result<(), StepError> {
        let sink = &self.executor.sink;
        match kind {
            StepKind::Play { sound, volume } => {
                let volume = clamp_volume(*volume, self.executor.max_volume);
                let sink = Arc::clone(sink);
                let cancel = self.cancel.clone();
                let sound = sound.clone();
                self.executor.tracker.spawn(async move {
                    tokio::select! {
                        result = sink.play(&sound, volume) => {
                            if let Err(e) = result {
                                tracing::warn!(sound = %sound, error = %e, "Play failed");
                            }
                        }
                        _ = cancel.cancelled() => {}
                    }
                });
                Ok(())
            }
            StepKind::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            StepKind::Webhook {
                url,
                headers,
                payload,
            } => {
                let body = match payload {
                    Some(template) => self.render_json(template),
                    None => self.default_payload(),
                };
                Ok(sink.webhook(url, headers, &body).await?)
            }
            StepKind::Log { message, level } => Ok(sink.log(*level, &self.render(message)).await?),
            StepKind::Notify { message } => Ok(sink.notify(&self.render(message)).await?),
            StepKind::Condition { .. } | StepKind::Branch | StepKind::ParallelGroup { .. } => Ok(()),
        }
    }
}

fn run_chain<'a>(
    ctx: &'a RunContext<'a>,
    graph: &'a WorkflowGraph,
    start: &'a str,
) -> BoxFuture<'a, Result<(), StepError>> {
    async move {
        let mut current = Some(start);
        let mut last_ok = true;

        while let Some(id) = current {
            let Some(step) = graph.step(id) else {
                return Err(StepError::UnknownStep(id.to_string()));
            };
            let def = &step.def;
            let started = Instant::now();

            match &def.kind {
                StepKind::Condition { .. } => {
                    let matched = step
                        .condition
                        .as_ref()
                        .map(|expr| ctx.evaluate(expr))
                        .unwrap_or(true);
                    ctx.record(def, StepState::Completed, None, started, Vec::new());
                    current = if matched {
                        def.branch_true.as_deref()
                    } else {
                        def.branch_false.as_deref()
                    };
                    continue;
                }
                StepKind::Branch => {
                    ctx.record(def, StepState::Completed, None, started, Vec::new());
                    current = if last_ok {
                        def.branch_true.as_deref()
                    } else {
                        def.branch_false.as_deref()
                    };
                    continue;
                }
                StepKind::ParallelGroup { timeout } => {
                    let branches = run_parallel(ctx, graph, def, *timeout).await;
                    let ok = branches.iter().all(|b| b.state == StepState::Completed);
                    let error = (!ok).then(|| {
                        let failed: Vec<&str> = branches
                            .iter()
                            .filter(|b| b.state != StepState::Completed)
                            .map(|b| b.entry.as_str())
                            .collect();
                        format!("branches did not complete: {}", failed.join(", "))
                    });
                    let state = if ok {
                        StepState::Completed
                    } else {
                        StepState::Failed
                    };
                    ctx.record(def, state, error.clone(), started, branches);
                    last_ok = ok;
                    if let Some(reason) = error {
                        if !def.continue_on_fail {
                            return Err(StepError::Aborted {
                                step: def.id.clone(),
                                reason,
                            });
                        }
                    }
                }
                kind => match ctx.execute(kind).await {
                    Ok(()) => {
                        ctx.record(def, StepState::Completed, None, started, Vec::new());
                        last_ok = true;
                    }
                    Err(e) => {
                        tracing::warn!(
                            trigger_id = %ctx.trigger_id,
                            step = %def.id,
                            error = %e,
                            "Workflow step failed"
                        );
                        ctx.record(def, StepState::Failed, Some(e.to_string()), started, Vec::new());
                        last_ok = false;
                        if !def.continue_on_fail {
                            return Err(StepError::Aborted {
                                step: def.id.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                },
            }

            current = def.next.as_deref();
        }

        Ok(())
    }
    .boxed()
}

async fn run_parallel<'a>(
    ctx: &'a RunContext<'a>,
    graph: &'a WorkflowGraph,
    def: &'a StepDef,
    timeout: Option<Duration>,
) -> Vec<BranchOutcome> {
    let group_deadline = timeout
        .map(|t| (Instant::now() + t).min(ctx.deadline))
        .unwrap_or(ctx.deadline);

    let branches = def.parallel_with.iter().map(|entry| async move {
        let (state, error) = match timeout_at(group_deadline, run_chain(ctx, graph, entry)).await {
            Ok(Ok(())) => (StepState::Completed, None),
            Ok(Err(e)) => (StepState::Failed, Some(e.to_string())),
            Err(_) => (
                StepState::TimedOut,
                Some("branch exceeded the group's time slice".to_string()),
            ),
        };
        BranchOutcome {
            entry: entry.clone(),
            state,
            error,
        }
    });

    join_all(branches).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Status;
    use crate::sinks::recording::{RecordingSink, SinkCall};
    use crate::sinks::LogLevel;

    struct Harness {
        sink: Arc<RecordingSink>,
        executor: Executor,
        tracker: TaskTracker,
    }

    impl Harness {
        fn new(max_volume: f32) -> Self {
            let sink = Arc::new(RecordingSink::new());
            let tracker = TaskTracker::new();
            let executor = Executor::new(
                Arc::clone(&sink) as Arc<dyn ActionSink>,
                Arc::new(EventCounter::default()),
                max_volume,
                tracker.clone(),
            );
            Self {
                sink,
                executor,
                tracker,
            }
        }

        async fn run(&self, graph: WorkflowGraph, timeout: Duration) -> RunReport {
            self.executor.run(request(graph, timeout, CancellationToken::new())).await
        }
    }

    fn request(graph: WorkflowGraph, timeout: Duration, cancel: CancellationToken) -> RunRequest {
        RunRequest {
            run_id: 1,
            trigger_id: "cpu-alert".to_string(),
            plan: Arc::new(vec![Arc::new(graph)]),
            transition: Transition::new("cpu/host", "cpu", Status::Ok, Status::Critical, "96")
                .with_value(Some(96.0)),
            merged: 0,
            timeout,
            cancel,
        }
    }

    fn log(id: &str, message: &str) -> StepDef {
        StepDef::new(
            id,
            StepKind::Log {
                message: message.to_string(),
                level: LogLevel::Info,
            },
        )
    }

    fn wait(id: &str, ms: u64) -> StepDef {
        StepDef::new(
            id,
            StepKind::Wait {
                duration: Duration::from_millis(ms),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_with_wait() {
        let h = Harness::new(1.0);
        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![
                log("a", "{entity} went {from} -> {to} at {value}").then("pause"),
                wait("pause", 1000).then("b"),
                log("b", "done"),
            ],
        )
        .unwrap();

        let start = Instant::now();
        let report = h.run(graph, Duration::from_secs(30)).await;

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.steps.len(), 3);
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(
            h.sink.logs(),
            vec!["cpu/host went ok -> critical at 96".to_string(), "done".to_string()]
        );
    }

    #[tokio::test]
    async fn test_condition_branching() {
        let h = Harness::new(1.0);
        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![
                StepDef::new(
                    "check",
                    StepKind::Condition {
                        condition: "value > 90".to_string(),
                    },
                )
                .branches(Some("hot"), Some("mild")),
                log("hot", "hot"),
                log("mild", "mild"),
            ],
        )
        .unwrap();

        let report = h.run(graph, Duration::from_secs(5)).await;
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(h.sink.logs(), vec!["hot".to_string()]);

        // Absent branch ends the workflow
        let h = Harness::new(1.0);
        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![
                StepDef::new(
                    "check",
                    StepKind::Condition {
                        condition: "value < 10".to_string(),
                    },
                )
                .branches(Some("hot"), None),
                log("hot", "hot"),
            ],
        )
        .unwrap();
        let report = h.run(graph, Duration::from_secs(5)).await;
        assert_eq!(report.state, RunState::Completed);
        assert!(h.sink.logs().is_empty());
    }

    #[tokio::test]
    async fn test_branch_on_previous_outcome() {
        let h = Harness::new(1.0);
        h.sink.fail_on("primary");
        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![
                log("send", "primary").then("route"),
                StepDef::new("route", StepKind::Branch).branches(Some("ok"), Some("fallback")),
                log("ok", "sent"),
                log("fallback", "fallback"),
            ],
        )
        .unwrap();

        let report = h.run(graph, Duration::from_secs(5)).await;
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.steps[0].state, StepState::Failed);
        assert_eq!(h.sink.logs(), vec!["primary".to_string(), "fallback".to_string()]);
    }

    #[tokio::test]
    async fn test_abort_on_fail() {
        let h = Harness::new(1.0);
        h.sink.fail_on("critical-step");
        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![
                log("a", "critical-step").abort_on_fail().then("b"),
                log("b", "never"),
            ],
        )
        .unwrap();

        let report = h.run(graph, Duration::from_secs(5)).await;
        assert_eq!(report.state, RunState::Failed);
        assert!(report.error.unwrap().contains("step 'a' failed"));
        assert_eq!(h.sink.logs(), vec!["critical-step".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_group_branch_timeout() {
        let h = Harness::new(1.0);
        h.sink.delay("one", Duration::from_millis(10));
        h.sink.delay("two", Duration::from_millis(5000));
        h.sink.delay("three", Duration::from_millis(20));

        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![
                StepDef::new("fan", StepKind::ParallelGroup { timeout: None })
                    .parallel(&["b1", "b2", "b3"])
                    .then("after"),
                log("b1", "one"),
                log("b2", "two"),
                log("b3", "three"),
                log("after", "after"),
            ],
        )
        .unwrap();

        let start = Instant::now();
        let report = h.run(graph, Duration::from_millis(200)).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));

        // The group shares the run deadline; the step after it finishes in the
        // same poll, so the run itself completes
        assert_eq!(report.state, RunState::Completed);
        assert!(report.error.is_none());

        let group = &report.steps[report.steps.len() - 2];
        assert_eq!(group.step_id, "fan");
        let states: Vec<(&str, StepState)> = group
            .branches
            .iter()
            .map(|b| (b.entry.as_str(), b.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("b1", StepState::Completed),
                ("b2", StepState::TimedOut),
                ("b3", StepState::Completed),
            ]
        );

        // The workflow moved past the group
        assert_eq!(report.steps.last().unwrap().step_id, "after");
        assert!(h.sink.logs().contains(&"after".to_string()));
        assert!(!h.sink.logs().contains(&"two".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_slice_shorter_than_workflow() {
        let h = Harness::new(1.0);
        h.sink.delay("slow", Duration::from_secs(5));
        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![
                StepDef::new(
                    "fan",
                    StepKind::ParallelGroup {
                        timeout: Some(Duration::from_millis(100)),
                    },
                )
                .parallel(&["s"])
                .then("after"),
                log("s", "slow"),
                log("after", "after"),
            ],
        )
        .unwrap();

        let report = h.run(graph, Duration::from_secs(10)).await;
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.steps[0].state, StepState::Failed);
        assert_eq!(report.steps[0].branches[0].state, StepState::TimedOut);
        assert_eq!(h.sink.logs(), vec!["after".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout() {
        let h = Harness::new(1.0);
        let graph = WorkflowGraph::build(
            "wf",
            None,
            vec![log("a", "before").then("w"), wait("w", 10_000).then("b"), log("b", "after")],
        )
        .unwrap();

        let report = h.run(graph, Duration::from_secs(1)).await;
        assert_eq!(report.state, RunState::TimedOut);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(h.sink.logs(), vec!["before".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_wait() {
        let h = Harness::new(1.0);
        let graph = WorkflowGraph::build("wf", None, vec![wait("w", 60_000).then("b"), log("b", "x")])
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = h
            .executor
            .run(request(graph, Duration::from_secs(120), cancel))
            .await;
        assert_eq!(report.state, RunState::Cancelled);
        assert!(report.state.is_terminal());
        assert!(h.sink.logs().is_empty());
    }

    #[tokio::test]
    async fn test_play_is_clamped_and_detached() {
        let h = Harness::new(0.6);
        let graph = WorkflowGraph::linear(
            "inline",
            vec![StepKind::Play {
                sound: "siren.wav".to_string(),
                volume: 1.5,
            }],
        )
        .unwrap();

        let report = h.run(graph, Duration::from_secs(5)).await;
        assert_eq!(report.state, RunState::Completed);

        h.tracker.close();
        h.tracker.wait().await;
        assert_eq!(
            h.sink.calls(),
            vec![SinkCall::Play {
                sound: "siren.wav".to_string(),
                volume: 0.6
            }]
        );
    }

    #[tokio::test]
    async fn test_webhook_payloads() {
        let h = Harness::new(1.0);
        let graph = WorkflowGraph::linear(
            "hooks",
            vec![
                StepKind::Webhook {
                    url: "http://hooks.local/default".to_string(),
                    headers: Default::default(),
                    payload: None,
                },
                StepKind::Webhook {
                    url: "http://hooks.local/custom".to_string(),
                    headers: Default::default(),
                    payload: Some(serde_json::json!({ "text": "{trigger}: {entity} is {to}", "n": 1 })),
                },
            ],
        )
        .unwrap();

        h.run(graph, Duration::from_secs(5)).await;
        let calls = h.sink.calls();

        let SinkCall::Webhook { payload, .. } = &calls[0] else {
            panic!("expected webhook");
        };
        assert_eq!(payload["trigger_id"], "cpu-alert");
        assert_eq!(payload["to"], "critical");
        assert_eq!(payload["value"], 96.0);

        let SinkCall::Webhook { payload, .. } = &calls[1] else {
            panic!("expected webhook");
        };
        assert_eq!(
            payload,
            &serde_json::json!({ "text": "cpu-alert: cpu/host is critical", "n": 1 })
        );
    }
}
