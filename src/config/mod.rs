//! Configuration loading
//!
//! The daemon reads one JSON document with `settings`, `monitors`,
//! `triggers` and `workflows` sections. Loading compiles everything up
//! front: condition strings become [`Expr`] trees, workflows become
//! validated graphs, and monitors get their probe and classifier. Anything
//! malformed is a [`ConfigError`] and nothing is started.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::condition::{parse_condition, Evaluator, Expr, ParseError, QuietHours, TimeWindow};
use crate::probe::{CommandProbe, Probe};
use crate::ratelimit::{BurstSettings, OverflowPolicy};
use crate::state::{Classifier, FlagClassifier, Hysteresis, ThresholdClassifier};
use crate::workflow::{GraphError, StepDef, StepKind, WorkflowGraph};

fn default_true() -> bool {
    true
}

/// Global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cooldown for triggers that don't set their own
    pub default_cooldown_secs: u64,
    pub burst: BurstSettings,
    /// `HH:MM-HH:MM` windows; wrap past midnight is allowed
    pub quiet_hours: Vec<String>,
    /// Upper bound applied to every play volume
    pub max_volume: f32,
    pub workflow_timeout_ms: u64,
    /// How far back `count` conditions can look
    pub counter_horizon_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_cooldown_secs: 300,
            burst: BurstSettings::default(),
            quiet_hours: Vec::new(),
            max_volume: 1.0,
            workflow_timeout_ms: 30_000,
            counter_horizon_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    Command {
        command: String,
        #[serde(default)]
        discover_command: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassifierConfig {
    Threshold(ThresholdClassifier),
    Flag(FlagClassifier),
}

fn default_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub id: String,
    /// Event type prefix, e.g. `cpu` for `cpu.critical`
    pub kind: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub targets: Vec<String>,
    pub probe: ProbeConfig,
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub hysteresis: Hysteresis,
    /// Defaults to the poll interval
    #[serde(default)]
    pub probe_timeout_ms: Option<u64>,
}

/// One entry of a trigger's action list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionConfig {
    Workflow { workflow: String },
    Step(StepKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub id: String,
    /// Exact type, `kind.*` or `*`
    pub event_type: String,
    #[serde(default)]
    pub condition: Option<String>,
    pub actions: Vec<ActionConfig>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub quiet_hours_exempt: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra confirmation on top of the monitor's own hysteresis
    #[serde(default)]
    pub hysteresis: Option<Hysteresis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    /// Defaults to the first step
    #[serde(default)]
    pub entry: Option<String>,
    pub steps: Vec<StepDef>,
}

/// The configuration document as written on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub settings: Settings,
    pub monitors: Vec<MonitorConfig>,
    pub triggers: Vec<TriggerConfig>,
    pub workflows: Vec<WorkflowConfig>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error("trigger '{trigger}' condition: {source}")]
    Condition {
        trigger: String,
        #[source]
        source: ParseError,
    },

    #[error("duplicate {section} id '{id}'")]
    DuplicateId { section: &'static str, id: String },

    #[error("trigger '{trigger}' references unknown workflow '{workflow}'")]
    UnknownWorkflow { trigger: String, workflow: String },

    #[error("monitor '{monitor}': {message}")]
    InvalidMonitor { monitor: String, message: String },

    #[error("trigger '{trigger}': {message}")]
    InvalidTrigger { trigger: String, message: String },

    #[error("settings: {0}")]
    InvalidSettings(String),
}

/// A monitor ready to be scheduled
#[derive(Clone)]
pub struct MonitorSpec {
    pub id: String,
    pub kind: String,
    pub interval: Duration,
    pub targets: Vec<String>,
    pub probe: Arc<dyn Probe>,
    pub classifier: Arc<dyn Classifier>,
    pub hysteresis: Hysteresis,
    pub probe_timeout: Duration,
}

impl std::fmt::Debug for MonitorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("interval", &self.interval)
            .field("targets", &self.targets)
            .finish()
    }
}

/// A trigger with its condition parsed and its actions resolved
#[derive(Debug)]
pub struct CompiledTrigger {
    pub id: String,
    pub event_type: String,
    pub condition_source: Option<String>,
    pub condition: Option<Expr>,
    /// Graphs run in order under one deadline
    pub plan: Arc<Vec<Arc<WorkflowGraph>>>,
    pub cooldown: Duration,
    pub overflow: OverflowPolicy,
    pub quiet_hours_exempt: bool,
    pub enabled: bool,
    pub timeout: Duration,
    /// Per-entity streak and recovery debounce this trigger requires
    pub hysteresis: Option<Hysteresis>,
}

/// The reloadable part of the configuration
#[derive(Debug, Default)]
pub struct TriggerSet {
    pub triggers: Vec<Arc<CompiledTrigger>>,
    pub evaluator: Evaluator,
}

impl TriggerSet {
    pub fn get(&self, id: &str) -> Option<&Arc<CompiledTrigger>> {
        self.triggers.iter().find(|t| t.id == id)
    }
}

/// Fully compiled configuration
#[derive(Debug)]
pub struct CompiledConfig {
    pub settings: Settings,
    pub monitors: Vec<MonitorSpec>,
    pub triggers: TriggerSet,
}

/// Read, parse and compile a configuration file
pub fn load(path: impl AsRef<Path>) -> Result<CompiledConfig, ConfigError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let compiled = parse(&text)?;
    tracing::info!(
        path = %path.as_ref().display(),
        monitors = compiled.monitors.len(),
        triggers = compiled.triggers.triggers.len(),
        "Configuration loaded"
    );
    Ok(compiled)
}

/// Parse and compile a configuration document
pub fn parse(text: &str) -> Result<CompiledConfig, ConfigError> {
    let file: ConfigFile = serde_json::from_str(text)?;
    file.compile()
}

impl ConfigFile {
    pub fn compile(self) -> Result<CompiledConfig, ConfigError> {
        let ConfigFile {
            settings,
            monitors,
            triggers,
            workflows,
        } = self;

        let quiet_hours = compile_quiet_hours(&settings)?;
        if settings.max_volume.is_nan() || settings.max_volume < 0.0 {
            return Err(ConfigError::InvalidSettings(format!(
                "max_volume must be non-negative, got {}",
                settings.max_volume
            )));
        }

        let mut seen = HashSet::new();
        let mut graphs = HashMap::new();
        for workflow in workflows {
            if !seen.insert(workflow.id.clone()) {
                return Err(ConfigError::DuplicateId {
                    section: "workflow",
                    id: workflow.id,
                });
            }
            let graph = WorkflowGraph::build(workflow.id.clone(), workflow.entry, workflow.steps)?;
            graphs.insert(workflow.id, Arc::new(graph));
        }

        let mut seen = HashSet::new();
        let monitors = monitors
            .into_iter()
            .map(|m| {
                if !seen.insert(m.id.clone()) {
                    return Err(ConfigError::DuplicateId {
                        section: "monitor",
                        id: m.id,
                    });
                }
                compile_monitor(m)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        let triggers = triggers
            .into_iter()
            .map(|t| {
                if !seen.insert(t.id.clone()) {
                    return Err(ConfigError::DuplicateId {
                        section: "trigger",
                        id: t.id,
                    });
                }
                compile_trigger(t, &settings, &graphs).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledConfig {
            monitors,
            triggers: TriggerSet {
                triggers,
                evaluator: Evaluator::new(quiet_hours),
            },
            settings,
        })
    }
}

fn compile_quiet_hours(settings: &Settings) -> Result<QuietHours, ConfigError> {
    let windows = settings
        .quiet_hours
        .iter()
        .map(|w| w.parse::<TimeWindow>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(ConfigError::InvalidSettings)?;
    Ok(QuietHours::new(windows))
}

fn compile_monitor(config: MonitorConfig) -> Result<MonitorSpec, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidMonitor {
        monitor: config.id.clone(),
        message,
    };

    if config.interval_secs == 0 {
        return Err(invalid("interval_secs must be at least 1".to_string()));
    }
    if config.kind.is_empty() || config.kind.contains('.') {
        return Err(invalid(format!(
            "kind '{}' must be non-empty and contain no '.'",
            config.kind
        )));
    }

    let probe: Arc<dyn Probe> = match &config.probe {
        ProbeConfig::Command {
            command,
            discover_command,
        } => {
            if config.targets.is_empty() && discover_command.is_none() {
                return Err(invalid(
                    "needs at least one target or a discover_command".to_string(),
                ));
            }
            let probe = CommandProbe::new(command.clone());
            Arc::new(match discover_command {
                Some(d) => probe.with_discovery(d.clone()),
                None => probe,
            })
        }
    };

    let classifier: Arc<dyn Classifier> = match &config.classifier {
        ClassifierConfig::Threshold(c) => {
            c.validate().map_err(invalid)?;
            Arc::new(c.clone())
        }
        ClassifierConfig::Flag(c) => Arc::new(c.clone()),
    };

    let interval = Duration::from_secs(config.interval_secs);
    Ok(MonitorSpec {
        probe_timeout: config
            .probe_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(interval),
        id: config.id,
        kind: config.kind,
        interval,
        targets: config.targets,
        probe,
        classifier,
        hysteresis: config.hysteresis,
    })
}

fn compile_trigger(
    config: TriggerConfig,
    settings: &Settings,
    graphs: &HashMap<String, Arc<WorkflowGraph>>,
) -> Result<CompiledTrigger, ConfigError> {
    if config.event_type.is_empty() {
        return Err(ConfigError::InvalidTrigger {
            trigger: config.id,
            message: "event_type is empty".to_string(),
        });
    }
    if config.actions.is_empty() {
        return Err(ConfigError::InvalidTrigger {
            trigger: config.id,
            message: "no actions".to_string(),
        });
    }

    let condition = match &config.condition {
        Some(source) => Some(parse_condition(source).map_err(|source| {
            ConfigError::Condition {
                trigger: config.id.clone(),
                source,
            }
        })?),
        None => None,
    };

    // Runs of inline steps become anonymous linear graphs
    let mut plan = Vec::new();
    let mut inline = Vec::new();
    for action in config.actions {
        match action {
            ActionConfig::Step(kind) => inline.push(kind),
            ActionConfig::Workflow { workflow } => {
                flush_inline(&config.id, &mut inline, &mut plan)?;
                let graph = graphs
                    .get(&workflow)
                    .ok_or_else(|| ConfigError::UnknownWorkflow {
                        trigger: config.id.clone(),
                        workflow: workflow.clone(),
                    })?;
                plan.push(Arc::clone(graph));
            }
        }
    }
    flush_inline(&config.id, &mut inline, &mut plan)?;

    Ok(CompiledTrigger {
        id: config.id,
        event_type: config.event_type,
        condition_source: config.condition,
        condition,
        plan: Arc::new(plan),
        cooldown: Duration::from_secs(config.cooldown_secs.unwrap_or(settings.default_cooldown_secs)),
        overflow: config.overflow,
        quiet_hours_exempt: config.quiet_hours_exempt,
        enabled: config.enabled,
        timeout: Duration::from_millis(config.timeout_ms.unwrap_or(settings.workflow_timeout_ms)),
        hysteresis: config.hysteresis,
    })
}

fn flush_inline(
    trigger_id: &str,
    inline: &mut Vec<StepKind>,
    plan: &mut Vec<Arc<WorkflowGraph>>,
) -> Result<(), GraphError> {
    if inline.is_empty() {
        return Ok(());
    }
    let id = format!("{}:inline{}", trigger_id, plan.len());
    let graph = WorkflowGraph::linear(id, std::mem::take(inline))?;
    plan.push(Arc::new(graph));
    Ok(())
}

/// Durations as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Optional durations as integer milliseconds
pub mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
