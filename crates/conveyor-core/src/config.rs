//! Declarative config types.
//!
//! These types represent the user-authored YAML configuration: a table of
//! job definitions plus one or more workflows wiring those jobs together
//! with `requires` edges and branch/tag filters.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Name of the workflow synthesized for configs that only declare a `build` job.
pub const DEFAULT_WORKFLOW: &str = "default";

pub const DEFAULT_NO_OUTPUT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
    #[serde(default)]
    pub workflows: Workflows,
}

impl ConfigFile {
    /// Parse a config from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: ConfigFile = serde_yaml::from_str(content)?;
        config.synthesize_default_workflow();
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Look up a workflow by name.
    pub fn workflow(&self, name: &str) -> Result<&WorkflowDefinition> {
        self.workflows
            .definitions
            .get(name)
            .ok_or_else(|| Error::WorkflowNotFound(name.to_string()))
    }

    pub fn workflow_names(&self) -> Vec<&str> {
        self.workflows.definitions.keys().map(String::as_str).collect()
    }

    /// The workflow to use when none is named: the only one declared.
    pub fn sole_workflow(&self) -> Option<&str> {
        let mut names = self.workflows.definitions.keys();
        match (names.next(), names.next()) {
            (Some(name), None) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn job(&self, name: &str) -> Result<&JobDefinition> {
        self.jobs
            .get(name)
            .ok_or_else(|| Error::JobNotFound(name.to_string()))
    }

    // A config without workflows runs its `build` job on its own.
    fn synthesize_default_workflow(&mut self) {
        if self.workflows.definitions.is_empty() && self.jobs.contains_key("build") {
            self.workflows.definitions.insert(
                DEFAULT_WORKFLOW.to_string(),
                WorkflowDefinition {
                    jobs: vec![WorkflowJob::new("build")],
                },
            );
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub machine: Option<MachineExecutor>,
    #[serde(default)]
    pub docker: Vec<DockerImage>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub shell: Option<String>,
    pub steps: Vec<Step>,
}

impl JobDefinition {
    /// A machine job running the given steps on the host.
    pub fn machine(steps: Vec<Step>) -> Self {
        Self {
            machine: Some(MachineExecutor::Enabled(true)),
            steps,
            ..Default::default()
        }
    }

    /// A docker job running the given steps in `image`.
    pub fn docker(image: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            docker: vec![DockerImage {
                image: image.into(),
                environment: BTreeMap::new(),
            }],
            steps,
            ..Default::default()
        }
    }

    /// Resolve which executor runs this job.
    pub fn executor(&self) -> std::result::Result<ExecutorKind, ExecutorProblem> {
        let machine = match &self.machine {
            None | Some(MachineExecutor::Enabled(false)) => None,
            Some(MachineExecutor::Enabled(true)) => Some(ExecutorKind::Machine { image: None }),
            Some(MachineExecutor::Image { image, .. }) => Some(ExecutorKind::Machine {
                image: image.clone(),
            }),
        };

        match (machine, self.docker.first()) {
            (Some(_), Some(_)) => Err(ExecutorProblem::Conflicting),
            (Some(kind), None) => Ok(kind),
            (None, Some(primary)) => Ok(ExecutorKind::Docker {
                image: primary.image.clone(),
                environment: primary.environment.clone(),
            }),
            (None, None) => Err(ExecutorProblem::Missing),
        }
    }

    /// Cache keys this job saves, in step order.
    pub fn saved_cache_keys(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match step {
            Step::SaveCache(save) => Some(save.key.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MachineExecutor {
    Enabled(bool),
    Image {
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        docker_layer_caching: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DockerImage {
    pub image: String,
    #[serde(default, deserialize_with = "string_map")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorKind {
    Machine {
        image: Option<String>,
    },
    Docker {
        image: String,
        environment: BTreeMap<String, String>,
    },
}

impl ExecutorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutorKind::Machine { .. } => "machine",
            ExecutorKind::Docker { .. } => "docker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorProblem {
    Missing,
    Conflicting,
}

impl fmt::Display for ExecutorProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorProblem::Missing => write!(f, "no executor (expected `machine` or `docker`)"),
            ExecutorProblem::Conflicting => write!(f, "both `machine` and `docker` executors"),
        }
    }
}

/// When a step runs relative to earlier failures in its job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    #[default]
    OnSuccess,
    OnFail,
    Always,
}

impl When {
    pub fn should_run(self, job_failed: bool) -> bool {
        match self {
            When::OnSuccess => !job_failed,
            When::OnFail => job_failed,
            When::Always => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Checkout,
    Run,
    SaveCache,
    RestoreCache,
    StoreArtifacts,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Checkout => "checkout",
            StepKind::Run => "run",
            StepKind::SaveCache => "save_cache",
            StepKind::RestoreCache => "restore_cache",
            StepKind::StoreArtifacts => "store_artifacts",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStep")]
pub enum Step {
    Checkout(CheckoutStep),
    Run(RunStep),
    SaveCache(SaveCacheStep),
    RestoreCache(RestoreCacheStep),
    StoreArtifacts(StoreArtifactsStep),
}

impl Step {
    pub fn run(command: impl Into<String>) -> Self {
        Step::Run(RunStep::new(command))
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Checkout(_) => StepKind::Checkout,
            Step::Run(_) => StepKind::Run,
            Step::SaveCache(_) => StepKind::SaveCache,
            Step::RestoreCache(_) => StepKind::RestoreCache,
            Step::StoreArtifacts(_) => StepKind::StoreArtifacts,
        }
    }

    pub fn when(&self) -> When {
        match self {
            Step::Run(run) => run.when,
            Step::SaveCache(save) => save.when,
            Step::Checkout(_) | Step::RestoreCache(_) | Step::StoreArtifacts(_) => When::OnSuccess,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Step::Checkout(_) => "Checkout code".to_string(),
            Step::Run(run) => run.display_name().to_string(),
            Step::SaveCache(save) => save
                .name
                .clone()
                .unwrap_or_else(|| "Saving cache".to_string()),
            Step::RestoreCache(restore) => restore
                .name
                .clone()
                .unwrap_or_else(|| "Restoring cache".to_string()),
            Step::StoreArtifacts(store) => format!("Uploading artifacts: {}", store.path),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CheckoutStep {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RunStep {
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default, deserialize_with = "string_map")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub no_output_timeout: Option<String>,
    #[serde(default)]
    pub when: When,
}

impl RunStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self.command.lines().next().unwrap_or("").trim(),
        }
    }

    /// How long the step may stay silent before it is killed.
    pub fn no_output_timeout(&self) -> std::result::Result<Duration, String> {
        match &self.no_output_timeout {
            Some(spec) => parse_duration(spec),
            None => Ok(DEFAULT_NO_OUTPUT_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaveCacheStep {
    #[serde(default)]
    pub name: Option<String>,
    pub key: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub when: When,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreCacheStep {
    pub name: Option<String>,
    /// Keys in priority order.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreArtifactsStep {
    pub path: String,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStep {
    Bare(String),
    Keyed(BTreeMap<String, serde_yaml::Value>),
}

#[derive(Deserialize)]
struct RawRestoreCache {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        let (name, body) = match raw {
            RawStep::Bare(name) => (name, serde_yaml::Value::Null),
            RawStep::Keyed(map) => {
                let count = map.len();
                let mut entries = map.into_iter();
                match (entries.next(), entries.next()) {
                    (Some(entry), None) => entry,
                    _ => return Err(format!("a step must have exactly one key, found {count}")),
                }
            }
        };

        let step = match name.as_str() {
            "checkout" if body.is_null() => Step::Checkout(CheckoutStep::default()),
            "checkout" => Step::Checkout(step_body(&name, body)?),
            "run" => match body {
                serde_yaml::Value::String(command) => Step::Run(RunStep::new(command)),
                other => Step::Run(step_body(&name, other)?),
            },
            "save_cache" => Step::SaveCache(step_body(&name, body)?),
            "restore_cache" => {
                let raw: RawRestoreCache = step_body(&name, body)?;
                let mut keys = raw.keys;
                if let Some(key) = raw.key {
                    keys.insert(0, key);
                }
                if keys.is_empty() {
                    return Err("restore_cache requires `key` or `keys`".to_string());
                }
                Step::RestoreCache(RestoreCacheStep {
                    name: raw.name,
                    keys,
                })
            }
            "store_artifacts" => Step::StoreArtifacts(step_body(&name, body)?),
            other => return Err(format!("unknown step `{other}`")),
        };

        Ok(step)
    }
}

fn step_body<T: serde::de::DeserializeOwned>(
    name: &str,
    body: serde_yaml::Value,
) -> std::result::Result<T, String> {
    serde_yaml::from_value(body).map_err(|e| format!("invalid `{name}` step: {e}"))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Workflows {
    #[serde(default)]
    pub version: Option<serde_yaml::Value>,
    #[serde(flatten)]
    pub definitions: BTreeMap<String, WorkflowDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorkflowDefinition {
    pub jobs: Vec<WorkflowJob>,
}

/// A job's place in a workflow: its requirements and filters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawWorkflowJob")]
pub struct WorkflowJob {
    pub name: String,
    pub requires: Vec<String>,
    pub filters: Option<Filters>,
}

impl WorkflowJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: vec![],
            filters: None,
        }
    }

    pub fn requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = Some(filters);
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWorkflowJob {
    Bare(String),
    Keyed(BTreeMap<String, Option<WorkflowJobOptions>>),
}

#[derive(Default, Deserialize)]
struct WorkflowJobOptions {
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    filters: Option<Filters>,
}

impl TryFrom<RawWorkflowJob> for WorkflowJob {
    type Error = String;

    fn try_from(raw: RawWorkflowJob) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawWorkflowJob::Bare(name) => Ok(WorkflowJob::new(name)),
            RawWorkflowJob::Keyed(map) => {
                let count = map.len();
                let mut entries = map.into_iter();
                match (entries.next(), entries.next()) {
                    (Some((name, options)), None) => {
                        let options = options.unwrap_or_default();
                        Ok(WorkflowJob {
                            name,
                            requires: options.requires,
                            filters: options.filters,
                        })
                    }
                    _ => Err(format!(
                        "a workflow job must have exactly one key, found {count}"
                    )),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub branches: Option<FilterRule>,
    #[serde(default)]
    pub tags: Option<FilterRule>,
}

impl Filters {
    pub fn branches(mut self, rule: FilterRule) -> Self {
        self.branches = Some(rule);
        self
    }

    pub fn tags(mut self, rule: FilterRule) -> Self {
        self.tags = Some(rule);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FilterRule {
    #[serde(default, deserialize_with = "one_or_many")]
    pub only: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub ignore: Vec<String>,
}

impl FilterRule {
    pub fn only<I: IntoIterator<Item = S>, S: Into<String>>(patterns: I) -> Self {
        Self {
            only: patterns.into_iter().map(Into::into).collect(),
            ignore: vec![],
        }
    }

    pub fn ignore<I: IntoIterator<Item = S>, S: Into<String>>(patterns: I) -> Self {
        Self {
            only: vec![],
            ignore: patterns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Parse durations such as `90s`, `10m`, `1h30m` or a bare number of seconds.
pub fn parse_duration(spec: &str) -> std::result::Result<Duration, String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = spec.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in spec.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return Err(format!("invalid duration `{spec}`")),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration `{spec}`"))?;
        total += value * unit;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("invalid duration `{spec}`: missing unit"));
    }
    Ok(Duration::from_secs(total))
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            scalar_to_string(value)
                .map(|v| (key.clone(), v))
                .ok_or_else(|| serde::de::Error::custom(format!("`{key}` must be a scalar")))
        })
        .collect()
}

fn optional_scalar<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<serde_yaml::Value>::deserialize(deserializer)?.and_then(scalar_to_string))
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => vec![],
        Some(OneOrMany::One(pattern)) => vec![pattern],
        Some(OneOrMany::Many(patterns)) => patterns,
    })
}
