//! Run and execution result types.

use crate::config::StepKind;
use crate::ids::{ArtifactId, RunId};
use crate::trigger::TriggerEvent;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The result of running one workflow for one trigger event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow: String,
    pub trigger: TriggerEvent,
    pub status: WorkflowStatus,
    /// One entry per planned job, in declaration order.
    pub jobs: Vec<JobRun>,
    /// Jobs whose filters excluded them from this run.
    #[serde(default)]
    pub filtered_out: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl WorkflowRun {
    pub fn new(id: RunId, workflow: impl Into<String>, trigger: TriggerEvent) -> Self {
        Self {
            id,
            workflow: workflow.into(),
            trigger,
            status: WorkflowStatus::Running,
            jobs: vec![],
            filtered_out: vec![],
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobRun> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }

    /// Record completion and derive the final status from the job results.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.status = WorkflowStatus::evaluate(&self.jobs);
        self.duration_ms = Some(elapsed_ms(self.started_at, now));
        self.finished_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
}

impl WorkflowStatus {
    /// A workflow succeeds iff every job finished, every job that ran
    /// succeeded, and no job was dropped for a requirement missing from the
    /// plan. No jobs at all is a success.
    pub fn evaluate(jobs: &[JobRun]) -> Self {
        let succeeded = jobs.iter().all(|job| match job.status {
            JobStatus::Succeeded => true,
            JobStatus::Skipped => !matches!(
                job.skip_reason,
                Some(SkipReason::RequirementNotInPlan { .. })
            ),
            JobStatus::Pending | JobStatus::Running | JobStatus::Failed => false,
        });

        if succeeded {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Succeeded => write!(f, "succeeded"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a job was skipped without executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A job it (transitively) requires failed.
    UpstreamFailed { job: String },
    /// It requires a job the trigger's filters excluded.
    RequirementNotInPlan { job: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamFailed { job } => write!(f, "upstream job `{job}` failed"),
            SkipReason::RequirementNotInPlan { job } => {
                write!(f, "required job `{job}` is not part of this run")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRun {
    pub name: String,
    pub status: JobStatus,
    pub skip_reason: Option<SkipReason>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl JobRun {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: JobStatus::Pending,
            skip_reason: None,
            exit_code: None,
            message: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            steps: vec![],
            artifacts: vec![],
        }
    }

    pub fn skipped(name: impl Into<String>, reason: SkipReason) -> Self {
        let mut run = Self::pending(name);
        run.message = Some(reason.to_string());
        run.status = JobStatus::Skipped;
        run.skip_reason = Some(reason);
        run
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, status: JobStatus) {
        let now = Utc::now();
        self.status = status;
        self.duration_ms = self.started_at.map(|started| elapsed_ms(started, now));
        self.finished_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    /// A filesystem path for stored artifacts, `cache:<key>` for cache blobs.
    pub location: String,
    pub size_bytes: u64,
}

impl ArtifactRef {
    pub fn new(kind: ArtifactKind, location: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: ArtifactId::new(),
            kind,
            location: location.into(),
            size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactKind {
    CacheSaved { key: String },
    CacheRestored { key: String, exact: bool },
    Stored { path: String, destination: String },
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}
