//! Lifecycle events emitted while a workflow runs.

use crate::config::StepKind;
use crate::ids::RunId;
use crate::run::{JobStatus, SkipReason, StepStatus, WorkflowStatus};
use crate::trigger::GitRef;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Workflow lifecycle
    WorkflowStarted(WorkflowStartedPayload),
    WorkflowCompleted(WorkflowCompletedPayload),

    // Job lifecycle
    JobQueued(JobQueuedPayload),
    JobStarted(JobStartedPayload),
    JobCompleted(JobCompletedPayload),
    JobSkipped(JobSkippedPayload),

    // Step lifecycle
    StepStarted(StepStartedPayload),
    StepOutput(StepOutputPayload),
    StepCompleted(StepCompletedPayload),

    // Cache
    CacheRestored(CacheRestoredPayload),
    CacheSaved(CacheSavedPayload),
}

impl Event {
    /// Dotted topic naming the event and its subject, e.g. `job.started.build`.
    pub fn topic(&self) -> String {
        match self {
            Event::WorkflowStarted(p) => format!("workflow.started.{}", p.workflow),
            Event::WorkflowCompleted(p) => format!("workflow.completed.{}", p.workflow),
            Event::JobQueued(p) => format!("job.queued.{}", p.job),
            Event::JobStarted(p) => format!("job.started.{}", p.job),
            Event::JobCompleted(p) => format!("job.completed.{}", p.job),
            Event::JobSkipped(p) => format!("job.skipped.{}", p.job),
            Event::StepStarted(p) => format!("job.{}.step.{}.started", p.job, p.step_index),
            Event::StepOutput(p) => format!("job.{}.step.{}.output", p.job, p.step_index),
            Event::StepCompleted(p) => format!("job.{}.step.{}.completed", p.job, p.step_index),
            Event::CacheRestored(p) => format!("cache.restored.{}", p.job),
            Event::CacheSaved(p) => format!("cache.saved.{}", p.job),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::WorkflowStarted(p) => p.run_id,
            Event::WorkflowCompleted(p) => p.run_id,
            Event::JobQueued(p) => p.run_id,
            Event::JobStarted(p) => p.run_id,
            Event::JobCompleted(p) => p.run_id,
            Event::JobSkipped(p) => p.run_id,
            Event::StepStarted(p) => p.run_id,
            Event::StepOutput(p) => p.run_id,
            Event::StepCompleted(p) => p.run_id,
            Event::CacheRestored(p) => p.run_id,
            Event::CacheSaved(p) => p.run_id,
        }
    }
}

// === Workflow Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowStartedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub git_ref: GitRef,
    pub revision: String,
    pub jobs: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowCompletedPayload {
    pub run_id: RunId,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub duration_ms: u64,
    pub jobs_succeeded: u32,
    pub jobs_failed: u32,
    pub jobs_skipped: u32,
    pub completed_at: DateTime<Utc>,
}

// === Job Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobQueuedPayload {
    pub run_id: RunId,
    pub job: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStartedPayload {
    pub run_id: RunId,
    pub job: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletedPayload {
    pub run_id: RunId,
    pub job: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSkippedPayload {
    pub run_id: RunId,
    pub job: String,
    pub reason: SkipReason,
}

// === Step Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepStartedPayload {
    pub run_id: RunId,
    pub job: String,
    pub step_index: u32,
    pub step_name: String,
    pub kind: StepKind,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepOutputPayload {
    pub run_id: RunId,
    pub job: String,
    pub step_index: u32,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub job: String,
    pub step_index: u32,
    pub step_name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

// === Cache Payloads ===

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheRestoredPayload {
    pub run_id: RunId,
    pub job: String,
    pub keys: Vec<String>,
    /// The key that hit, or `None` on a miss.
    pub matched_key: Option<String>,
    pub exact_match: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheSavedPayload {
    pub run_id: RunId,
    pub job: String,
    pub key: String,
    pub size_bytes: u64,
    pub missing_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topic_and_tag() {
        let event = Event::JobSkipped(JobSkippedPayload {
            run_id: RunId::new(),
            job: "hub".into(),
            reason: SkipReason::UpstreamFailed {
                job: "test-back".into(),
            },
        });
        assert_eq!(event.topic(), "job.skipped.hub");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_skipped");
        assert_eq!(json["reason"]["reason"], "upstream_failed");
    }
}
