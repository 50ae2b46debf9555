//! Span creation for workflow operations.

use tracing::{Level, Span, span};

/// Attributes attached to workflow, job and step spans.
#[derive(Debug, Default)]
pub struct CiAttributes {
    pub run_id: Option<String>,
    pub workflow: Option<String>,
    pub job: Option<String>,
    pub step_name: Option<String>,
    pub step_kind: Option<String>,
    pub executor: Option<String>,
    pub git_ref: Option<String>,
    pub git_sha: Option<String>,
}

impl CiAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(mut self, id: impl Into<String>, workflow: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self.workflow = Some(workflow.into());
        self
    }

    pub fn job(mut self, name: impl Into<String>) -> Self {
        self.job = Some(name.into());
        self
    }

    pub fn step(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.step_name = Some(name.into());
        self.step_kind = Some(kind.into());
        self
    }

    pub fn executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    pub fn vcs(mut self, git_ref: impl Into<String>, sha: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self.git_sha = Some(sha.into());
        self
    }
}

/// Create a span covering a whole workflow run.
pub fn workflow_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "workflow.run",
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.workflow.name = attrs.workflow.as_deref().unwrap_or(""),
        vcs.ref = attrs.git_ref.as_deref().unwrap_or(""),
        vcs.sha = attrs.git_sha.as_deref().unwrap_or(""),
    )
}

/// Create a span for a job.
pub fn job_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "job.execute",
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.workflow.name = attrs.workflow.as_deref().unwrap_or(""),
        ci.job.name = attrs.job.as_deref().unwrap_or(""),
        ci.job.executor = attrs.executor.as_deref().unwrap_or(""),
    )
}

/// Create a span for a step.
pub fn step_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "step.execute",
        ci.run.id = attrs.run_id.as_deref().unwrap_or(""),
        ci.job.name = attrs.job.as_deref().unwrap_or(""),
        ci.step.name = attrs.step_name.as_deref().unwrap_or(""),
        ci.step.kind = attrs.step_kind.as_deref().unwrap_or(""),
    )
}

/// Create a span for cache operations.
pub fn cache_span(operation: &str, key: &str) -> Span {
    span!(
        Level::DEBUG,
        "cache.operation",
        operation = operation,
        cache.key = key,
    )
}
