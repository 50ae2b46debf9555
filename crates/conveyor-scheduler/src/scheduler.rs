//! Workflow scheduler: dispatches planned jobs as their requirements succeed.

use crate::plan::{ExecutionPlan, PlannedJob};
use crate::queue::ReadyQueue;
use chrono::Utc;
use conveyor_core::events::{
    Event, JobCompletedPayload, JobQueuedPayload, JobSkippedPayload, JobStartedPayload,
    WorkflowCompletedPayload, WorkflowStartedPayload,
};
use conveyor_core::ports::{JobExecutor, JobOutcome, RunContext};
use conveyor_core::run::{JobRun, JobStatus, SkipReason, WorkflowRun};
use conveyor_core::spans::{CiAttributes, job_span, workflow_span};
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{Instrument, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once.
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_parallel: 4 }
    }
}

pub struct Scheduler {
    executor: Arc<dyn JobExecutor>,
    config: SchedulerConfig,
}

type JobResult = std::thread::Result<conveyor_core::Result<JobOutcome>>;

impl Scheduler {
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            executor,
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.config.max_parallel = max_parallel;
        self
    }

    /// Execute every runnable job of `plan` and return the finished run.
    pub async fn run(&self, plan: &ExecutionPlan, ctx: &RunContext) -> WorkflowRun {
        let attrs = CiAttributes::new()
            .run(ctx.run_id.to_string(), &ctx.workflow)
            .vcs(ctx.trigger.git_ref.to_string(), &ctx.trigger.revision);
        self.drive(plan, ctx).instrument(workflow_span(&attrs)).await
    }

    async fn drive(&self, plan: &ExecutionPlan, ctx: &RunContext) -> WorkflowRun {
        let mut run = WorkflowRun::new(ctx.run_id, &plan.workflow, plan.trigger.clone());
        run.filtered_out = plan.filtered_out.clone();
        run.jobs = plan.jobs.iter().map(|job| JobRun::pending(&job.name)).collect();
        let positions: HashMap<&str, usize> = plan
            .jobs
            .iter()
            .enumerate()
            .map(|(pos, job)| (job.name.as_str(), pos))
            .collect();

        info!(
            workflow = %plan.workflow,
            git_ref = %plan.trigger.git_ref,
            jobs = plan.jobs.len(),
            filtered_out = plan.filtered_out.len(),
            "Starting workflow"
        );
        ctx.emit(Event::WorkflowStarted(WorkflowStartedPayload {
            run_id: ctx.run_id,
            workflow: plan.workflow.clone(),
            git_ref: plan.trigger.git_ref.clone(),
            revision: plan.trigger.revision.clone(),
            jobs: plan.jobs.iter().map(|job| job.name.clone()).collect(),
            started_at: run.started_at,
        }))
        .await;

        for job in plan.unsatisfiable() {
            let missing = job.missing_requirements.first().cloned().unwrap_or_default();
            let reason = SkipReason::RequirementNotInPlan { job: missing };
            warn!(job = %job.name, reason = %reason, "Job cannot run");
            skip(&mut run.jobs[positions[job.name.as_str()]], reason, ctx).await;
        }

        let mut queue = ReadyQueue::new(self.config.max_parallel);
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<JobResult> = JoinSet::new();
        let mut tasks: HashMap<Id, usize> = HashMap::new();

        for job in plan.runnable().filter(|job| job.requires.is_empty()) {
            enqueue(&mut queue, job, ctx).await;
        }

        loop {
            while let Some(next) = queue.next() {
                let pos = positions[next.name.as_str()];
                let planned = &plan.jobs[pos];
                run.jobs[pos].start();
                info!(job = %planned.name, "Job started");
                ctx.emit(Event::JobStarted(JobStartedPayload {
                    run_id: ctx.run_id,
                    job: planned.name.clone(),
                    started_at: Utc::now(),
                }))
                .await;
                let id = self.spawn(&mut join_set, planned, ctx);
                tasks.insert(id, pos);
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };
            let Some((pos, outcome)) = settle(joined, &mut tasks) else {
                continue;
            };

            let planned = &plan.jobs[pos];
            queue.complete(&planned.name);
            let passed = outcome.status == JobStatus::Succeeded;
            record(&mut run.jobs[pos], outcome, ctx).await;

            if passed {
                succeeded.insert(planned.name.clone());
                for dependent in plan.runnable() {
                    if run.jobs[positions[dependent.name.as_str()]].status == JobStatus::Pending
                        && dependent.requires.contains(&planned.name)
                        && dependent.requires.iter().all(|r| succeeded.contains(r))
                    {
                        enqueue(&mut queue, dependent, ctx).await;
                    }
                }
            } else {
                for dependent in plan.dependents_of(&planned.name) {
                    let job = &mut run.jobs[positions[dependent.name.as_str()]];
                    if job.status == JobStatus::Pending {
                        let reason = SkipReason::UpstreamFailed {
                            job: planned.name.clone(),
                        };
                        skip(job, reason, ctx).await;
                    }
                }
            }
        }

        for job in run.jobs.iter_mut().filter(|job| !job.status.is_terminal()) {
            warn!(job = %job.name, status = %job.status, "Job never finished");
            job.message = Some("job did not finish".to_string());
            job.complete(JobStatus::Failed);
        }

        run.finish();
        info!(
            workflow = %run.workflow,
            status = %run.status,
            duration_ms = run.duration_ms.unwrap_or(0),
            "Workflow completed"
        );
        ctx.emit(Event::WorkflowCompleted(WorkflowCompletedPayload {
            run_id: ctx.run_id,
            workflow: run.workflow.clone(),
            status: run.status,
            duration_ms: run.duration_ms.unwrap_or(0),
            jobs_succeeded: count(&run, JobStatus::Succeeded),
            jobs_failed: count(&run, JobStatus::Failed),
            jobs_skipped: count(&run, JobStatus::Skipped),
            completed_at: run.finished_at.unwrap_or_else(Utc::now),
        }))
        .await;

        run
    }

    fn spawn(
        &self,
        join_set: &mut JoinSet<JobResult>,
        planned: &PlannedJob,
        ctx: &RunContext,
    ) -> Id {
        let executor = Arc::clone(&self.executor);
        let spec = planned.spec.clone();
        let ctx = ctx.clone();
        let executor_label = spec
            .definition
            .executor()
            .map(|kind| kind.label())
            .unwrap_or("none");
        let span = job_span(
            &CiAttributes::new()
                .run(ctx.run_id.to_string(), &ctx.workflow)
                .job(&spec.name)
                .executor(executor_label),
        );

        join_set
            .spawn(
                async move {
                    AssertUnwindSafe(executor.execute(&spec, &ctx))
                        .catch_unwind()
                        .await
                }
                .instrument(span),
            )
            .id()
    }
}

async fn enqueue(queue: &mut ReadyQueue, job: &PlannedJob, ctx: &RunContext) {
    queue.push(&job.name, job.order);
    ctx.emit(Event::JobQueued(JobQueuedPayload {
        run_id: ctx.run_id,
        job: job.name.clone(),
        queued_at: Utc::now(),
    }))
    .await;
}

async fn skip(job: &mut JobRun, reason: SkipReason, ctx: &RunContext) {
    info!(job = %job.name, reason = %reason, "Job skipped");
    *job = JobRun::skipped(&job.name, reason.clone());
    ctx.emit(Event::JobSkipped(JobSkippedPayload {
        run_id: ctx.run_id,
        job: job.name.clone(),
        reason,
    }))
    .await;
}

async fn record(job: &mut JobRun, outcome: JobOutcome, ctx: &RunContext) {
    let status = match outcome.status {
        JobStatus::Succeeded => JobStatus::Succeeded,
        _ => JobStatus::Failed,
    };
    job.exit_code = outcome.exit_code;
    job.message = outcome.message;
    job.steps = outcome.steps;
    job.artifacts = outcome.artifacts;
    job.complete(status);

    if status == JobStatus::Succeeded {
        info!(job = %job.name, duration_ms = job.duration_ms.unwrap_or(0), "Job succeeded");
    } else {
        warn!(
            job = %job.name,
            exit_code = ?job.exit_code,
            message = job.message.as_deref().unwrap_or(""),
            "Job failed"
        );
    }

    ctx.emit(Event::JobCompleted(JobCompletedPayload {
        run_id: ctx.run_id,
        job: job.name.clone(),
        status,
        exit_code: job.exit_code,
        message: job.message.clone(),
        duration_ms: job.duration_ms.unwrap_or(0),
        completed_at: job.finished_at.unwrap_or_else(Utc::now),
    }))
    .await;
}

/// Map a finished task back to its job. A task that failed to join still
/// yields a failed outcome so its queue slot is released.
fn settle(
    joined: Result<(Id, JobResult), JoinError>,
    tasks: &mut HashMap<Id, usize>,
) -> Option<(usize, JobOutcome)> {
    let (id, outcome) = match joined {
        Ok((id, Ok(Ok(outcome)))) => (id, outcome),
        Ok((id, Ok(Err(e)))) => (id, JobOutcome::failed(None, e.to_string())),
        Ok((id, Err(panic))) => (id, JobOutcome::failed(None, panic_message(panic.as_ref()))),
        Err(e) => {
            error!(error = %e, "Job task failed to join");
            let message = if e.is_cancelled() {
                "job task was cancelled".to_string()
            } else {
                format!("job task failed: {e}")
            };
            (e.id(), JobOutcome::failed(None, message))
        }
    };
    match tasks.remove(&id) {
        Some(pos) => Some((pos, outcome)),
        None => {
            error!(task = %id, "Finished task belongs to no job");
            None
        }
    }
}

fn count(run: &WorkflowRun, status: JobStatus) -> u32 {
    u32::try_from(run.count(status)).unwrap_or(u32::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("job panicked: {detail}")
}
