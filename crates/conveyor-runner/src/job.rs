//! Executes one job's steps inside its sandbox.

use crate::artifacts::{default_destination, job_artifacts_dir, store_artifact};
use crate::checkout::checkout;
use crate::container::ContainerRunner;
use crate::runner::{OutputLine, StepContext, StepRunner};
use crate::sandbox::Sandbox;
use crate::shell::ShellRunner;
use async_trait::async_trait;
use chrono::Utc;
use conveyor_cache::{
    CacheRestoreRequest, CacheSaveRequest, CacheStore, KeyContext, PathRoots, render_key,
};
use conveyor_core::config::{
    CheckoutStep, ExecutorKind, RestoreCacheStep, RunStep, SaveCacheStep, Step, StoreArtifactsStep,
};
use conveyor_core::events::{
    CacheRestoredPayload, CacheSavedPayload, Event, StepCompletedPayload, StepOutputPayload,
    StepStartedPayload,
};
use conveyor_core::ports::{JobExecutor, JobOutcome, JobSpec, RunContext};
use conveyor_core::run::{ArtifactKind, ArtifactRef, JobStatus, StepRecord, StepStatus};
use conveyor_core::spans::{CiAttributes, step_span};
use conveyor_core::trigger::GitRef;
use conveyor_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, warn};

/// Directories a runner works in.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    /// Parent of every job sandbox.
    pub workspace_root: PathBuf,
    /// Parent of every run's stored artifacts.
    pub artifacts_root: PathBuf,
    /// Tree copied by `checkout` steps.
    pub source_dir: Option<PathBuf>,
    /// Leave sandboxes on disk after their job finishes.
    pub keep_workspaces: bool,
}

impl RunnerPaths {
    pub fn new(workspace_root: impl Into<PathBuf>, artifacts_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            artifacts_root: artifacts_root.into(),
            source_dir: None,
            keep_workspaces: false,
        }
    }

    pub fn with_source(mut self, source_dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(source_dir.into());
        self
    }

    pub fn keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }
}

/// Runs jobs locally: machine jobs on the host shell, docker jobs in
/// containers.
pub struct JobRunner {
    cache: Arc<dyn CacheStore>,
    paths: RunnerPaths,
}

struct StepOutcome {
    status: StepStatus,
    exit_code: Option<i32>,
    message: Option<String>,
    artifacts: Vec<ArtifactRef>,
}

impl StepOutcome {
    fn succeeded() -> Self {
        Self {
            status: StepStatus::Succeeded,
            exit_code: None,
            message: None,
            artifacts: vec![],
        }
    }

    fn failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            exit_code,
            message: Some(message.into()),
            artifacts: vec![],
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// State shared by the steps of one job.
struct JobScope<'a> {
    job: &'a JobSpec,
    ctx: &'a RunContext,
    sandbox: Sandbox,
    runner: Box<dyn StepRunner>,
    environment: BTreeMap<String, String>,
}

impl JobRunner {
    pub fn new(cache: Arc<dyn CacheStore>, paths: RunnerPaths) -> Self {
        Self { cache, paths }
    }

    pub fn paths(&self) -> &RunnerPaths {
        &self.paths
    }

    fn step_runner(&self, executor: &ExecutorKind, sandbox_root: &Path) -> Result<Box<dyn StepRunner>> {
        match executor {
            ExecutorKind::Machine { image } => {
                if let Some(image) = image {
                    debug!(image = %image, "Machine image ignored, running on the host");
                }
                Ok(Box::new(ShellRunner::default()))
            }
            ExecutorKind::Docker { image, environment } => Ok(Box::new(
                ContainerRunner::connect(image)?
                    .with_environment(environment.clone())
                    .with_mount(sandbox_root),
            )),
        }
    }

    async fn run_steps(&self, scope: &JobScope<'_>) -> JobOutcome {
        let mut records = Vec::with_capacity(scope.job.definition.steps.len());
        let mut artifacts = vec![];
        let mut failure: Option<(Option<i32>, String)> = None;

        for (index, step) in scope.job.definition.steps.iter().enumerate() {
            let name = step.display_name();
            let kind = step.kind();
            let step_index = u32::try_from(index).unwrap_or(u32::MAX);

            if !step.when().should_run(failure.is_some()) {
                debug!(job = %scope.job.name, step = %name, "Step skipped");
                records.push(StepRecord {
                    name,
                    kind,
                    status: StepStatus::Skipped,
                    exit_code: None,
                    duration_ms: 0,
                    message: None,
                });
                continue;
            }

            scope
                .ctx
                .emit(Event::StepStarted(StepStartedPayload {
                    run_id: scope.ctx.run_id,
                    job: scope.job.name.clone(),
                    step_index,
                    step_name: name.clone(),
                    kind,
                    started_at: Utc::now(),
                }))
                .await;

            let span = step_span(
                &CiAttributes::new()
                    .run(scope.ctx.run_id.to_string(), &scope.ctx.workflow)
                    .job(&scope.job.name)
                    .step(&name, kind.as_str()),
            );
            let start = Instant::now();
            let outcome = self.run_step(scope, step, step_index).instrument(span).await;
            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            if outcome.status == StepStatus::Failed {
                warn!(
                    job = %scope.job.name,
                    step = %name,
                    exit_code = ?outcome.exit_code,
                    message = outcome.message.as_deref().unwrap_or(""),
                    "Step failed"
                );
                if failure.is_none() {
                    let message = outcome.message.as_deref().unwrap_or("failed");
                    failure = Some((outcome.exit_code, format!("step `{name}`: {message}")));
                }
            }

            scope
                .ctx
                .emit(Event::StepCompleted(StepCompletedPayload {
                    run_id: scope.ctx.run_id,
                    job: scope.job.name.clone(),
                    step_index,
                    step_name: name.clone(),
                    status: outcome.status,
                    exit_code: outcome.exit_code,
                    duration_ms,
                }))
                .await;

            artifacts.extend(outcome.artifacts);
            records.push(StepRecord {
                name,
                kind,
                status: outcome.status,
                exit_code: outcome.exit_code,
                duration_ms,
                message: outcome.message,
            });
        }

        let mut result = match failure {
            Some((exit_code, message)) => JobOutcome::failed(exit_code, message),
            None => JobOutcome::succeeded(),
        };
        result.steps = records;
        result.artifacts = artifacts;
        result
    }

    async fn run_step(&self, scope: &JobScope<'_>, step: &Step, step_index: u32) -> StepOutcome {
        let result = match step {
            Step::Checkout(checkout) => self.checkout(scope, checkout).await,
            Step::Run(run) => self.run_command(scope, run, step_index).await,
            Step::SaveCache(save) => self.save_cache(scope, save).await,
            Step::RestoreCache(restore) => self.restore_cache(scope, restore).await,
            Step::StoreArtifacts(store) => self.store_artifacts(scope, store).await,
        };
        result.unwrap_or_else(|e| StepOutcome::failed(None, e.to_string()))
    }

    async fn checkout(&self, scope: &JobScope<'_>, step: &CheckoutStep) -> Result<StepOutcome> {
        let source = self
            .paths
            .source_dir
            .clone()
            .ok_or_else(|| Error::Sandbox("no source directory to check out".to_string()))?;
        let dest = match &step.path {
            Some(path) => scope.sandbox.expand(path),
            None => scope.sandbox.working_dir().to_path_buf(),
        };
        let skip = self.paths.workspace_root.clone();

        let bytes = tokio::task::spawn_blocking(move || checkout(&source, &dest, Some(&skip)))
            .await
            .map_err(|e| Error::Internal(format!("checkout task failed: {}", e)))??;
        Ok(StepOutcome::succeeded().with_message(format!("copied {bytes} bytes")))
    }

    async fn run_command(
        &self,
        scope: &JobScope<'_>,
        step: &RunStep,
        step_index: u32,
    ) -> Result<StepOutcome> {
        let no_output_timeout = step
            .no_output_timeout()
            .map_err(|e| Error::InvalidConfig(format!("no_output_timeout: {e}")))?;

        let mut environment = scope.environment.clone();
        environment.extend(step.environment.clone());
        let working_dir = match &step.working_directory {
            Some(dir) => scope.sandbox.expand(dir),
            None => scope.sandbox.working_dir().to_path_buf(),
        };
        let step_ctx = StepContext {
            command: step.command.clone(),
            shell: step.shell.clone().or_else(|| scope.job.definition.shell.clone()),
            working_dir,
            environment,
            no_output_timeout,
        };

        let (output_tx, mut output_rx) = mpsc::channel::<OutputLine>(256);
        let events = scope.ctx.clone();
        let job = scope.job.name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = output_rx.recv().await {
                debug!(job = %job, line = %line.content, "Step output");
                events
                    .emit(Event::StepOutput(StepOutputPayload {
                        run_id: events.run_id,
                        job: job.clone(),
                        step_index,
                        stream: line.stream,
                        line: line.content,
                    }))
                    .await;
            }
        });

        let result = scope.runner.execute(&step_ctx, output_tx).await;
        if let Err(e) = forwarder.await {
            warn!(error = %e, "Output forwarder failed");
        }

        match result {
            Ok(done) if done.success => Ok(StepOutcome {
                exit_code: Some(done.exit_code),
                ..StepOutcome::succeeded()
            }),
            Ok(done) => Ok(StepOutcome::failed(
                Some(done.exit_code),
                format!("exited with code {}", done.exit_code),
            )),
            Err(e @ Error::StepTimeout { .. }) => Ok(StepOutcome::failed(None, e.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn save_cache(&self, scope: &JobScope<'_>, step: &SaveCacheStep) -> Result<StepOutcome> {
        let roots = scope.sandbox.roots();
        let key = render_key(&step.key, &key_context(scope, &roots))?;
        let request = CacheSaveRequest::new(&key, step.paths.clone(), roots.clone());
        let saved = self.cache.save(&request).await?;

        for missing in &saved.missing_paths {
            warn!(job = %scope.job.name, key = %key, path = %missing, "Cache path does not exist");
        }

        let Some(entry) = saved.entry else {
            return Ok(StepOutcome::succeeded()
                .with_message(format!("no paths to cache under `{key}`")));
        };

        info!(job = %scope.job.name, key = %key, size_bytes = entry.size_bytes, "Cache saved");
        scope
            .ctx
            .emit(Event::CacheSaved(CacheSavedPayload {
                run_id: scope.ctx.run_id,
                job: scope.job.name.clone(),
                key: key.clone(),
                size_bytes: entry.size_bytes,
                missing_paths: saved.missing_paths,
            }))
            .await;

        Ok(StepOutcome::succeeded().with_artifact(ArtifactRef::new(
            ArtifactKind::CacheSaved { key: key.clone() },
            format!("cache:{key}"),
            entry.size_bytes,
        )))
    }

    async fn restore_cache(
        &self,
        scope: &JobScope<'_>,
        step: &RestoreCacheStep,
    ) -> Result<StepOutcome> {
        let roots = scope.sandbox.roots();
        let key_ctx = key_context(scope, &roots);
        let keys = step
            .keys
            .iter()
            .map(|template| render_key(template, &key_ctx))
            .collect::<Result<Vec<_>>>()?;

        let request = CacheRestoreRequest::new(keys.clone(), roots.clone());
        let restored = self.cache.restore(&request).await?;
        let size_bytes = restored.entry.as_ref().map(|e| e.size_bytes).unwrap_or(0);

        scope
            .ctx
            .emit(Event::CacheRestored(CacheRestoredPayload {
                run_id: scope.ctx.run_id,
                job: scope.job.name.clone(),
                keys: keys.clone(),
                matched_key: restored.matched_key.clone(),
                exact_match: restored.exact_match,
                size_bytes,
            }))
            .await;

        match (restored.matched_key, restored.entry) {
            (Some(matched), Some(entry)) => {
                info!(job = %scope.job.name, key = %entry.key, exact = restored.exact_match, "Cache restored");
                Ok(StepOutcome::succeeded()
                    .with_message(format!("restored `{}`", entry.key))
                    .with_artifact(ArtifactRef::new(
                        ArtifactKind::CacheRestored {
                            key: matched,
                            exact: restored.exact_match,
                        },
                        format!("cache:{}", entry.key),
                        size_bytes,
                    )))
            }
            _ => {
                info!(job = %scope.job.name, keys = ?keys, "No cache found");
                Ok(StepOutcome::succeeded().with_message("no cache found"))
            }
        }
    }

    async fn store_artifacts(
        &self,
        scope: &JobScope<'_>,
        step: &StoreArtifactsStep,
    ) -> Result<StepOutcome> {
        let source = scope.sandbox.expand(&step.path);
        let destination = step
            .destination
            .clone()
            .unwrap_or_else(|| default_destination(&step.path));
        let dir = job_artifacts_dir(&self.paths.artifacts_root, &scope.ctx.run_id, &scope.job.name);

        let dest = destination.clone();
        let stored = tokio::task::spawn_blocking(move || store_artifact(&source, &dir, &dest))
            .await
            .map_err(|e| Error::Internal(format!("artifact task failed: {}", e)))??;

        let Some((location, size_bytes)) = stored else {
            warn!(job = %scope.job.name, path = %step.path, "No artifacts found");
            return Ok(StepOutcome::succeeded().with_message(format!("nothing found at `{}`", step.path)));
        };

        Ok(StepOutcome::succeeded().with_artifact(ArtifactRef::new(
            ArtifactKind::Stored {
                path: step.path.clone(),
                destination,
            },
            location.display().to_string(),
            size_bytes,
        )))
    }
}

fn key_context<'a>(scope: &'a JobScope<'_>, roots: &'a PathRoots) -> KeyContext<'a> {
    KeyContext {
        trigger: &scope.ctx.trigger,
        environment: &scope.environment,
        roots,
    }
}

/// Variables every step of a job sees, lowest precedence first.
fn job_environment(job: &JobSpec, ctx: &RunContext, sandbox: &Sandbox) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CI".to_string(), "true".to_string());
    env.insert("CIRCLECI".to_string(), "true".to_string());
    env.insert("CIRCLE_SHA1".to_string(), ctx.trigger.revision.clone());
    match &ctx.trigger.git_ref {
        GitRef::Branch(branch) => env.insert("CIRCLE_BRANCH".to_string(), branch.clone()),
        GitRef::Tag(tag) => env.insert("CIRCLE_TAG".to_string(), tag.clone()),
    };
    env.insert("CIRCLE_JOB".to_string(), job.name.clone());
    env.insert("CIRCLE_WORKFLOW_ID".to_string(), ctx.run_id.to_string());
    env.insert(
        "CIRCLE_WORKING_DIRECTORY".to_string(),
        sandbox.working_dir().display().to_string(),
    );
    env.insert("HOME".to_string(), sandbox.home().display().to_string());

    env.extend(ctx.trigger.environment.clone());
    env.extend(job.definition.environment.clone());
    env
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn execute(&self, job: &JobSpec, ctx: &RunContext) -> Result<JobOutcome> {
        let executor = job
            .definition
            .executor()
            .map_err(|problem| Error::InvalidConfig(format!("job `{}` has {}", job.name, problem)))?;

        // Nothing is created on disk until the step runner is available.
        let root = Sandbox::root_for(&self.paths.workspace_root, &ctx.run_id, &job.name);
        let runner = self.step_runner(&executor, &root)?;
        let sandbox = Sandbox::create(
            &self.paths.workspace_root,
            &ctx.run_id,
            &job.name,
            job.definition.working_directory.as_deref(),
        )?;
        info!(
            job = %job.name,
            executor = runner.name(),
            sandbox = %sandbox.root().display(),
            steps = job.definition.steps.len(),
            "Running job"
        );

        let scope = JobScope {
            job,
            ctx,
            environment: job_environment(job, ctx, &sandbox),
            sandbox,
            runner,
        };
        let outcome = self.run_steps(&scope).await;

        if self.paths.keep_workspaces {
            debug!(sandbox = %scope.sandbox.root().display(), "Keeping sandbox");
        } else if let Err(e) = scope.sandbox.cleanup() {
            warn!(error = %e, "Failed to clean up sandbox");
        }

        if outcome.status == JobStatus::Failed {
            debug!(job = %job.name, message = outcome.message.as_deref().unwrap_or(""), "Job failed");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_cache::FilesystemStore;
    use conveyor_core::config::{DockerImage, JobDefinition, When};
    use conveyor_core::ports::ChannelSink;
    use conveyor_core::trigger::TriggerEvent;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        runner: JobRunner,
        artifacts: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(source.join(".git")).unwrap();
        fs::write(source.join(".git/HEAD"), b"ref: refs/heads/master\n").unwrap();
        fs::write(source.join("Makefile"), b"all:\n").unwrap();

        let artifacts = dir.path().join("artifacts");
        let paths = RunnerPaths::new(dir.path().join("workspaces"), &artifacts).with_source(&source);
        let cache = Arc::new(FilesystemStore::new(dir.path().join("cache")));
        Fixture {
            runner: JobRunner::new(cache, paths),
            artifacts,
            _dir: dir,
        }
    }

    fn machine_job(name: &str, steps: Vec<Step>) -> JobSpec {
        let mut definition = JobDefinition::machine(steps);
        definition.working_directory = Some("~/fun".to_string());
        JobSpec::new(name, definition)
    }

    fn run_step(command: &str, when: When) -> Step {
        let mut run = RunStep::new(command);
        run.when = when;
        Step::Run(run)
    }

    fn store(path: &str) -> Step {
        Step::StoreArtifacts(StoreArtifactsStep {
            path: path.to_string(),
            destination: None,
        })
    }

    fn statuses(outcome: &JobOutcome) -> Vec<StepStatus> {
        outcome.steps.iter().map(|s| s.status).collect()
    }

    fn ctx() -> RunContext {
        RunContext::new("videofront", TriggerEvent::branch_push("master", "0123abcd"))
    }

    #[tokio::test]
    async fn test_ci_environment() {
        let fx = fixture();
        let mut job = machine_job(
            "build",
            vec![
                Step::run("env | grep -E '^(CI|CIRCLECI|CIRCLE_[A-Z0-9_]+|HOME|DJANGO_SETTINGS_MODULE)=' | sort > env.txt"),
                store("env.txt"),
            ],
        );
        job.definition
            .environment
            .insert("DJANGO_SETTINGS_MODULE".into(), "videofront.settings".into());
        let ctx = ctx();

        let outcome = fx.runner.execute(&job, &ctx).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded);

        let env_file = job_artifacts_dir(&fx.artifacts, &ctx.run_id, "build").join("env.txt");
        let env = fs::read_to_string(env_file).unwrap();
        assert!(env.contains("CI=true\n"));
        assert!(env.contains("CIRCLECI=true\n"));
        assert!(env.contains("CIRCLE_SHA1=0123abcd\n"));
        assert!(env.contains("CIRCLE_BRANCH=master\n"));
        assert!(env.contains("CIRCLE_JOB=build\n"));
        assert!(env.contains(&format!("CIRCLE_WORKFLOW_ID={}\n", ctx.run_id)));
        assert!(env.contains("DJANGO_SETTINGS_MODULE=videofront.settings\n"));
        let home = env.lines().find_map(|l| l.strip_prefix("HOME=")).unwrap();
        assert!(home.ends_with("/build/home"));
        assert!(env.contains(&format!("CIRCLE_WORKING_DIRECTORY={home}/fun\n")));
    }

    #[tokio::test]
    async fn test_step_environment_overrides_job() {
        let fx = fixture();
        let mut run = RunStep::new("test \"$POSTGRES_PORT\" = 5442");
        run.environment.insert("POSTGRES_PORT".into(), "5442".into());
        let mut job = machine_job("test-back", vec![Step::Run(run)]);
        job.definition
            .environment
            .insert("POSTGRES_PORT".into(), "5432".into());

        let outcome = fx.runner.execute(&job, &ctx()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_when_semantics_after_failure() {
        let fx = fixture();
        let job = machine_job(
            "lint",
            vec![
                run_step("true", When::OnSuccess),
                run_step("exit 4", When::OnSuccess),
                run_step("echo never", When::OnSuccess),
                run_step("echo cleanup", When::OnFail),
                run_step("echo always", When::Always),
            ],
        );

        let outcome = fx.runner.execute(&job, &ctx()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, Some(4));
        assert!(outcome.message.as_deref().unwrap().contains("exit 4"));
        assert_eq!(
            statuses(&outcome),
            vec![
                StepStatus::Succeeded,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Succeeded,
                StepStatus::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_on_fail_steps_skipped_on_success() {
        let fx = fixture();
        let job = machine_job(
            "lint",
            vec![run_step("true", When::OnSuccess), run_step("true", When::OnFail)],
        );
        let outcome = fx.runner.execute(&job, &ctx()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(statuses(&outcome), vec![StepStatus::Succeeded, StepStatus::Skipped]);
    }

    #[tokio::test]
    async fn test_checkout_copies_source() {
        let fx = fixture();
        let job = machine_job(
            "build",
            vec![Step::Checkout(CheckoutStep::default()), Step::run("test -f .git/HEAD && test -f Makefile")],
        );
        let outcome = fx.runner.execute(&job, &ctx()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded, "{:?}", outcome.message);
        assert_eq!(outcome.steps[0].message.as_deref(), Some("copied 28 bytes"));
    }

    #[tokio::test]
    async fn test_cache_flows_between_jobs() {
        let fx = fixture();
        let ctx = ctx();
        let save = machine_job(
            "build",
            vec![
                Step::run("mkdir -p docker/images && echo layers > docker/images/app.tar"),
                Step::SaveCache(SaveCacheStep {
                    name: None,
                    key: "docker-debian-images-{{ .Revision }}".into(),
                    paths: vec!["~/fun/docker/images/".into()],
                    when: When::OnSuccess,
                }),
            ],
        );
        let restore = machine_job(
            "build-dev",
            vec![
                Step::RestoreCache(RestoreCacheStep {
                    name: None,
                    keys: vec!["docker-debian-images-{{ .Revision }}".into()],
                }),
                Step::run("grep -q layers docker/images/app.tar"),
            ],
        );

        let saved = fx.runner.execute(&save, &ctx).await.unwrap();
        assert_eq!(saved.status, JobStatus::Succeeded);
        assert_eq!(
            saved.artifacts[0].kind,
            ArtifactKind::CacheSaved {
                key: "docker-debian-images-0123abcd".into()
            }
        );

        let restored = fx.runner.execute(&restore, &ctx).await.unwrap();
        assert_eq!(restored.status, JobStatus::Succeeded, "{:?}", restored.message);
        assert_eq!(
            restored.artifacts[0].kind,
            ArtifactKind::CacheRestored {
                key: "docker-debian-images-0123abcd".into(),
                exact: true
            }
        );
    }

    #[tokio::test]
    async fn test_cache_miss_is_not_a_failure() {
        let fx = fixture();
        let job = machine_job(
            "build-dev",
            vec![Step::RestoreCache(RestoreCacheStep {
                name: None,
                keys: vec!["docker-debian-images-{{ .Revision }}".into()],
            })],
        );
        let outcome = fx.runner.execute(&job, &ctx()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert!(outcome.artifacts.is_empty());
        assert_eq!(outcome.steps[0].message.as_deref(), Some("no cache found"));
    }

    #[tokio::test]
    async fn test_bad_key_template_fails_step() {
        let fx = fixture();
        let job = machine_job(
            "build",
            vec![Step::SaveCache(SaveCacheStep {
                name: None,
                key: "images-{{ .BuildNum }}".into(),
                paths: vec![".".into()],
                when: When::OnSuccess,
            })],
        );
        let outcome = fx.runner.execute(&job, &ctx()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.message.unwrap().contains("unknown expression"));
    }

    #[tokio::test]
    async fn test_step_events_and_output() {
        let fx = fixture();
        let (sink, mut rx) = ChannelSink::new();
        let ctx = ctx().with_events(Arc::new(sink));
        let job = machine_job("lint-git", vec![Step::run("echo first; echo second")]);

        fx.runner.execute(&job, &ctx).await.unwrap();
        drop(ctx);

        let mut topics = vec![];
        let mut lines = vec![];
        while let Ok(event) = rx.try_recv() {
            if let Event::StepOutput(p) = &event {
                lines.push(p.line.clone());
            }
            topics.push(event.topic());
        }
        assert_eq!(lines, vec!["first", "second"]);
        assert_eq!(topics.first().unwrap(), "job.lint-git.step.0.started");
        assert_eq!(topics.last().unwrap(), "job.lint-git.step.0.completed");
    }

    #[tokio::test]
    async fn test_sandbox_removed_unless_kept() {
        let fx = fixture();
        let ctx = ctx();
        let job = machine_job("build", vec![Step::run("true")]);
        fx.runner.execute(&job, &ctx).await.unwrap();
        let root = fx
            .runner
            .paths()
            .workspace_root
            .join(ctx.run_id.to_string())
            .join("build");
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_job_without_executor_is_error() {
        let fx = fixture();
        let ctx = ctx();
        let job = JobSpec::new("broken", JobDefinition::default());
        let err = fx.runner.execute(&job, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let run_dir = fx.runner.paths().workspace_root.join(ctx.run_id.to_string());
        assert!(!run_dir.exists());
    }

    #[tokio::test]
    async fn test_docker_connect_failure_leaves_no_sandbox() {
        if std::env::var_os("DOCKER_HOST").is_some() || Path::new("/var/run/docker.sock").exists() {
            return;
        }
        let fx = fixture();
        let ctx = ctx();
        let job = JobSpec::new(
            "lint-git",
            JobDefinition {
                docker: vec![DockerImage {
                    image: "circleci/python:3.6-stretch".to_string(),
                    environment: BTreeMap::new(),
                }],
                steps: vec![Step::run("git log -1")],
                ..Default::default()
            },
        );

        let err = fx.runner.execute(&job, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Container(_)));
        let run_dir = fx.runner.paths().workspace_root.join(ctx.run_id.to_string());
        assert!(!run_dir.exists());
    }
}
