//! Test helper executors and sandboxes.

use async_trait::async_trait;
use conveyor_cache::FilesystemStore;
use conveyor_core::events::Event;
use conveyor_core::ports::{JobExecutor, JobOutcome, JobSpec, RunContext};
use conveyor_core::Result;
use conveyor_runner::{JobRunner, RunnerPaths};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Started,
    Finished,
}

#[derive(Debug, Default)]
struct Recording {
    started: Vec<String>,
    finished: Vec<String>,
    timeline: Vec<(Phase, String)>,
    running: usize,
    peak: usize,
}

/// A [`JobExecutor`] that runs nothing and records what it was asked to do.
#[derive(Default)]
pub struct RecordingExecutor {
    recording: Mutex<Recording>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make these jobs fail with exit code 1.
    pub fn failing<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing.extend(jobs.into_iter().map(Into::into));
        self
    }

    /// How long every job takes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// How long one job takes.
    pub fn with_job_delay(mut self, job: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(job.into(), delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
        self.recording
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs in the order they started.
    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    /// Jobs in the order they finished.
    pub fn finished(&self) -> Vec<String> {
        self.lock().finished.clone()
    }

    /// Most jobs ever running at once.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    /// Whether `job` started only after every job in `requires` finished.
    pub fn started_after(&self, job: &str, requires: &[&str]) -> bool {
        let recording = self.lock();
        let position = |phase: Phase, name: &str| {
            recording
                .timeline
                .iter()
                .position(|(p, n)| *p == phase && n == name)
        };
        let Some(start) = position(Phase::Started, job) else {
            return false;
        };
        requires
            .iter()
            .all(|r| position(Phase::Finished, r).is_some_and(|finish| finish < start))
    }
}

#[async_trait]
impl JobExecutor for RecordingExecutor {
    async fn execute(&self, job: &JobSpec, _ctx: &RunContext) -> Result<JobOutcome> {
        {
            let mut recording = self.lock();
            recording.started.push(job.name.clone());
            recording.timeline.push((Phase::Started, job.name.clone()));
            recording.running += 1;
            recording.peak = recording.peak.max(recording.running);
        }

        let delay = self
            .delays
            .get(&job.name)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut recording = self.lock();
            recording.running -= 1;
            recording.finished.push(job.name.clone());
            recording.timeline.push((Phase::Finished, job.name.clone()));
        }

        if self.failing.contains(&job.name) {
            Ok(JobOutcome::failed(Some(1), "simulated failure"))
        } else {
            Ok(JobOutcome::succeeded())
        }
    }
}

/// Drain every event already sent on `rx`.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A [`JobRunner`] over fresh temporary cache, workspace and artifact
/// directories, with `source/` as the checkout source.
pub struct LocalSandbox {
    dir: TempDir,
    pub runner: Arc<JobRunner>,
}

impl LocalSandbox {
    pub fn new() -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("source"))?;

        let paths = RunnerPaths::new(dir.path().join("workspaces"), dir.path().join("artifacts"))
            .with_source(dir.path().join("source"));
        let cache = Arc::new(FilesystemStore::new(dir.path().join("cache")));
        Ok(Self {
            runner: Arc::new(JobRunner::new(cache, paths)),
            dir,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// The checkout source tree.
    pub fn source(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }

    /// Write a file into the source tree.
    pub fn write_source(&self, relative: &str, contents: &str) -> anyhow::Result<()> {
        let path = self.source().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}
