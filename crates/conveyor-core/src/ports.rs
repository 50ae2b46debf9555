//! Port traits (hexagonal architecture).
//!
//! These traits define the seams between the scheduler and the adapters that
//! actually execute jobs or observe a run.

use crate::config::JobDefinition;
use crate::events::Event;
use crate::ids::RunId;
use crate::run::{ArtifactRef, JobStatus, StepRecord};
use crate::trigger::TriggerEvent;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A job as scheduled: its workflow name plus its definition.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub definition: JobDefinition,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, definition: JobDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
        }
    }
}

/// Run-wide context shared by every job of one workflow run.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub workflow: String,
    pub trigger: TriggerEvent,
    pub events: Arc<dyn EventSink>,
}

impl RunContext {
    pub fn new(workflow: impl Into<String>, trigger: TriggerEvent) -> Self {
        Self {
            run_id: RunId::new(),
            workflow: workflow.into(),
            trigger,
            events: Arc::new(NullSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Publish an event, logging rather than failing when the sink is gone.
    pub async fn emit(&self, event: Event) {
        if let Err(e) = self.events.publish(event).await {
            tracing::warn!(error = %e, "Failed to publish event");
        }
    }
}

/// What executing a job produced.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub steps: Vec<StepRecord>,
    pub artifacts: Vec<ArtifactRef>,
}

impl JobOutcome {
    pub fn succeeded() -> Self {
        Self {
            status: JobStatus::Succeeded,
            exit_code: Some(0),
            message: None,
            steps: vec![],
            artifacts: vec![],
        }
    }

    pub fn failed(exit_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            exit_code,
            message: Some(message.into()),
            steps: vec![],
            artifacts: vec![],
        }
    }
}

/// Executes a single job to completion.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run every step of `job`. An `Err` is treated as a job failure.
    async fn execute(&self, job: &JobSpec, ctx: &RunContext) -> Result<JobOutcome>;
}

/// Receives lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Discards every event.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn publish(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Forwards events onto an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::Internal("event receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobQueuedPayload;
    use chrono::Utc;

    fn queued(job: &str) -> Event {
        Event::JobQueued(JobQueuedPayload {
            run_id: RunId::new(),
            job: job.to_string(),
            queued_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish(queued("build")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "job.queued.build");
    }

    #[tokio::test]
    async fn test_channel_sink_fails_when_receiver_dropped() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(sink.publish(queued("build")).await.is_err());
    }
}
