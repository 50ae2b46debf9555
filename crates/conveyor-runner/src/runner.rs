//! Core runner trait and types.

use async_trait::async_trait;
use conveyor_core::Result;
use conveyor_core::events::OutputStream;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default shell for host steps.
pub const DEFAULT_SHELL: &str = "/bin/bash -eo pipefail";

/// Default shell inside containers, where bash may be missing.
pub const DEFAULT_CONTAINER_SHELL: &str = "/bin/sh -e";

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OutputLine {
    pub fn new(stream: OutputStream, content: impl Into<String>, line_number: u32) -> Self {
        Self {
            stream,
            content: content.into(),
            line_number,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn from_exit(exit_code: i32, duration_ms: u64) -> Self {
        Self {
            exit_code,
            success: exit_code == 0,
            duration_ms,
        }
    }
}

/// Everything a runner needs to execute one `run` step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub command: String,
    /// Shell invocation, e.g. `/bin/bash -eo pipefail`. The command is
    /// passed after `-c`. `None` uses the runner's default.
    pub shell: Option<String>,
    pub working_dir: PathBuf,
    pub environment: BTreeMap<String, String>,
    /// Kill the step when it prints nothing for this long.
    pub no_output_timeout: Duration,
}

impl StepContext {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            shell: None,
            working_dir: working_dir.into(),
            environment: BTreeMap::new(),
            no_output_timeout: conveyor_core::config::DEFAULT_NO_OUTPUT_TIMEOUT,
        }
    }

    /// The shell program and arguments, ending with `-c` and the command.
    pub fn argv(&self, default_shell: &str) -> Vec<String> {
        let shell = self.shell.as_deref().unwrap_or(default_shell);
        let mut argv: Vec<String> = shell.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            argv = default_shell.split_whitespace().map(str::to_string).collect();
        }
        argv.push("-c".to_string());
        argv.push(self.command.clone());
        argv
    }
}

/// Trait for step execution.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a command, streaming output to the provided channel.
    ///
    /// A non-zero exit is an `Ok` result. Exceeding the no-output timeout is
    /// `Error::StepTimeout`.
    async fn execute(&self, ctx: &StepContext, output_tx: mpsc::Sender<OutputLine>)
    -> Result<StepResult>;

    /// Executor label used in spans and logs.
    fn name(&self) -> &'static str;
}
