//! Shell-based step execution on the host.

use crate::runner::{DEFAULT_SHELL, OutputLine, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use conveyor_core::events::OutputStream;
use conveyor_core::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a timed-out step gets to exit after SIGTERM before SIGKILL.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Shell runner for executing commands on the host.
pub struct ShellRunner {
    default_shell: String,
}

impl ShellRunner {
    pub fn new(default_shell: impl Into<String>) -> Self {
        Self {
            default_shell: default_shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_num = 0u32;

        while let Ok(Some(line)) = lines.next_line().await {
            line_num += 1;
            if tx.send(OutputLine::new(stream, line, line_num)).await.is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let argv = ctx.argv(&self.default_shell);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty shell command".to_string()))?;

        info!(
            command = %ctx.command,
            working_dir = %ctx.working_dir.display(),
            "Executing shell command"
        );

        std::fs::create_dir_all(&ctx.working_dir)?;
        // The step leads its own process group so a timeout reaches every
        // process it started.
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&ctx.working_dir)
            .envs(&ctx.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .group_spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn `{program}`: {e}")))?;

        // Both readers feed one channel so any output resets the idle timer.
        let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(256);
        if let Some(stdout) = child.inner().stdout.take() {
            forward_lines(stdout, OutputStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.inner().stderr.take() {
            forward_lines(stderr, OutputStream::Stderr, line_tx.clone());
        }
        drop(line_tx);

        let idle = tokio::time::sleep(ctx.no_output_timeout);
        tokio::pin!(idle);
        let mut streams_open = true;

        let status = loop {
            tokio::select! {
                line = line_rx.recv(), if streams_open => match line {
                    Some(line) => {
                        idle.as_mut().reset(Instant::now() + ctx.no_output_timeout);
                        let _ = output_tx.send(line).await;
                    }
                    None => streams_open = false,
                },
                status = child.wait() => break status?,
                () = &mut idle => {
                    let seconds = ctx.no_output_timeout.as_secs();
                    warn!(seconds, command = %ctx.command, "No output received, killing process group");
                    terminate_process_group(&mut child, KILL_GRACE_PERIOD).await;
                    return Err(Error::StepTimeout { seconds });
                }
            }
        };

        while let Some(line) = line_rx.recv().await {
            let _ = output_tx.send(line).await;
        }

        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(exit_code, duration_ms, "Command completed");

        Ok(StepResult::from_exit(exit_code, duration_ms))
    }

    fn name(&self) -> &'static str {
        "machine"
    }
}

/// SIGTERM the whole group, wait up to `grace`, then SIGKILL and reap.
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let group = Pid::from_raw(-raw);

    if let Err(e) = signal::kill(group, Signal::SIGTERM)
        && e != Errno::ESRCH
    {
        warn!(pid, error = ?e, "SIGTERM to process group failed");
    }

    let deadline = Instant::now() + grace;
    let mut leader_gone = false;
    while Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            leader_gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Children may outlive the leader, so the group is killed either way.
    if let Err(e) = signal::kill(group, Signal::SIGKILL)
        && e != Errno::ESRCH
    {
        warn!(pid, error = ?e, "SIGKILL to process group failed");
    }
    if !leader_gone && let Err(e) = child.wait().await {
        warn!(pid, error = %e, "Failed to reap process");
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn run(ctx: &StepContext) -> (Result<StepResult>, Vec<OutputLine>) {
        let runner = ShellRunner::default();
        let (tx, mut rx) = mpsc::channel(100);
        let result = runner.execute(ctx, tx).await;
        let mut lines = vec![];
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        (result, lines)
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let dir = TempDir::new().unwrap();
        let mut ctx = StepContext::new("echo hello; echo oops >&2", dir.path());
        ctx.environment.insert("GREETING".into(), "hi".into());

        let (result, lines) = run(&ctx).await;
        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);

        let stdout: Vec<&str> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.content.as_str())
            .collect();
        assert_eq!(stdout, vec!["hello"]);
        assert!(lines.iter().any(|l| l.stream == OutputStream::Stderr && l.content == "oops"));
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = StepContext::new("exit 3", dir.path());
        let (result, _) = run(&ctx).await;
        let result = result.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_pipefail_by_default() {
        let dir = TempDir::new().unwrap();
        let ctx = StepContext::new("false | cat", dir.path());
        let (result, _) = run(&ctx).await;
        assert!(!result.unwrap().success);
    }

    #[tokio::test]
    async fn test_environment_and_working_dir() {
        let dir = TempDir::new().unwrap();
        let mut ctx = StepContext::new("echo \"$GREETING\" > out.txt", dir.path().join("nested"));
        ctx.environment.insert("GREETING".into(), "hi".into());

        let (result, _) = run(&ctx).await;
        assert!(result.unwrap().success);
        let written = std::fs::read_to_string(dir.path().join("nested/out.txt")).unwrap();
        assert_eq!(written.trim(), "hi");
    }

    #[tokio::test]
    async fn test_no_output_timeout_kills_step() {
        let dir = TempDir::new().unwrap();
        let mut ctx = StepContext::new("echo start; sleep 5", dir.path());
        ctx.no_output_timeout = Duration::from_millis(300);

        let started = std::time::Instant::now();
        let (result, lines) = run(&ctx).await;
        assert!(matches!(result, Err(Error::StepTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(lines[0].content, "start");
    }

    #[tokio::test]
    async fn test_timeout_kills_processes_started_by_step() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let mut ctx = StepContext::new(
            "echo start; ( sleep 1; touch marker ) & ( sleep 1; touch marker ); echo end",
            dir.path(),
        );
        ctx.no_output_timeout = Duration::from_millis(300);

        let (result, _) = run(&ctx).await;
        assert!(matches!(result, Err(Error::StepTimeout { .. })));

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_output_resets_idle_timer() {
        let dir = TempDir::new().unwrap();
        let mut ctx = StepContext::new(
            "for i in 1 2 3 4; do echo $i; sleep 0.2; done",
            dir.path(),
        );
        ctx.no_output_timeout = Duration::from_millis(600);

        let (result, lines) = run(&ctx).await;
        assert!(result.unwrap().success);
        assert_eq!(lines.len(), 4);
    }
}
