//! Container-based step execution using Docker.

use crate::runner::{DEFAULT_CONTAINER_SHELL, OutputLine, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use conveyor_core::events::OutputStream;
use conveyor_core::{Error, Result};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Runs each step in a fresh container of the job's primary image.
///
/// Mounted host directories appear at the same absolute path inside the
/// container, so sandbox paths are valid on both sides.
pub struct ContainerRunner {
    docker: Docker,
    image: String,
    environment: BTreeMap<String, String>,
    mounts: Vec<PathBuf>,
}

impl ContainerRunner {
    /// Connect to the local Docker daemon.
    pub fn connect(image: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self::with_docker(docker, image))
    }

    /// Create with an existing Docker client.
    pub fn with_docker(docker: Docker, image: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
            environment: BTreeMap::new(),
            mounts: vec![],
        }
    }

    /// Variables set on the image itself; step variables override them.
    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_mount(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mounts.push(dir.into());
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Pull the image unless it is already present.
    pub async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.image, "Pulling image");
        let options = CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let progress = progress
                .map_err(|e| Error::Container(format!("Failed to pull {}: {}", self.image, e)))?;
            if let Some(status) = progress.status {
                debug!(image = %self.image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    fn container_config(&self, ctx: &StepContext) -> Config<String> {
        let env: Vec<String> = self
            .environment
            .iter()
            .chain(ctx.environment.iter())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let binds: Vec<String> = self
            .mounts
            .iter()
            .map(|dir| format!("{0}:{0}", dir.display()))
            .collect();

        Config {
            image: Some(self.image.clone()),
            cmd: Some(ctx.argv(DEFAULT_CONTAINER_SHELL)),
            env: Some(env),
            working_dir: Some(ctx.working_dir.display().to_string()),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(binds),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn stream_logs(
        &self,
        container_name: &str,
        ctx: &StepContext,
        output_tx: &mpsc::Sender<OutputLine>,
    ) -> Result<()> {
        let log_options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut log_stream = self.docker.logs(container_name, Some(log_options));
        let mut stdout_line_num = 0u32;
        let mut stderr_line_num = 0u32;

        loop {
            let next = match timeout(ctx.no_output_timeout, log_stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let seconds = ctx.no_output_timeout.as_secs();
                    warn!(container = %container_name, seconds, "No output received, killing container");
                    if let Err(e) = self
                        .docker
                        .kill_container(container_name, None::<KillContainerOptions<String>>)
                        .await
                    {
                        warn!(container = %container_name, error = %e, "Failed to kill container");
                    }
                    return Err(Error::StepTimeout { seconds });
                }
            };

            let (stream, message, counter) = match next {
                None => return Ok(()),
                Some(Ok(LogOutput::StdOut { message })) => {
                    (OutputStream::Stdout, message, &mut stdout_line_num)
                }
                Some(Ok(LogOutput::StdErr { message })) => {
                    (OutputStream::Stderr, message, &mut stderr_line_num)
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "Error reading container logs");
                    return Ok(());
                }
            };

            for line in String::from_utf8_lossy(&message).lines() {
                *counter += 1;
                if output_tx.send(OutputLine::new(stream, line, *counter)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn wait(&self, container_name: &str) -> Result<i32> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let result = self
            .docker
            .wait_container(container_name, Some(wait_options))
            .next()
            .await
            .ok_or_else(|| Error::Container("Container wait returned no result".to_string()))?;

        match result {
            Ok(response) => Ok(exit_code(response.status_code)),
            // Non-zero exits surface as this error variant.
            Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => Ok(exit_code(code)),
            Err(e) => Err(Error::Container(format!("Container wait failed: {}", e))),
        }
    }

    async fn remove(&self, container_name: &str) {
        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_name, Some(remove_options))
            .await
        {
            warn!(container = %container_name, error = %e, "Failed to remove container");
        }
    }
}

fn exit_code(code: i64) -> i32 {
    i32::try_from(code).unwrap_or(-1)
}

#[async_trait]
impl StepRunner for ContainerRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let start = std::time::Instant::now();
        let container_name = format!("conveyor-{}", uuid::Uuid::new_v4());

        info!(
            image = %self.image,
            container = %container_name,
            command = %ctx.command,
            "Starting container execution"
        );

        self.ensure_image().await?;
        std::fs::create_dir_all(&ctx.working_dir)?;

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        self.docker
            .create_container(Some(create_options), self.container_config(ctx))
            .await
            .map_err(|e| Error::Container(format!("Failed to create container: {}", e)))?;

        let outcome: Result<i32> = async {
            self.docker
                .start_container(&container_name, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| Error::Container(format!("Failed to start container: {}", e)))?;
            self.stream_logs(&container_name, ctx, &output_tx).await?;
            self.wait(&container_name).await
        }
        .await;

        self.remove(&container_name).await;

        let exit_code = outcome?;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            container = %container_name,
            exit_code,
            duration_ms,
            "Container execution completed"
        );

        Ok(StepResult::from_exit(exit_code, duration_ms))
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_config() {
        let docker = Docker::connect_with_http_defaults().unwrap();
        let runner = ContainerRunner::with_docker(docker, "circleci/python:3.6-stretch")
            .with_environment(BTreeMap::from([("LANG".into(), "C.UTF-8".into())]))
            .with_mount("/tmp/conveyor/run_1/lint-git");

        let mut ctx = StepContext::new("git log -1", "/tmp/conveyor/run_1/lint-git/home/fun");
        ctx.environment.insert("HOME".into(), "/tmp/conveyor/run_1/lint-git/home".into());

        let config = runner.container_config(&ctx);
        assert_eq!(config.image.as_deref(), Some("circleci/python:3.6-stretch"));
        assert_eq!(
            config.cmd.unwrap(),
            vec!["/bin/sh", "-e", "-c", "git log -1"]
        );
        assert_eq!(
            config.env.unwrap(),
            vec!["LANG=C.UTF-8", "HOME=/tmp/conveyor/run_1/lint-git/home"]
        );
        assert_eq!(
            config.working_dir.as_deref(),
            Some("/tmp/conveyor/run_1/lint-git/home/fun")
        );
        assert_eq!(
            config.host_config.unwrap().binds.unwrap(),
            vec!["/tmp/conveyor/run_1/lint-git:/tmp/conveyor/run_1/lint-git"]
        );
    }

    #[test]
    fn test_exit_code_conversion() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(137), 137);
        assert_eq!(exit_code(i64::MAX), -1);
    }
}
