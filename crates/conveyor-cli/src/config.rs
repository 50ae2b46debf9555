//! CLI configuration management.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Where cache blobs are stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Parent of job sandboxes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    /// Where `store_artifacts` copies files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Workflow used when a config has several and none is named.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_workflow: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub keep_workspaces: bool,
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            workspace_dir: None,
            artifacts_dir: None,
            max_parallel: DEFAULT_MAX_PARALLEL,
            default_workflow: None,
            output_format: OutputFormat::default(),
            keep_workspaces: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "conveyor", "conveyor")
}

impl CliConfig {
    /// Load configuration from the user config file.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Save configuration to the user config file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = project_dirs().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".conveyor"))
        })
    }

    /// Where the cache store keeps its blobs.
    pub fn blob_dir(&self) -> PathBuf {
        self.cache_root().join("blobs")
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| self.cache_root().join("workspaces"))
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| self.cache_root().join("artifacts"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "cache_dir" => self.cache_dir = Some(PathBuf::from(value)),
            "workspace_dir" => self.workspace_dir = Some(PathBuf::from(value)),
            "artifacts_dir" => self.artifacts_dir = Some(PathBuf::from(value)),
            "max_parallel" => {
                let parsed: usize = value
                    .parse()
                    .map_err(|_| anyhow!("max_parallel must be a positive integer, got `{value}`"))?;
                if parsed == 0 {
                    bail!("max_parallel must be at least 1");
                }
                self.max_parallel = parsed;
            }
            "default_workflow" => {
                self.default_workflow = (!value.is_empty()).then(|| value.to_string());
            }
            "output_format" => {
                self.output_format = match value {
                    "table" => OutputFormat::Table,
                    "json" => OutputFormat::Json,
                    _ => bail!("Invalid output format: {}", value),
                };
            }
            "keep_workspaces" => {
                self.keep_workspaces = value
                    .parse()
                    .map_err(|_| anyhow!("keep_workspaces must be true or false, got `{value}`"))?;
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}
