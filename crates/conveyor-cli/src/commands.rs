//! CLI command definitions.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter .circleci/config.yml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Validate a config file
    Validate {
        /// Path to the config file
        path: Option<PathBuf>,
    },

    /// Show which jobs a trigger would run
    Plan {
        /// Path to the config file
        path: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Run a workflow locally
    Run {
        /// Path to the config file
        path: Option<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,

        /// Directory checked out by `checkout` steps
        #[arg(long)]
        source: Option<PathBuf>,

        /// Maximum number of jobs running at once
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Extra environment variable for every job (KEY=VALUE)
        #[arg(short, long = "env", value_parser = parse_env_var)]
        env: Vec<(String, String)>,

        /// Write the JSON run report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Keep job sandboxes after the run
        #[arg(long)]
        keep_workspaces: bool,
    },

    /// Manage the local cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Print the JSON schema of the run report
    Schema,
}

/// Which workflow runs, and for which git ref.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Workflow name
    #[arg(short, long)]
    pub workflow: Option<String>,

    /// Branch being pushed
    #[arg(short, long, conflicts_with = "tag")]
    pub branch: Option<String>,

    /// Tag being pushed
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Commit SHA; defaults to `git rev-parse HEAD`
    #[arg(long)]
    pub revision: Option<String>,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cache entries
    List {
        /// Cache key prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Clear cache
    Clear {
        /// Cache key prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

/// Parse `KEY=VALUE`.
pub fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}
