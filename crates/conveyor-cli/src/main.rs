//! Conveyor CLI entrypoint.

use clap::{ArgAction, Parser};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod git;
mod handlers;
mod progress;

#[cfg(test)]
mod config_tests;
#[cfg(test)]
mod handlers_tests;

use commands::{CacheCommands, Commands, ConfigCommands};
use config::CliConfig;
use handlers::RunOptions;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(author, version, about = "Run CircleCI-style workflows locally", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = CliConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Ignoring unreadable CLI config");
        CliConfig::default()
    });
    if cli.json {
        config.output_format = config::OutputFormat::Json;
    }

    let ok = match cli.command {
        Commands::Init { force } => {
            handlers::init(force).await?;
            true
        }
        Commands::Validate { path } => handlers::validate(&config, path.as_deref()).await?,
        Commands::Plan { path, target } => {
            handlers::plan(&config, path.as_deref(), &target).await?;
            true
        }
        Commands::Run {
            path,
            target,
            source,
            jobs,
            env,
            report,
            keep_workspaces,
        } => {
            let options = RunOptions {
                source,
                jobs,
                env,
                report,
                keep_workspaces,
            };
            handlers::run(&config, path.as_deref(), &target, options).await?
        }
        Commands::Cache { command } => {
            match command {
                CacheCommands::List { prefix } => {
                    handlers::list_cache(&config, prefix.as_deref()).await?
                }
                CacheCommands::Clear { prefix } => {
                    handlers::clear_cache(&config, prefix.as_deref()).await?
                }
            }
            true
        }
        Commands::Config { command } => {
            match command {
                ConfigCommands::Show => handlers::show_config(&config)?,
                ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
            }
            true
        }
        Commands::Schema => {
            handlers::schema()?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
