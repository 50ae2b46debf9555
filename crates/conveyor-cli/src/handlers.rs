//! Command handlers.

use crate::commands::TargetArgs;
use crate::config::{CliConfig, OutputFormat};
use crate::{git, progress};
use anyhow::{Context, Result, anyhow, bail};
use conveyor_cache::{CacheStore, FilesystemStore};
use conveyor_core::config::ConfigFile;
use conveyor_core::ports::{ChannelSink, RunContext};
use conveyor_core::run::WorkflowRun;
use conveyor_core::trigger::{GitRef, TriggerEvent};
use conveyor_runner::{JobRunner, RunnerPaths};
use conveyor_scheduler::validate::has_errors;
use conveyor_scheduler::{DagBuilder, ExecutionPlan, Planner, Scheduler, Severity, validate_config};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Config file locations tried, in order, when no path is given.
pub const CONFIG_CANDIDATES: &[&str] = &[
    ".circleci/config.yml",
    ".circleci/config.yaml",
    "conveyor.yml",
    "conveyor.yaml",
];

const STARTER_CONFIG: &str = r#"version: 2

jobs:
  build:
    docker:
      - image: circleci/python:3.6-stretch
    working_directory: ~/project
    steps:
      - checkout
      - run:
          name: Build
          command: |
            echo "Building ${CIRCLE_SHA1}..."
            # Add your build commands here

workflows:
  version: 2
  main:
    jobs:
      - build
"#;

/// Locate the config file: `path` when given, else the first candidate under
/// `dir` that exists.
pub fn find_config(path: Option<&Path>, dir: &Path) -> Result<PathBuf> {
    if let Some(path) = path {
        if !path.exists() {
            bail!("Config file {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }

    CONFIG_CANDIDATES
        .iter()
        .map(|candidate| dir.join(candidate))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            anyhow!(
                "No config file found in {} (looked for {})",
                dir.display(),
                CONFIG_CANDIDATES.join(", ")
            )
        })
}

/// The directory a config file belongs to: the parent of `.circleci/` or
/// the file's own directory.
pub fn project_dir(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or(Path::new("."));
    let dir = if parent.file_name().is_some_and(|name| name == ".circleci") {
        parent.parent().unwrap_or(Path::new("."))
    } else {
        parent
    };
    if dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        dir.to_path_buf()
    }
}

fn load_config(path: Option<&Path>) -> Result<(PathBuf, ConfigFile)> {
    let cwd = std::env::current_dir()?;
    let path = find_config(path, &cwd)?;
    let config = ConfigFile::from_path(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    debug!(path = %path.display(), jobs = config.jobs.len(), "Loaded config");
    Ok((path, config))
}

/// Pick the workflow to run: the flag, the configured default, or the only
/// workflow in the file.
pub fn select_workflow(
    config: &ConfigFile,
    requested: Option<&str>,
    default: Option<&str>,
) -> Result<String> {
    if let Some(name) = requested {
        config.workflow(name)?;
        return Ok(name.to_string());
    }
    if let Some(name) = default
        && config.workflow(name).is_ok()
    {
        return Ok(name.to_string());
    }
    if let Some(name) = config.sole_workflow() {
        return Ok(name.to_string());
    }
    bail!(
        "Several workflows defined ({}); pass --workflow",
        config.workflow_names().join(", ")
    )
}

/// Build the trigger event from flags, falling back to git for whatever is
/// missing.
pub async fn resolve_trigger(target: &TargetArgs, source: &Path) -> Result<TriggerEvent> {
    let git_ref = match (&target.branch, &target.tag) {
        (Some(branch), _) => GitRef::branch(branch),
        (None, Some(tag)) => GitRef::tag(tag),
        (None, None) => GitRef::branch(
            git::current_branch(source)
                .await
                .context("Could not determine the branch; pass --branch or --tag")?,
        ),
    };
    let revision = match &target.revision {
        Some(revision) => revision.clone(),
        None => git::head_revision(source)
            .await
            .context("Could not determine the revision; pass --revision")?,
    };
    Ok(TriggerEvent::new(git_ref, revision))
}

fn build_plan(config: &ConfigFile, workflow: &str, trigger: &TriggerEvent) -> Result<ExecutionPlan> {
    let dag = DagBuilder::new().build_from_config(config, workflow)?;
    Ok(Planner::plan(&dag, trigger))
}

/// Write a starter config.
pub async fn init(force: bool) -> Result<()> {
    let path = Path::new(CONFIG_CANDIDATES[0]);

    if path.exists() && !force {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STARTER_CONFIG)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Validate a config. Returns whether it is free of errors.
pub async fn validate(config_cli: &CliConfig, path: Option<&Path>) -> Result<bool> {
    let (path, config) = load_config(path)?;
    let diagnostics = validate_config(&config);

    if config_cli.output_format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
        return Ok(!has_errors(&diagnostics));
    }

    for diagnostic in &diagnostics {
        let marker = match diagnostic.severity {
            Severity::Error => style("✗").red(),
            Severity::Warning => style("!").yellow(),
        };
        println!("{} {}", marker, diagnostic);
    }

    if has_errors(&diagnostics) {
        println!("{} {} is invalid", style("✗").red().bold(), path.display());
        return Ok(false);
    }

    println!("{} {} is valid", style("✓").green(), path.display());
    println!("  Jobs: {}", config.jobs.len());
    for name in config.workflow_names() {
        let jobs = config.workflow(name).map(|wf| wf.jobs.len()).unwrap_or(0);
        println!("    - {} ({} jobs)", name, jobs);
    }
    Ok(true)
}

/// Show the plan a trigger would produce.
pub async fn plan(config_cli: &CliConfig, path: Option<&Path>, target: &TargetArgs) -> Result<()> {
    let (path, config) = load_config(path)?;
    let workflow = select_workflow(
        &config,
        target.workflow.as_deref(),
        config_cli.default_workflow.as_deref(),
    )?;
    let trigger = resolve_trigger(target, &project_dir(&path)).await?;
    let plan = build_plan(&config, &workflow, &trigger)?;

    if config_cli.output_format == OutputFormat::Json {
        let levels: Vec<Vec<&str>> = plan
            .levels()
            .into_iter()
            .map(|level| level.into_iter().map(|job| job.name.as_str()).collect())
            .collect();
        let unsatisfiable: Vec<&str> = plan.unsatisfiable().map(|job| job.name.as_str()).collect();
        let report = serde_json::json!({
            "workflow": workflow,
            "trigger": trigger,
            "levels": levels,
            "filtered_out": plan.filtered_out,
            "unsatisfiable": unsatisfiable,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print!("{}", render_plan(&plan));
    Ok(())
}

/// Human-readable plan listing.
pub fn render_plan(plan: &ExecutionPlan) -> String {
    let mut out = format!(
        "Workflow {} for {} ({})\n",
        style(&plan.workflow).bold(),
        plan.trigger.git_ref,
        plan.trigger.short_revision()
    );

    if plan.is_empty() {
        out.push_str(&format!("  {} No jobs match this trigger\n", style("i").blue()));
    }
    for (index, level) in plan.levels().iter().enumerate() {
        let names: Vec<&str> = level.iter().map(|job| job.name.as_str()).collect();
        out.push_str(&format!("  {}. {}\n", index + 1, names.join(", ")));
    }
    for job in plan.unsatisfiable() {
        out.push_str(&format!(
            "  {} {} will be skipped: requires {} which is not part of this run\n",
            style("!").yellow(),
            job.name,
            job.missing_requirements.join(", ")
        ));
    }
    if !plan.filtered_out.is_empty() {
        out.push_str(&format!(
            "  {} {}\n",
            style("filtered out:").dim(),
            plan.filtered_out.join(", ")
        ));
    }
    out
}

/// Options of `conveyor run` beyond the target.
pub struct RunOptions {
    pub source: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub env: Vec<(String, String)>,
    pub report: Option<PathBuf>,
    pub keep_workspaces: bool,
}

/// Run a workflow locally. Returns whether it succeeded.
pub async fn run(
    config_cli: &CliConfig,
    path: Option<&Path>,
    target: &TargetArgs,
    options: RunOptions,
) -> Result<bool> {
    let (path, config) = load_config(path)?;
    let workflow = select_workflow(
        &config,
        target.workflow.as_deref(),
        config_cli.default_workflow.as_deref(),
    )?;
    let source = match options.source {
        Some(source) => source,
        None => project_dir(&path),
    };
    let source = std::fs::canonicalize(&source)
        .with_context(|| format!("Source directory {} not found", source.display()))?;

    let mut trigger = resolve_trigger(target, &source).await?;
    trigger.environment.extend(options.env);
    let plan = build_plan(&config, &workflow, &trigger)?;

    let paths = RunnerPaths::new(config_cli.workspace_root(), config_cli.artifacts_root())
        .with_source(&source)
        .keep_workspaces(options.keep_workspaces || config_cli.keep_workspaces);
    let cache = Arc::new(FilesystemStore::new(config_cli.blob_dir()));
    let runner = Arc::new(JobRunner::new(cache, paths));
    let max_parallel = options.jobs.unwrap_or(config_cli.max_parallel);

    let mut ctx = RunContext::new(&workflow, trigger);
    let mut printer = None;
    if config_cli.output_format == OutputFormat::Table {
        let (sink, rx) = ChannelSink::new();
        ctx = ctx.with_events(Arc::new(sink));
        printer = Some(tokio::spawn(progress::print_events(rx)));
    }

    info!(workflow = %workflow, run_id = %ctx.run_id, max_parallel, "Starting run");
    let result = Scheduler::new(runner)
        .with_max_parallel(max_parallel)
        .run(&plan, &ctx)
        .await;
    drop(ctx);
    if let Some(printer) = printer {
        printer.await?;
    }

    report(config_cli, &result, options.report.as_deref())?;
    Ok(result.is_success())
}

fn report(config_cli: &CliConfig, run: &WorkflowRun, report_path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(run)?;
    if let Some(report_path) = report_path {
        std::fs::write(report_path, &json)
            .with_context(|| format!("Failed to write report {}", report_path.display()))?;
        debug!(path = %report_path.display(), "Wrote run report");
    }

    match config_cli.output_format {
        OutputFormat::Json => println!("{}", json),
        OutputFormat::Table => print!("{}", progress::summary(run)),
    }
    Ok(())
}

/// List cache entries.
pub async fn list_cache(config: &CliConfig, prefix: Option<&str>) -> Result<()> {
    let store = FilesystemStore::new(config.blob_dir());
    let entries = store.list(prefix.unwrap_or("")).await?;

    if config.output_format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(());
    }
    for entry in &entries {
        println!(
            "  {}  {:>10} bytes  {}",
            style(&entry.key).bold(),
            entry.size_bytes,
            style(entry.created_at.format("%Y-%m-%d %H:%M:%S")).dim()
        );
    }
    println!("{} entries in {}", entries.len(), store.root_dir().display());
    Ok(())
}

/// Clear cache entries.
pub async fn clear_cache(config: &CliConfig, prefix: Option<&str>) -> Result<()> {
    let store = FilesystemStore::new(config.blob_dir());
    let mut removed = 0;
    for entry in store.list(prefix.unwrap_or("")).await? {
        if store.delete(&entry.key).await? {
            removed += 1;
        }
    }

    match prefix {
        Some(p) => println!(
            "{} Removed {} entries with prefix {}",
            style("✓").green(),
            removed,
            style(p).bold()
        ),
        None => println!("{} Removed {} entries", style("✓").green(), removed),
    }
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> Result<()> {
    println!("Current configuration:");
    println!("  cache_dir: {}", config.cache_root().display());
    println!("  workspace_dir: {}", config.workspace_root().display());
    println!("  artifacts_dir: {}", config.artifacts_root().display());
    println!("  max_parallel: {}", config.max_parallel);
    println!(
        "  default_workflow: {}",
        config.default_workflow.as_deref().unwrap_or("(not set)")
    );
    println!("  output_format: {:?}", config.output_format);
    println!("  keep_workspaces: {}", config.keep_workspaces);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }
    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

/// Print the JSON schema of the run report.
pub fn schema() -> Result<()> {
    let schema = schemars::schema_for!(WorkflowRun);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
