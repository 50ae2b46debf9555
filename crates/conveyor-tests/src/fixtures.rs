//! Test fixtures for configs and triggers.

use conveyor_core::config::ConfigFile;
use conveyor_core::trigger::TriggerEvent;
use conveyor_scheduler::{DagBuilder, ExecutionPlan, Planner};
use std::path::{Path, PathBuf};

pub const VIDEOFRONT_WORKFLOW: &str = "videofront";

/// Every job of the videofront workflow, in declaration order.
pub const VIDEOFRONT_JOBS: &[&str] = &[
    "lint-git",
    "build",
    "build-dev",
    "lint-back-black",
    "lint-back-isort",
    "lint-back-flake8",
    "lint-back-pylint",
    "test-back",
    "build-alpine",
    "test-alpine",
    "hub",
];

pub fn videofront_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/videofront/config.yml")
}

/// The videofront pipeline config.
pub fn videofront() -> ConfigFile {
    match ConfigFile::from_path(&videofront_path()) {
        Ok(config) => config,
        Err(e) => panic!("videofront fixture does not parse: {e}"),
    }
}

/// Plan the videofront workflow for `trigger`.
pub fn videofront_plan(trigger: &TriggerEvent) -> ExecutionPlan {
    plan(&videofront(), VIDEOFRONT_WORKFLOW, trigger)
}

/// Plan `workflow` of `config` for `trigger`.
pub fn plan(config: &ConfigFile, workflow: &str, trigger: &TriggerEvent) -> ExecutionPlan {
    match DagBuilder::new().build_from_config(config, workflow) {
        Ok(dag) => Planner::plan(&dag, trigger),
        Err(e) => panic!("workflow `{workflow}` does not build: {e}"),
    }
}

/// A push to `master`.
pub fn master_push() -> TriggerEvent {
    TriggerEvent::branch_push("master", "9f3c2a1d5e7b8c4f6a0b1c2d3e4f5a6b7c8d9e0f")
}

/// A release tag push.
pub fn release_tag(tag: &str) -> TriggerEvent {
    TriggerEvent::tag_push(tag, "9f3c2a1d5e7b8c4f6a0b1c2d3e4f5a6b7c8d9e0f")
}
