//! Parsing tests against the videofront demo config.

use conveyor_core::config::*;
use pretty_assertions::assert_eq;

const VIDEOFRONT: &str = include_str!("../../../demos/videofront/config.yml");

fn videofront() -> ConfigFile {
    ConfigFile::from_yaml(VIDEOFRONT).expect("videofront config parses")
}

#[test]
fn test_videofront_declares_expected_jobs() {
    let config = videofront();
    let jobs: Vec<&str> = config.jobs.keys().map(String::as_str).collect();
    assert_eq!(
        jobs,
        vec![
            "build",
            "build-alpine",
            "build-dev",
            "hub",
            "lint-back-black",
            "lint-back-flake8",
            "lint-back-isort",
            "lint-back-pylint",
            "lint-git",
            "test-alpine",
            "test-back",
        ]
    );
}

#[test]
fn test_videofront_workflow_order() {
    let config = videofront();
    assert_eq!(config.sole_workflow(), Some("videofront"));

    let workflow = config.workflow("videofront").unwrap();
    let order: Vec<&str> = workflow.jobs.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(
        order,
        vec![
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
        ]
    );

    let hub = workflow.jobs.iter().find(|j| j.name == "hub").unwrap();
    assert_eq!(hub.requires, vec!["test-back", "test-alpine"]);
    let filters = hub.filters.as_ref().unwrap();
    assert_eq!(filters.branches.as_ref().unwrap().ignore, vec!["/.*/"]);
    assert_eq!(filters.tags.as_ref().unwrap().only, vec!["/^v.*/"]);
}

#[test]
fn test_videofront_executors() {
    let config = videofront();

    let lint_git = config.job("lint-git").unwrap();
    assert!(matches!(
        lint_git.executor(),
        Ok(ExecutorKind::Docker { ref image, .. }) if image == "circleci/python:3.6-stretch"
    ));

    for name in ["build", "build-dev", "test-back", "hub"] {
        let job = config.job(name).unwrap();
        assert_eq!(job.executor(), Ok(ExecutorKind::Machine { image: None }), "{name}");
        assert_eq!(job.working_directory.as_deref(), Some("~/fun"));
    }
}

#[test]
fn test_videofront_cache_keys() {
    let config = videofront();

    let saved = |job: &str| -> Vec<String> {
        config
            .job(job)
            .unwrap()
            .saved_cache_keys()
            .map(str::to_string)
            .collect()
    };
    assert_eq!(saved("build"), vec!["docker-debian-images-{{ .Revision }}"]);
    assert_eq!(saved("build-dev"), vec!["docker-debian-images-dev-{{ .Revision }}"]);
    assert_eq!(saved("build-alpine"), vec!["docker-alpine-images-dev-{{ .Revision }}"]);

    let hub = config.job("hub").unwrap();
    let restored: Vec<&str> = hub
        .steps
        .iter()
        .filter_map(|step| match step {
            Step::RestoreCache(restore) => Some(restore.keys[0].as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        restored,
        vec![
            "docker-debian-images-dev-{{ .Revision }}",
            "docker-alpine-images-dev-{{ .Revision }}",
        ]
    );
}

#[test]
fn test_videofront_job_environment() {
    let config = videofront();
    let test_back = config.job("test-back").unwrap();
    assert_eq!(
        test_back.environment.get("DJANGO_SETTINGS_MODULE").map(String::as_str),
        Some("videofront.settings_test")
    );
    assert_eq!(
        test_back.environment.get("POSTGRES_PORT").map(String::as_str),
        Some("5442")
    );
}

#[test]
fn test_missing_workflow_is_an_error() {
    let config = videofront();
    let err = config.workflow("nightly").unwrap_err();
    assert!(matches!(err, conveyor_core::Error::WorkflowNotFound(ref name) if name == "nightly"));
}

#[test]
fn test_invalid_yaml_is_invalid_config() {
    let err = ConfigFile::from_yaml("jobs: [not, a, map]").unwrap_err();
    assert!(matches!(err, conveyor_core::Error::InvalidConfig(_)));
}
