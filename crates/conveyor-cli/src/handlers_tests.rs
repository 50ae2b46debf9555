//! Tests for command handlers.

#[cfg(test)]
mod tests {
    use crate::commands::{TargetArgs, parse_env_var};
    use crate::config::CliConfig;
    use crate::handlers::{
        RunOptions, find_config, project_dir, render_plan, resolve_trigger, run, select_workflow,
        validate,
    };
    use conveyor_core::config::ConfigFile;
    use conveyor_core::trigger::TriggerEvent;
    use conveyor_scheduler::{DagBuilder, Planner};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn videofront_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/videofront/config.yml")
    }

    fn videofront() -> ConfigFile {
        ConfigFile::from_path(&videofront_path()).unwrap()
    }

    fn target(branch: Option<&str>, tag: Option<&str>) -> TargetArgs {
        TargetArgs {
            workflow: None,
            branch: branch.map(String::from),
            tag: tag.map(String::from),
            revision: Some("0123abcd0123abcd".into()),
        }
    }

    #[test]
    fn test_find_config_search_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_config(None, dir.path()).is_err());

        fs::write(dir.path().join("conveyor.yaml"), "jobs: {}").unwrap();
        assert_eq!(
            find_config(None, dir.path()).unwrap(),
            dir.path().join("conveyor.yaml")
        );

        fs::create_dir_all(dir.path().join(".circleci")).unwrap();
        fs::write(dir.path().join(".circleci/config.yml"), "jobs: {}").unwrap();
        assert_eq!(
            find_config(None, dir.path()).unwrap(),
            dir.path().join(".circleci/config.yml")
        );

        let explicit = dir.path().join("conveyor.yaml");
        assert_eq!(find_config(Some(&explicit), dir.path()).unwrap(), explicit);
        assert!(find_config(Some(&dir.path().join("missing.yml")), dir.path()).is_err());
    }

    #[test]
    fn test_project_dir() {
        assert_eq!(
            project_dir(Path::new("/src/videofront/.circleci/config.yml")),
            PathBuf::from("/src/videofront")
        );
        assert_eq!(
            project_dir(Path::new("/src/videofront/conveyor.yml")),
            PathBuf::from("/src/videofront")
        );
        assert_eq!(project_dir(Path::new("conveyor.yml")), PathBuf::from("."));
    }

    #[test]
    fn test_select_workflow() {
        let config = videofront();
        assert_eq!(select_workflow(&config, None, None).unwrap(), "videofront");
        assert_eq!(
            select_workflow(&config, None, Some("elsewhere")).unwrap(),
            "videofront"
        );
        assert!(select_workflow(&config, Some("nightly"), None).is_err());

        let several = ConfigFile::from_yaml(
            r#"
jobs:
  a: { machine: true, steps: [checkout] }
workflows:
  version: 2
  one: { jobs: [a] }
  two: { jobs: [a] }
"#,
        )
        .unwrap();
        let err = select_workflow(&several, None, None).unwrap_err();
        assert!(err.to_string().contains("one, two"));
        assert_eq!(select_workflow(&several, None, Some("two")).unwrap(), "two");
    }

    #[tokio::test]
    async fn test_trigger_from_flags() {
        let trigger = resolve_trigger(&target(None, Some("v1.2.0")), Path::new("/nonexistent"))
            .await
            .unwrap();
        assert_eq!(trigger, TriggerEvent::tag_push("v1.2.0", "0123abcd0123abcd"));
    }

    #[test]
    fn test_parse_env_var() {
        assert_eq!(
            parse_env_var("DOCKER_USER=fun").unwrap(),
            ("DOCKER_USER".to_string(), "fun".to_string())
        );
        assert_eq!(
            parse_env_var("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_env_var("novalue").is_err());
        assert!(parse_env_var("=x").is_err());
    }

    #[test]
    fn test_render_plan_for_branch_and_tag() {
        console::set_colors_enabled(false);
        let config = videofront();
        let dag = DagBuilder::new()
            .build_from_config(&config, "videofront")
            .unwrap();

        let branch = render_plan(&Planner::plan(&dag, &TriggerEvent::branch_push("master", "0123abcd9")));
        assert!(branch.starts_with("Workflow videofront for branch master (0123abc)\n"));
        assert!(branch.contains("  1. lint-git, build, build-alpine\n"));
        assert!(branch.contains("filtered out: hub"));

        let tag = render_plan(&Planner::plan(&dag, &TriggerEvent::tag_push("v1.0.0", "0123abcd9")));
        assert!(!tag.contains("filtered out"));
        assert!(tag.contains("hub"));
    }

    #[tokio::test]
    async fn test_validate_videofront() {
        assert!(validate(&CliConfig::default(), Some(&videofront_path())).await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_reports_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor.yml");
        fs::write(
            &path,
            r#"
jobs:
  a: { machine: true, steps: [checkout] }
  b: { machine: true, steps: [checkout] }
workflows:
  version: 2
  loop:
    jobs:
      - a: { requires: [b] }
      - b: { requires: [a] }
"#,
        )
        .unwrap();
        assert!(!validate(&CliConfig::default(), Some(&path)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        fs::create_dir_all(&project).unwrap();
        fs::write(project.join("README"), "fun").unwrap();
        let path = project.join("conveyor.yml");
        fs::write(
            &path,
            r#"
jobs:
  build:
    machine: true
    working_directory: ~/fun
    steps:
      - checkout
      - run: test -f README
  test:
    machine: true
    steps:
      - run: exit 2
  publish:
    machine: true
    steps:
      - run: echo never
workflows:
  version: 2
  main:
    jobs:
      - build
      - test: { requires: [build] }
      - publish: { requires: [test] }
"#,
        )
        .unwrap();

        let mut config = CliConfig::default();
        config
            .set("cache_dir", &dir.path().join("cache").display().to_string())
            .unwrap();
        config.set("output_format", "json").unwrap();
        let report = dir.path().join("report.json");

        let ok = run(
            &config,
            Some(&path),
            &target(Some("master"), None),
            RunOptions {
                source: None,
                jobs: Some(2),
                env: vec![],
                report: Some(report.clone()),
                keep_workspaces: false,
            },
        )
        .await
        .unwrap();
        assert!(!ok);

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        let statuses: Vec<&str> = json["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|job| job["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["succeeded", "failed", "skipped"]);
        assert_eq!(json["jobs"][2]["skip_reason"]["reason"], "upstream_failed");
    }
}
