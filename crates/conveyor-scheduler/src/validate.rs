//! Static checks over a whole config file.

use crate::dag::{DagBuilder, WorkflowDag};
use conveyor_core::config::{ConfigFile, Step};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub workflow: Option<String>,
    pub job: Option<String>,
    pub message: String,
}

impl Diagnostic {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            workflow: None,
            job: None,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message)
        }
    }

    fn in_workflow(mut self, workflow: &str) -> Self {
        self.workflow = Some(workflow.to_string());
        self
    }

    fn for_job(mut self, job: &str) -> Self {
        self.job = Some(job.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{severity}")?;
        match (&self.workflow, &self.job) {
            (Some(wf), Some(job)) => write!(f, " [{wf}/{job}]")?,
            (Some(wf), None) => write!(f, " [{wf}]")?,
            (None, Some(job)) => write!(f, " [{job}]")?,
            (None, None) => {}
        }
        write!(f, ": {}", self.message)
    }
}

pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Check every job and workflow of `config`.
///
/// Errors come first, in job then workflow order, followed by warnings.
pub fn validate_config(config: &ConfigFile) -> Vec<Diagnostic> {
    let mut diagnostics = vec![];

    for (name, job) in &config.jobs {
        if let Err(problem) = job.executor() {
            diagnostics.push(Diagnostic::error(format!("job has {problem}")).for_job(name));
        }
        for step in &job.steps {
            if let Step::Run(run) = step
                && let Err(reason) = run.no_output_timeout()
            {
                diagnostics.push(
                    Diagnostic::error(format!(
                        "step `{}` has an invalid no_output_timeout: {reason}",
                        run.display_name()
                    ))
                    .for_job(name),
                );
            }
        }
    }

    let mut used: HashSet<&str> = HashSet::new();
    for workflow in config.workflow_names() {
        let Ok(definition) = config.workflow(workflow) else {
            continue;
        };
        used.extend(definition.jobs.iter().map(|job| job.name.as_str()));

        match DagBuilder::new().build(workflow, definition, &config.jobs) {
            Ok(dag) => {
                check_cache_keys(&dag, &mut diagnostics);
                check_tag_filters(&dag, &mut diagnostics);
            }
            Err(e) => diagnostics.push(Diagnostic::error(e.to_string()).in_workflow(workflow)),
        }
    }

    for name in config.jobs.keys() {
        if !used.contains(name.as_str()) {
            diagnostics.push(Diagnostic::warning("job is not used by any workflow").for_job(name));
        }
    }

    diagnostics.sort_by_key(|d| d.severity != Severity::Error);
    diagnostics
}

fn check_cache_keys(dag: &WorkflowDag, diagnostics: &mut Vec<Diagnostic>) {
    for node in dag.jobs() {
        let upstream: Vec<&str> = dag
            .ancestors(&node.name)
            .into_iter()
            .flat_map(|ancestor| ancestor.definition.saved_cache_keys())
            .collect();
        let mut saved_here: Vec<&str> = vec![];

        for step in &node.definition.steps {
            match step {
                Step::SaveCache(save) => saved_here.push(&save.key),
                Step::RestoreCache(restore) => {
                    for key in &restore.keys {
                        let found = upstream
                            .iter()
                            .chain(saved_here.iter())
                            .any(|saved| saved.starts_with(key.as_str()));
                        if !found {
                            diagnostics.push(
                                Diagnostic::warning(format!(
                                    "restore_cache key `{key}` is not saved by this job or any job it requires"
                                ))
                                .in_workflow(dag.name())
                                .for_job(&node.name),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn check_tag_filters(dag: &WorkflowDag, diagnostics: &mut Vec<Diagnostic>) {
    for node in dag.jobs() {
        if !node.filter.has_tag_rule() {
            continue;
        }
        for requirement in dag.predecessors(&node.name) {
            if !requirement.filter.has_tag_rule() {
                diagnostics.push(
                    Diagnostic::warning(format!(
                        "job runs on tags but requires `{}`, which never runs on tags",
                        requirement.name
                    ))
                    .in_workflow(dag.name())
                    .for_job(&node.name),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn validate(yaml: &str) -> Vec<Diagnostic> {
        validate_config(&ConfigFile::from_yaml(yaml).unwrap())
    }

    #[test]
    fn test_clean_config() {
        let diagnostics = validate(
            r#"
version: 2
jobs:
  build:
    machine: true
    steps:
      - run: make
      - save_cache:
          key: deps-{{ .Revision }}
          paths: [vendor]
  test:
    machine: true
    steps:
      - restore_cache:
          keys:
            - deps-{{ .Revision }}
            - deps-
      - run: make test
workflows:
  version: 2
  main:
    jobs:
      - build
      - test:
          requires: [build]
"#,
        );
        assert_eq!(diagnostics, vec![]);
    }

    #[test]
    fn test_executor_and_timeout_errors() {
        let diagnostics = validate(
            r#"
jobs:
  build:
    steps:
      - run:
          command: make
          no_output_timeout: 10 minutes
workflows:
  main:
    jobs: [build]
"#,
        );
        assert!(has_errors(&diagnostics));
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics[0].message.contains("no executor"));
        assert!(diagnostics[1].message.contains("no_output_timeout"));
        assert_eq!(diagnostics[1].job.as_deref(), Some("build"));
    }

    #[test]
    fn test_graph_errors_reported_per_workflow() {
        let diagnostics = validate(
            r#"
jobs:
  build:
    machine: true
    steps: [checkout]
workflows:
  main:
    jobs:
      - build:
          requires: [lint]
"#,
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].workflow.as_deref(), Some("main"));
        assert_eq!(
            diagnostics[0].to_string(),
            "error [main]: Job `build` requires unknown job `lint`"
        );
    }

    #[test]
    fn test_unsaved_restore_key_and_unused_job() {
        let diagnostics = validate(
            r#"
jobs:
  build:
    machine: true
    steps:
      - restore_cache:
          key: images-{{ .Revision }}
  orphan:
    machine: true
    steps: [checkout]
workflows:
  main:
    jobs: [build]
"#,
        );
        assert!(!has_errors(&diagnostics));
        let messages: Vec<String> = diagnostics.iter().map(|d| d.to_string()).collect();
        assert_eq!(
            messages,
            vec![
                "warning [main/build]: restore_cache key `images-{{ .Revision }}` is not saved by this job or any job it requires",
                "warning [orphan]: job is not used by any workflow",
            ]
        );
    }

    #[test]
    fn test_tag_job_requiring_branch_only_job() {
        let diagnostics = validate(
            r#"
jobs:
  build:
    machine: true
    steps: [checkout]
  publish:
    machine: true
    steps: [checkout]
workflows:
  main:
    jobs:
      - build
      - publish:
          requires: [build]
          filters:
            tags:
              only: /^v.*/
"#,
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert!(diagnostics[0].message.contains("requires `build`"));
    }
}
