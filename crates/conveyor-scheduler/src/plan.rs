//! Planning: the subgraph of a workflow selected by one trigger event.

use crate::dag::WorkflowDag;
use conveyor_core::ports::JobSpec;
use conveyor_core::trigger::TriggerEvent;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A job selected for a run.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub name: String,
    /// Position in the workflow's job list.
    pub order: usize,
    pub requires: Vec<String>,
    /// Requirements excluded from the run, directly or through a selected
    /// requirement. A job with any can never run.
    pub missing_requirements: Vec<String>,
    pub spec: JobSpec,
}

impl PlannedJob {
    pub fn is_runnable(&self) -> bool {
        self.missing_requirements.is_empty()
    }
}

/// What a run of one workflow for one trigger will execute.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub workflow: String,
    pub trigger: TriggerEvent,
    /// Selected jobs in declaration order.
    pub jobs: Vec<PlannedJob>,
    /// Jobs whose filters exclude this trigger, in declaration order.
    pub filtered_out: Vec<String>,
}

impl ExecutionPlan {
    pub fn job(&self, name: &str) -> Option<&PlannedJob> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Selected jobs whose requirements are all selected.
    pub fn runnable(&self) -> impl Iterator<Item = &PlannedJob> {
        self.jobs.iter().filter(|job| job.is_runnable())
    }

    /// Selected jobs that require a job outside the plan.
    pub fn unsatisfiable(&self) -> impl Iterator<Item = &PlannedJob> {
        self.jobs.iter().filter(|job| !job.is_runnable())
    }

    /// Runnable jobs grouped into dispatch levels.
    pub fn levels(&self) -> Vec<Vec<&PlannedJob>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut pending: Vec<&PlannedJob> = self.runnable().collect();
        let mut levels: Vec<Vec<&PlannedJob>> = vec![];

        // Runnable jobs only require runnable jobs, so every pass places at least one.
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|&job| {
                let placed: Option<Vec<usize>> = job
                    .requires
                    .iter()
                    .map(|r| depth.get(r.as_str()).copied())
                    .collect();
                let Some(placed) = placed else {
                    return true;
                };
                let level = placed.into_iter().map(|d| d + 1).max().unwrap_or(0);
                depth.insert(job.name.as_str(), level);
                if levels.len() <= level {
                    levels.resize_with(level + 1, Vec::new);
                }
                levels[level].push(job);
                false
            });
            if pending.len() == before {
                break;
            }
        }

        for level in &mut levels {
            level.sort_by_key(|job| job.order);
        }
        levels
    }

    /// Every planned job that requires `name`, directly or transitively.
    pub fn dependents_of(&self, name: &str) -> Vec<&PlannedJob> {
        let mut reached: HashSet<&str> = HashSet::from([name]);
        let mut found: Vec<&PlannedJob> = vec![];

        // Declaration order is not topological under forward references, so
        // sweep until nothing changes.
        loop {
            let before = found.len();
            for job in &self.jobs {
                if !reached.contains(job.name.as_str())
                    && job.requires.iter().any(|r| reached.contains(r.as_str()))
                {
                    reached.insert(job.name.as_str());
                    found.push(job);
                }
            }
            if found.len() == before {
                break;
            }
        }

        found.sort_by_key(|job| job.order);
        found
    }
}

/// Builds execution plans from workflow DAGs.
pub struct Planner;

impl Planner {
    pub fn plan(dag: &WorkflowDag, trigger: &TriggerEvent) -> ExecutionPlan {
        let mut selected: HashMap<String, PlannedJob> = HashMap::new();
        let mut filtered_out: Vec<(usize, String)> = vec![];

        for node in dag.topological_order() {
            if !node.filter.matches(&trigger.git_ref) {
                debug!(job = %node.name, git_ref = %trigger.git_ref, "Job filtered out");
                filtered_out.push((node.order, node.name.clone()));
                continue;
            }

            let mut missing: Vec<String> = vec![];
            for requirement in &node.requires {
                match selected.get(requirement) {
                    Some(upstream) => missing.extend(upstream.missing_requirements.iter().cloned()),
                    None => missing.push(requirement.clone()),
                }
            }
            let mut seen = HashSet::new();
            missing.retain(|name| seen.insert(name.clone()));

            selected.insert(
                node.name.clone(),
                PlannedJob {
                    name: node.name.clone(),
                    order: node.order,
                    requires: node.requires.clone(),
                    missing_requirements: missing,
                    spec: JobSpec::new(node.name.clone(), node.definition.clone()),
                },
            );
        }

        let mut jobs: Vec<PlannedJob> = selected.into_values().collect();
        jobs.sort_by_key(|job| job.order);
        filtered_out.sort();

        ExecutionPlan {
            workflow: dag.name().to_string(),
            trigger: trigger.clone(),
            jobs,
            filtered_out: filtered_out.into_iter().map(|(_, name)| name).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagBuilder;
    use conveyor_core::config::{
        FilterRule, Filters, JobDefinition, Step, WorkflowDefinition, WorkflowJob,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn tags_all() -> Filters {
        Filters::default().tags(FilterRule::only(["/.*/"]))
    }

    fn release_only() -> Filters {
        Filters::default()
            .branches(FilterRule::ignore(["/.*/"]))
            .tags(FilterRule::only(["/^v.*/"]))
    }

    fn dag(jobs: Vec<WorkflowJob>) -> WorkflowDag {
        let defs: BTreeMap<String, JobDefinition> = jobs
            .iter()
            .map(|j| (j.name.clone(), JobDefinition::machine(vec![Step::run("true")])))
            .collect();
        DagBuilder::new()
            .build("main", &WorkflowDefinition { jobs }, &defs)
            .unwrap()
    }

    fn names<'a>(jobs: impl IntoIterator<Item = &'a PlannedJob>) -> Vec<&'a str> {
        jobs.into_iter().map(|j| j.name.as_str()).collect()
    }

    fn pipeline() -> WorkflowDag {
        dag(vec![
            WorkflowJob::new("build").filters(tags_all()),
            WorkflowJob::new("test").requires(["build"]).filters(tags_all()),
            WorkflowJob::new("lint"),
            WorkflowJob::new("publish")
                .requires(["test"])
                .filters(release_only()),
        ])
    }

    #[test]
    fn test_branch_push_excludes_release_job() {
        let plan = Planner::plan(&pipeline(), &TriggerEvent::branch_push("master", "abc"));
        assert_eq!(names(&plan.jobs), vec!["build", "test", "lint"]);
        assert_eq!(plan.filtered_out, vec!["publish"]);
        assert_eq!(plan.unsatisfiable().count(), 0);

        let levels: Vec<Vec<&str>> = plan.levels().into_iter().map(names).collect();
        assert_eq!(levels, vec![vec!["build", "lint"], vec!["test"]]);
    }

    #[test]
    fn test_release_tag_runs_tagged_jobs_only() {
        let plan = Planner::plan(&pipeline(), &TriggerEvent::tag_push("v1.2.0", "abc"));
        assert_eq!(names(&plan.jobs), vec!["build", "test", "publish"]);
        assert_eq!(plan.filtered_out, vec!["lint"]);
        assert_eq!(names(plan.runnable()), vec!["build", "test", "publish"]);
    }

    #[test]
    fn test_unmatched_tag_skips_release_job() {
        let plan = Planner::plan(&pipeline(), &TriggerEvent::tag_push("nightly", "abc"));
        assert_eq!(names(&plan.jobs), vec!["build", "test"]);
        assert_eq!(plan.filtered_out, vec!["lint", "publish"]);
    }

    #[test]
    fn test_missing_requirements_propagate() {
        // `deploy` runs on tags but `build` does not, so neither `test` nor
        // `deploy` can run.
        let dag = dag(vec![
            WorkflowJob::new("build"),
            WorkflowJob::new("test").requires(["build"]).filters(tags_all()),
            WorkflowJob::new("deploy").requires(["test"]).filters(tags_all()),
        ]);
        let plan = Planner::plan(&dag, &TriggerEvent::tag_push("v1", "abc"));

        assert_eq!(plan.filtered_out, vec!["build"]);
        assert_eq!(names(plan.unsatisfiable()), vec!["test", "deploy"]);
        assert_eq!(
            plan.job("deploy").unwrap().missing_requirements,
            vec!["build".to_string()]
        );
        assert!(plan.levels().is_empty());
    }

    #[test]
    fn test_empty_plan() {
        let dag = dag(vec![WorkflowJob::new("build")]);
        let plan = Planner::plan(&dag, &TriggerEvent::tag_push("v1", "abc"));
        assert!(plan.is_empty());
        assert_eq!(plan.filtered_out, vec!["build"]);
    }

    #[test]
    fn test_dependents_of() {
        let plan = Planner::plan(&pipeline(), &TriggerEvent::tag_push("v1", "abc"));
        assert_eq!(names(plan.dependents_of("build")), vec!["test", "publish"]);
        assert!(plan.dependents_of("publish").is_empty());
    }
}
