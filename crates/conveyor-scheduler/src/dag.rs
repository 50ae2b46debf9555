//! DAG resolution for workflow jobs.

use crate::filters::JobFilter;
use conveyor_core::config::{ConfigFile, JobDefinition, WorkflowDefinition};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Workflow `{0}` has no jobs")]
    EmptyWorkflow(String),
    #[error("Job `{0}` is listed more than once")]
    DuplicateJob(String),
    #[error("Job `{0}` is not defined under `jobs`")]
    UndefinedJob(String),
    #[error("Job `{job}` requires unknown job `{requires}`")]
    UnknownJob { job: String, requires: String },
    #[error("Cycle detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
    #[error("Job `{job}` requires `{requires}`, which is declared after it")]
    ForwardReference { job: String, requires: String },
    #[error("Job `{job}` has an invalid filter pattern `{pattern}`: {reason}")]
    InvalidPattern {
        job: String,
        pattern: String,
        reason: String,
    },
}

impl From<GraphError> for conveyor_core::Error {
    fn from(err: GraphError) -> Self {
        conveyor_core::Error::InvalidWorkflow(err.to_string())
    }
}

/// A job in the workflow DAG.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub name: String,
    /// Position in the workflow's job list.
    pub order: usize,
    pub requires: Vec<String>,
    pub definition: JobDefinition,
    pub filter: JobFilter,
}

/// Directed acyclic graph of one workflow's jobs.
///
/// Edges point from a requirement to the job requiring it. Nodes are
/// inserted in declaration order, so node indices follow that order.
#[derive(Debug)]
pub struct WorkflowDag {
    name: String,
    graph: DiGraph<DagNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn job(&self, name: &str) -> Option<&DagNode> {
        self.name_to_index
            .get(name)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    /// All jobs in declaration order.
    pub fn jobs(&self) -> Vec<&DagNode> {
        self.graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Jobs with no requirements.
    pub fn roots(&self) -> Vec<&DagNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Jobs that directly require `name`.
    pub fn successors(&self, name: &str) -> Vec<&DagNode> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Jobs `name` directly requires.
    pub fn predecessors(&self, name: &str) -> Vec<&DagNode> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Every job that requires `name`, directly or transitively, in declaration order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&DagNode> {
        let Some(&start) = self.name_to_index.get(name) else {
            return vec![];
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let reached = std::iter::from_fn(|| bfs.next(&self.graph)).collect::<Vec<_>>();
        self.in_declaration_order(reached, start)
    }

    /// Every job `name` requires, directly or transitively, in declaration order.
    pub fn ancestors(&self, name: &str) -> Vec<&DagNode> {
        let Some(&start) = self.name_to_index.get(name) else {
            return vec![];
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let reached = std::iter::from_fn(|| bfs.next(reversed)).collect::<Vec<_>>();
        self.in_declaration_order(reached, start)
    }

    /// Dispatch levels: each job sits one level below its deepest requirement.
    pub fn levels(&self) -> Vec<Vec<&DagNode>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut levels: Vec<Vec<&DagNode>> = vec![];

        for idx in self.topological_indices() {
            let level = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|pred| depth.get(&pred))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(idx, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].extend(self.graph.node_weight(idx));
        }

        for level in &mut levels {
            level.sort_by_key(|node| node.order);
        }
        levels
    }

    /// Jobs in an order where every job follows its requirements.
    ///
    /// Ties keep declaration order.
    pub fn topological_order(&self) -> Vec<&DagNode> {
        self.topological_indices()
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Check if a job is ready to run given the set of succeeded jobs.
    pub fn is_ready(&self, name: &str, succeeded: &HashSet<String>) -> bool {
        self.predecessors(name)
            .iter()
            .all(|pred| succeeded.contains(&pred.name))
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&DagNode> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                let mut nodes: Vec<&DagNode> = self
                    .graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect();
                nodes.sort_by_key(|node| node.order);
                nodes
            })
            .unwrap_or_default()
    }

    fn in_declaration_order(&self, mut reached: Vec<NodeIndex>, start: NodeIndex) -> Vec<&DagNode> {
        reached.retain(|&idx| idx != start);
        reached.sort();
        reached
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    // Kahn's algorithm, always taking the earliest declared ready job.
    fn topological_indices(&self) -> Vec<NodeIndex> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let incoming = self.graph.neighbors_directed(idx, Direction::Incoming).count();
                (idx, incoming)
            })
            .collect();
        let mut ready: std::collections::BTreeSet<NodeIndex> = remaining
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&idx, _)| idx)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(count) = remaining.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(next);
                    }
                }
            }
        }
        order
    }
}

/// Builder for constructing workflow DAGs.
#[derive(Debug, Default, Clone)]
pub struct DagBuilder {
    allow_forward_references: bool,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `requires` entries naming jobs declared later in the workflow.
    pub fn allow_forward_references(mut self) -> Self {
        self.allow_forward_references = true;
        self
    }

    /// Build the DAG of a named workflow in `config`.
    pub fn build_from_config(
        &self,
        config: &ConfigFile,
        workflow: &str,
    ) -> conveyor_core::Result<WorkflowDag> {
        let definition = config.workflow(workflow)?;
        Ok(self.build(workflow, definition, &config.jobs)?)
    }

    /// Build a DAG from a workflow definition and the config's job table.
    pub fn build(
        &self,
        name: &str,
        workflow: &WorkflowDefinition,
        jobs: &BTreeMap<String, JobDefinition>,
    ) -> Result<WorkflowDag, GraphError> {
        if workflow.jobs.is_empty() {
            return Err(GraphError::EmptyWorkflow(name.to_string()));
        }

        let mut seen = HashSet::new();
        for job in &workflow.jobs {
            if !seen.insert(job.name.as_str()) {
                return Err(GraphError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &workflow.jobs {
            if !jobs.contains_key(&job.name) {
                return Err(GraphError::UndefinedJob(job.name.clone()));
            }
        }

        for job in &workflow.jobs {
            if let Some(unknown) = job.requires.iter().find(|r| !seen.contains(r.as_str())) {
                return Err(GraphError::UnknownJob {
                    job: job.name.clone(),
                    requires: unknown.clone(),
                });
            }
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for (order, job) in workflow.jobs.iter().enumerate() {
            let node = DagNode {
                name: job.name.clone(),
                order,
                requires: job.requires.clone(),
                definition: jobs[&job.name].clone(),
                filter: JobFilter::default(),
            };
            let idx = graph.add_node(node);
            name_to_index.insert(job.name.clone(), idx);
        }

        for job in &workflow.jobs {
            let job_idx = name_to_index[&job.name];
            for requirement in &job.requires {
                graph.update_edge(name_to_index[requirement], job_idx, ());
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(GraphError::Cycle { cycle });
        }

        if !self.allow_forward_references {
            for job in &workflow.jobs {
                let order = graph[name_to_index[&job.name]].order;
                if let Some(later) = job
                    .requires
                    .iter()
                    .find(|r| graph[name_to_index[r.as_str()]].order > order)
                {
                    return Err(GraphError::ForwardReference {
                        job: job.name.clone(),
                        requires: later.clone(),
                    });
                }
            }
        }

        for job in &workflow.jobs {
            let filter = JobFilter::compile(job.filters.as_ref()).map_err(|e| {
                GraphError::InvalidPattern {
                    job: job.name.clone(),
                    pattern: e.pattern,
                    reason: e.reason,
                }
            })?;
            graph[name_to_index[&job.name]].filter = filter;
        }

        Ok(WorkflowDag {
            name: name.to_string(),
            graph,
            name_to_index,
        })
    }
}

/// Find a cycle following `requires` edges, reported as a closed path
/// `a -> b -> a`. Starts from the earliest declared job.
fn find_cycle(graph: &DiGraph<DagNode, ()>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    fn visit(
        graph: &DiGraph<DagNode, ()>,
        idx: NodeIndex,
        marks: &mut [Mark],
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        marks[idx.index()] = Mark::OnPath;
        path.push(idx);

        let mut requirements: Vec<NodeIndex> =
            graph.neighbors_directed(idx, Direction::Incoming).collect();
        requirements.sort();

        for next in requirements {
            match marks[next.index()] {
                Mark::OnPath => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|&p| graph[p].name.clone()).collect();
                    cycle.push(graph[next].name.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(graph, next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[idx.index()] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut path = Vec::new();
    for idx in graph.node_indices() {
        if marks[idx.index()] == Mark::Unvisited
            && let Some(cycle) = visit(graph, idx, &mut marks, &mut path)
        {
            return Some(cycle);
        }
    }
    None
}
