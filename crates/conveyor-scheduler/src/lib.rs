//! Workflow graph building, planning and scheduling for Conveyor.

pub mod dag;
pub mod filters;
pub mod plan;
pub mod queue;
pub mod scheduler;
pub mod validate;

pub use dag::{DagBuilder, DagNode, GraphError, WorkflowDag};
pub use filters::{JobFilter, Pattern};
pub use plan::{ExecutionPlan, PlannedJob, Planner};
pub use queue::ReadyQueue;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use validate::{Diagnostic, Severity, validate_config};
