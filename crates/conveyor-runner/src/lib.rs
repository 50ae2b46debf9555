//! Job and step execution for Conveyor.

pub mod artifacts;
pub mod checkout;
pub mod container;
pub mod job;
pub mod runner;
pub mod sandbox;
pub mod shell;

pub use container::ContainerRunner;
pub use job::{JobRunner, RunnerPaths};
pub use runner::{OutputLine, StepContext, StepResult, StepRunner};
pub use sandbox::Sandbox;
pub use shell::ShellRunner;
