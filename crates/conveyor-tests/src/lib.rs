//! Integration test infrastructure for Conveyor.
//!
//! Fixtures load the videofront pipeline and small synthetic configs, and
//! helpers provide a recording [`JobExecutor`](conveyor_core::ports::JobExecutor)
//! plus a sandboxed [`JobRunner`](conveyor_runner::JobRunner) on temporary
//! directories.
//!
//! # Usage
//!
//! ```ignore
//! use conveyor_tests::{RecordingExecutor, fixtures};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let config = fixtures::videofront();
//!     let executor = std::sync::Arc::new(RecordingExecutor::new());
//!     // Build a plan and run it with Scheduler::new(executor.clone())
//! }
//! ```

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,conveyor_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
