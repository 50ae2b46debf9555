//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Config errors
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step produced no output for {seconds}s")]
    StepTimeout { seconds: u64 },

    // Sandbox errors
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Container error: {0}")]
    Container(String),

    // Cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid cache key template: {0}")]
    Template(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}
