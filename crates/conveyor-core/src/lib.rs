//! Conveyor Core
//!
//! Core domain types, traits, and error handling for Conveyor.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: the declarative config model, trigger
//! events, run results, lifecycle events and the ports the scheduler
//! drives.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod run;
pub mod spans;
pub mod trigger;

pub use error::{Error, Result};
pub use ids::*;
