//! Repository traits for Fleetflow storage.
//!
//! Core defines the storage contracts; `fleetflow-infra` implements them on
//! SQLite. The [`memory`] module provides in-process implementations used by
//! local runs, worker agents and tests.

pub mod checkpoint;
pub mod job;
pub mod memory;
pub mod workflow;

pub use checkpoint::CheckpointRepository;
pub use job::JobRepository;
pub use workflow::WorkflowRepository;
