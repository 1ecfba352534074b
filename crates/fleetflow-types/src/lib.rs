//! Shared domain types for Fleetflow.
//!
//! This crate contains the types exchanged between the engine, the dispatcher,
//! worker agents and storage: the workflow document, run snapshots and
//! checkpoints, jobs, robots, engine events and the agent wire protocol.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod protocol;
pub mod robot;
pub mod run;
pub mod workflow;
