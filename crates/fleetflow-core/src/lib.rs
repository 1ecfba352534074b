//! Business logic for Fleetflow.
//!
//! - [`workflow`]: graph model, execution context and the orchestrator state machine.
//! - [`action`]: the action-unit interface, middleware and built-in actions.
//! - [`fleet`]: job queue, fleet dispatcher, health monitor and worker agent.
//! - [`repository`]: storage traits implemented by `fleetflow-infra`, plus in-memory versions.
//! - [`event`]: broadcast bus for engine events.

pub mod action;
pub mod event;
pub mod fleet;
pub mod repository;
pub mod workflow;
