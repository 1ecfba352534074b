//! Infrastructure layer for Fleetflow.
//!
//! Contains implementations of the repository traits defined in `fleetflow-core`
//! (SQLite with a split reader/writer pool), configuration loading, data
//! directory resolution, and the agent-side WebSocket transport.

pub mod config;
pub mod sqlite;
pub mod transport;
