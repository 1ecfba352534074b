//! Request handlers, one module per resource.

pub mod health;
pub mod job;
pub mod robot;
pub mod workflow;
pub mod ws;
