//! HTTP/REST API layer for Fleetflow.
//!
//! Axum-based REST API at `/api/v1/` with an envelope response format,
//! plus the WebSocket endpoints agents and event consumers connect to.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
