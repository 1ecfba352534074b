//! Event bus for engine and fleet events.
//!
//! Provides an `EventBus` that distributes `EngineEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel. The bus is constructed
//! by the caller and handed to the orchestrator and dispatcher; there is no
//! process-wide instance.

pub mod bus;

pub use bus::{EventBus, Subscription};
