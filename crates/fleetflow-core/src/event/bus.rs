//! Broadcast bus carrying `EngineEvent`s from the orchestrator and the
//! dispatcher to dashboards, the CLI progress printer and agent forwarders.
//!
//! Publishing never blocks and never fails: with no subscribers the event is
//! dropped. Slow subscribers lose the oldest events instead of stalling a run.

use fleetflow_types::event::{EngineEvent, EventPayload};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default capacity used by `EventBus::default`.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Cheaply cloneable handle to one broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Raw receiver for every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Receiver that only yields events about `subject` (a job or run id),
    /// or every event when `subject` is `None`.
    pub fn subscribe_to(&self, subject: Option<Uuid>) -> Subscription {
        Subscription {
            rx: self.sender.subscribe(),
            subject,
            missed: 0,
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Stamp `payload` with the current time and publish it.
    pub fn emit(&self, payload: EventPayload) {
        self.publish(EngineEvent::now(payload));
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Filtered, lag-tolerant view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<EngineEvent>,
    subject: Option<Uuid>,
    missed: u64,
}

impl Subscription {
    /// Next matching event, or `None` once every bus handle is dropped.
    ///
    /// Lag is absorbed: skipped events are counted in `missed` and logged.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn matches(&self, event: &EngineEvent) -> bool {
        match self.subject {
            Some(subject) => event.payload.subject_id() == Some(subject),
            None => true,
        }
    }
}
