//! Distributed job dispatch: queue, dispatcher, health monitor and the
//! worker agent that runs jobs on robots.

pub mod agent;
pub mod dispatcher;
pub mod health;
pub mod queue;

pub use agent::{AgentError, RemoteCheckpointStore, WorkerAgent};
pub use dispatcher::{AGENT_LOST_ERROR, DispatchError, FleetDispatcher, RobotLink, robot_matches};
pub use health::{HealthMonitor, SweepReport};
pub use queue::{JobQueue, QueueError};
