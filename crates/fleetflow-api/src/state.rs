//! Application state wiring the dispatcher to its storage.
//!
//! The dispatcher is generic over repository traits; AppState pins it to
//! the SQLite implementations and shares it between HTTP handlers, the
//! agent WebSocket endpoint and the health monitor.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetflow_core::action::ActionRegistry;
use fleetflow_core::event::bus::EventBus;
use fleetflow_core::fleet::{FleetDispatcher, HealthMonitor};
use fleetflow_infra::sqlite::{
    DatabasePool, SqliteCheckpointRepository, SqliteJobRepository, SqliteWorkflowRepository,
};
use fleetflow_types::config::FleetConfig;

/// Broadcast capacity of the event stream.
const EVENT_BUFFER: usize = 1024;

/// Concrete type aliases for the generics pinned to infra implementations.
pub type ConcreteDispatcher =
    FleetDispatcher<SqliteJobRepository, SqliteWorkflowRepository, SqliteCheckpointRepository>;

pub type ConcreteHealthMonitor =
    HealthMonitor<SqliteJobRepository, SqliteWorkflowRepository, SqliteCheckpointRepository>;

/// Shared state of the `serve` process.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ConcreteDispatcher>,
    pub db_pool: DatabasePool,
    pub config: Arc<FleetConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Open the database under `data_dir`, wire the dispatcher and reload
    /// the jobs left unfinished by the previous process.
    pub async fn init(data_dir: &Path, config: FleetConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_pool = DatabasePool::open(data_dir, &config.storage).await?;

        let dispatcher = Arc::new(FleetDispatcher::new(
            SqliteJobRepository::new(db_pool.clone()),
            SqliteWorkflowRepository::new(db_pool.clone()),
            SqliteCheckpointRepository::new(db_pool.clone()),
            Arc::new(ActionRegistry::with_builtins()),
            EventBus::new(EVENT_BUFFER),
            &config,
        ));
        let recovered = dispatcher.recover().await?;
        if recovered > 0 {
            tracing::info!(jobs = recovered, "recovered unfinished jobs");
        }

        Ok(Self {
            dispatcher,
            db_pool,
            config: Arc::new(config),
            started_at: Utc::now(),
        })
    }

    pub fn health_monitor(&self) -> ConcreteHealthMonitor {
        HealthMonitor::new(Arc::clone(&self.dispatcher), self.config.health.clone())
    }
}
