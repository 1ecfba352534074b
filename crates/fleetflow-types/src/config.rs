//! Global configuration types for Fleetflow.
//!
//! `FleetConfig` represents the top-level `config.toml` that tunes the
//! dispatcher, health monitor, orchestrator and agent.

use serde::{Deserialize, Serialize};

use crate::workflow::CheckpointPolicy;

/// Top-level configuration.
///
/// Loaded from `~/.fleetflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Seconds a robot has to acknowledge an assignment.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Reject submissions no registered robot could ever run.
    #[serde(default = "default_true")]
    pub require_capable_robot: bool,
    /// Requeues allowed after losing the robot mid-run.
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    /// Consecutive ack failures before a robot's circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_ack_timeout_secs(),
            max_queue_size: default_max_queue_size(),
            require_capable_robot: true,
            max_requeues: default_max_requeues(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_max_requeues() -> u32 {
    3
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed heartbeats before a robot goes Offline.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeats: default_missed_heartbeats(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_missed_heartbeats() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_node_timeout_secs")]
    pub default_node_timeout_secs: u64,
    #[serde(default = "default_max_while_iterations")]
    pub max_while_iterations: u64,
    #[serde(default = "default_max_for_iterations")]
    pub max_for_iterations: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_secs: default_node_timeout_secs(),
            max_while_iterations: default_max_while_iterations(),
            max_for_iterations: default_max_for_iterations(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            checkpoint_policy: CheckpointPolicy::default(),
        }
    }
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_max_while_iterations() -> u64 {
    10_000
}

fn default_max_for_iterations() -> u64 {
    100_000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_retry_backoff_ms() -> u64 {
    30_000
}

/// Worker agent settings (overridable from the `agent` subcommand).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "crate::job::default_environment")]
    pub environment: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Seconds to wait for a `checkpoint_ack` before failing the run.
    #[serde(default = "default_checkpoint_ack_timeout_secs")]
    pub checkpoint_ack_timeout_secs: u64,
    /// Seconds between reconnect attempts.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            robot_id: None,
            name: String::new(),
            capabilities: Vec::new(),
            environment: crate::job::default_environment(),
            tags: Vec::new(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            checkpoint_ack_timeout_secs: default_checkpoint_ack_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// SQLite connection tuning for the dispatcher and local runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Read-only connections opened next to the single writer.
    #[serde(default = "default_max_readers")]
    pub max_readers: u32,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_readers: default_max_readers(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

fn default_max_readers() -> u32 {
    8
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_server_url() -> String {
    "ws://127.0.0.1:7420/ws/agent".to_string()
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

fn default_checkpoint_ack_timeout_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}
