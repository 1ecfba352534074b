//! Configuration loader for Fleetflow.
//!
//! Reads `config.toml` from the data directory (`~/.fleetflow/` unless
//! `FLEETFLOW_DATA_DIR` says otherwise) into [`FleetConfig`]. Falls back to
//! defaults when the file is missing or malformed, so a broken config never
//! prevents startup.

use std::path::{Path, PathBuf};

use fleetflow_types::config::FleetConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "FLEETFLOW_DATA_DIR";

/// Resolve the data directory: `FLEETFLOW_DATA_DIR`, else `~/.fleetflow`,
/// else `./.fleetflow` when no home directory is known.
pub fn data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".fleetflow"),
    }
}

/// Create the data directory if needed and return it.
pub async fn ensure_data_dir(dir: &Path) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(dir.to_path_buf())
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`FleetConfig::default()`].
/// - Unreadable or unparsable file: a warning and the default.
pub async fn load_config(data_dir: &Path) -> FleetConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml, using defaults");
            return FleetConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return FleetConfig::default();
        }
    };

    match toml::from_str::<FleetConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            FleetConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetflow_types::workflow::CheckpointPolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.server.port, 7420);
        assert_eq!(config.dispatcher.ack_timeout_secs, 10);
        assert_eq!(config.health.missed_heartbeats, 3);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[server]
port = 9000

[dispatcher]
max_queue_size = 50

[orchestrator]
checkpoint_policy = "boundaries"

[agent]
capabilities = ["browser", "desktop"]
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.dispatcher.max_queue_size, 50);
        assert_eq!(config.dispatcher.max_requeues, 3);
        assert_eq!(config.orchestrator.checkpoint_policy, CheckpointPolicy::Boundaries);
        assert_eq!(config.agent.capabilities, vec!["browser", "desktop"]);
    }

    #[tokio::test]
    async fn invalid_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.server.port, 7420);
    }

    #[tokio::test]
    async fn ensure_data_dir_creates_nested_dirs() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = ensure_data_dir(&nested).await.unwrap();
        assert!(dir.is_dir());
    }
}
