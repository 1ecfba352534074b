//! Local workflow commands: `validate`, `run` and `resume`.
//!
//! Runs execute in-process. Checkpoints go to the SQLite database in the
//! data directory, so a run interrupted by killing the process can be
//! picked up again with `fleetflow resume <run_id> <file>`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleetflow_core::action::ActionRegistry;
use fleetflow_core::event::bus::{EventBus, Subscription};
use fleetflow_core::workflow::WorkflowGraph;
use fleetflow_core::workflow::definition::load_workflow_file;
use fleetflow_core::workflow::orchestrator::{ExecutionError, Orchestrator, RunOutcome};
use fleetflow_infra::sqlite::{DatabasePool, SqliteCheckpointRepository};
use fleetflow_types::config::FleetConfig;
use fleetflow_types::event::EventPayload;
use fleetflow_types::run::RunStatus;

const EVENT_BUFFER: usize = 1024;

fn load_graph(file: &Path) -> Result<WorkflowGraph> {
    let document = load_workflow_file(file)
        .with_context(|| format!("failed to load {}", file.display()))?;
    let registry = ActionRegistry::with_builtins();
    WorkflowGraph::load(document, &registry)
        .with_context(|| format!("{} is not a valid workflow", file.display()))
}

/// `fleetflow validate <file>`
pub async fn validate(file: &Path, json: bool) -> Result<()> {
    let graph = match load_graph(file) {
        Ok(graph) => graph,
        Err(err) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "valid": false, "error": format!("{err:#}") })
                );
            }
            return Err(err);
        }
    };
    let document = graph.document();

    if json {
        let report = serde_json::json!({
            "valid": true,
            "name": document.metadata.name,
            "version": document.metadata.version,
            "nodes": document.nodes.len(),
            "connections": document.connections.len(),
            "entry": graph.entry(),
            "fingerprint": graph.fingerprint(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!(
            "  {} '{}' v{} is valid",
            style("✓").green().bold(),
            style(&document.metadata.name).cyan(),
            document.metadata.version
        );
        println!(
            "  {} nodes, {} connections, entry: {}",
            document.nodes.len(),
            document.connections.len(),
            graph.entry().join(", ")
        );
        println!("  Fingerprint: {}", style(graph.fingerprint()).dim());
        println!();
    }
    Ok(())
}

async fn local_orchestrator(
    data_dir: &Path,
    config: &FleetConfig,
) -> Result<Orchestrator<SqliteCheckpointRepository>> {
    tokio::fs::create_dir_all(data_dir).await?;
    let pool = DatabasePool::open(data_dir, &config.storage)
        .await
        .context("failed to open the local database")?;
    Ok(Orchestrator::new(
        SqliteCheckpointRepository::new(pool),
        EventBus::new(EVENT_BUFFER),
        config.orchestrator.clone(),
    ))
}

/// `fleetflow run <file> [--var k=v]`
pub async fn run(
    file: &Path,
    variables: Map<String, Value>,
    data_dir: &Path,
    config: &FleetConfig,
    json: bool,
) -> Result<()> {
    let graph = Arc::new(load_graph(file)?);
    let orchestrator = local_orchestrator(data_dir, config).await?;
    let run_id = Uuid::now_v7();
    if !json {
        println!();
        println!(
            "  {} Running '{}' as {}",
            style("▶").cyan().bold(),
            graph.name(),
            style(run_id).dim()
        );
    }
    let progress = spawn_progress(orchestrator.events().subscribe_to(None), json);
    let outcome = orchestrator
        .execute(graph, run_id, variables, CancellationToken::new())
        .await;
    finish(orchestrator, progress, outcome, json).await
}

/// `fleetflow resume <run_id> <file>`
pub async fn resume(
    run_id: Uuid,
    file: &Path,
    data_dir: &Path,
    config: &FleetConfig,
    json: bool,
) -> Result<()> {
    let graph = Arc::new(load_graph(file)?);
    let orchestrator = local_orchestrator(data_dir, config).await?;
    if !json {
        println!();
        println!(
            "  {} Resuming {} of '{}'",
            style("▶").cyan().bold(),
            style(run_id).dim(),
            graph.name()
        );
    }
    let progress = spawn_progress(orchestrator.events().subscribe_to(None), json);
    let outcome = orchestrator.resume(graph, run_id, CancellationToken::new()).await;
    finish(orchestrator, progress, outcome, json).await
}

/// Print node events as they happen (styled mode only).
fn spawn_progress(mut events: Subscription, silent: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if silent {
                continue;
            }
            match event.payload {
                EventPayload::NodeCompleted {
                    node_id, duration_ms, ..
                } => println!("    {} {node_id} {}", style("✓").green(), style(format!("{duration_ms}ms")).dim()),
                EventPayload::NodeSkipped { node_id, .. } => {
                    println!("    {} {node_id} {}", style("-").dim(), style("skipped").dim())
                }
                EventPayload::NodeError {
                    node_id,
                    error_type,
                    message,
                    will_retry,
                    ..
                } => {
                    let retry = if will_retry { " (retrying)" } else { "" };
                    println!("    {} {node_id}: {error_type}: {message}{retry}", style("✗").red());
                }
                _ => {}
            }
        }
    })
}

async fn finish(
    orchestrator: Orchestrator<SqliteCheckpointRepository>,
    progress: JoinHandle<()>,
    outcome: Result<RunOutcome, ExecutionError>,
    json: bool,
) -> Result<()> {
    // Dropping the orchestrator closes the bus, which ends the printer.
    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_secs(1), progress).await;
    let outcome = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.to_result_json())?);
    } else {
        let status = match outcome.status {
            RunStatus::Success => style(outcome.status.to_string()).green().bold(),
            _ => style(outcome.status.to_string()).red().bold(),
        };
        println!();
        println!("  Run {} {status} in {}ms", outcome.run_id, outcome.duration_ms);
        for err in &outcome.errors {
            println!(
                "  {} {} at '{}': {}",
                style("!").red().bold(),
                err.error_type,
                err.node_id,
                err.message
            );
        }
        if !outcome.variables.is_empty() {
            println!("  Variables:");
            for (name, value) in &outcome.variables {
                println!("    {name} = {value}");
            }
        }
        println!();
    }

    if outcome.status != RunStatus::Success {
        bail!("run {} finished with status {}", outcome.run_id, outcome.status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
metadata:
  name: counter
variables:
  total: 0
nodes:
  start: {node_id: start, node_type: Start}
  bump: {node_id: bump, node_type: Increment, config: {name: total, by: 2}}
connections:
  - {source_node: start, source_port: exec_out, target_node: bump, target_port: exec_in}
"#;

    #[tokio::test]
    async fn validate_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("counter.yaml");
        std::fs::write(&good, COUNTER).unwrap();
        validate(&good, true).await.unwrap();

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"metadata": {"name": "x"}, "nodes": {}}"#).unwrap();
        assert!(validate(&bad, true).await.is_err());
        assert!(validate(&dir.path().join("missing.json"), true).await.is_err());
    }

    #[tokio::test]
    async fn run_executes_locally_and_cleans_up_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("counter.yaml");
        std::fs::write(&file, COUNTER).unwrap();
        let data_dir = dir.path().join("data");

        let mut vars = Map::new();
        vars.insert("total".into(), serde_json::json!(5));
        run(&file, vars, &data_dir, &FleetConfig::default(), true).await.unwrap();
        assert!(data_dir.join("fleetflow.db").exists());

        // A finished run leaves nothing to resume.
        let err = resume(Uuid::now_v7(), &file, &data_dir, &FleetConfig::default(), true)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ExecutionError>().is_some());
    }
}
