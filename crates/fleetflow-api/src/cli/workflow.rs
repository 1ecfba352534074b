//! `fleetflow workflow` subcommands (over HTTP).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use fleetflow_types::workflow::WorkflowRecord;

use crate::cli::client::ApiClient;
use crate::http::handlers::workflow::WorkflowSummary;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register a workflow file (JSON or YAML). Re-registering a name replaces it.
    Register {
        file: PathBuf,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Delete a registered workflow.
    #[command(alias = "rm")]
    Delete {
        id: Uuid,
    },
}

pub async fn handle_workflow_command(cmd: WorkflowCommand, client: &ApiClient, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Register { file } => register(&file, client, json).await,
        WorkflowCommand::List => list(client, json).await,
        WorkflowCommand::Delete { id } => delete(id, client, json).await,
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => "application/yaml",
        _ => "application/json",
    }
}

async fn register(file: &Path, client: &ApiClient, json: bool) -> Result<()> {
    let body = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let record: WorkflowRecord = client
        .post_raw("/workflows", body, content_type(file))
        .await
        .context("failed to register workflow")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "id": record.id,
                "name": record.name,
                "version": record.version,
                "fingerprint": record.fingerprint,
            }))?
        );
    } else {
        println!();
        println!(
            "  {} Registered workflow '{}' v{}",
            style("*").green().bold(),
            style(&record.name).cyan(),
            record.version
        );
        println!("  ID:    {}", record.id);
        println!("  Nodes: {}", record.document.nodes.len());
        println!();
    }
    Ok(())
}

async fn list(client: &ApiClient, json: bool) -> Result<()> {
    let workflows: Vec<WorkflowSummary> = client.get("/workflows").await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }
    if workflows.is_empty() {
        println!();
        println!("  {} No workflows registered.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Nodes"),
            Cell::new("ID"),
            Cell::new("Updated"),
        ]);
    for w in &workflows {
        table.add_row(vec![
            Cell::new(&w.name),
            Cell::new(&w.version),
            Cell::new(w.nodes),
            Cell::new(w.id),
            Cell::new(w.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn delete(id: Uuid, client: &ApiClient, json: bool) -> Result<()> {
    let _: serde_json::Value = client.delete(&format!("/workflows/{id}")).await?;
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("  {} Deleted workflow {id}", style("*").green().bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_files_are_sent_as_yaml() {
        assert_eq!(content_type(Path::new("flows/nightly.yml")), "application/yaml");
        assert_eq!(content_type(Path::new("nightly.yaml")), "application/yaml");
        assert_eq!(content_type(Path::new("nightly.json")), "application/json");
        assert_eq!(content_type(Path::new("nightly")), "application/json");
    }
}
