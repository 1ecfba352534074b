//! `fleetflow job` subcommands (over HTTP).

use std::collections::BTreeSet;

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use fleetflow_types::job::{Job, JobPriority, JobStatus, JobSubmission, default_environment};

use crate::cli::client::ApiClient;
use crate::cli::{parse_var, vars_to_map};

#[derive(Subcommand)]
pub enum JobCommand {
    /// Queue a registered workflow for execution on the fleet.
    Submit {
        /// Workflow id or name.
        workflow: String,

        /// low, normal, high or critical.
        #[arg(long, default_value = "normal")]
        priority: JobPriority,

        /// Capability the robot must offer; repeatable.
        #[arg(long = "capability", short = 'c')]
        capabilities: Vec<String>,

        #[arg(long)]
        environment: Option<String>,

        /// Only run on this robot.
        #[arg(long)]
        robot: Option<String>,

        /// Seconds from submission after which the job times out.
        #[arg(long)]
        timeout: Option<u64>,

        /// Initial variable, `name=value`.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Show one job.
    Status {
        id: Uuid,
    },

    /// List recent jobs, newest first.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Cancel a job that has not finished.
    Cancel {
        id: Uuid,
    },
}

pub async fn handle_job_command(cmd: JobCommand, client: &ApiClient, json: bool) -> Result<()> {
    match cmd {
        JobCommand::Submit {
            workflow,
            priority,
            capabilities,
            environment,
            robot,
            timeout,
            vars,
        } => {
            let submission = JobSubmission {
                workflow_id: workflow,
                priority,
                required_capabilities: capabilities.into_iter().collect::<BTreeSet<_>>(),
                environment: environment.unwrap_or_else(default_environment),
                target_robot_id: robot,
                timeout_secs: timeout,
                variables: vars_to_map(vars),
            };
            let job: Job = client.post("/jobs", &submission).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                println!();
                println!(
                    "  {} Submitted job {} for '{}'",
                    style("*").green().bold(),
                    style(job.id).cyan(),
                    job.workflow_name
                );
                println!("  Status: {}", status_text(job.status));
                println!();
            }
            Ok(())
        }
        JobCommand::Status { id } => {
            let job: Job = client.get(&format!("/jobs/{id}")).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
            Ok(())
        }
        JobCommand::List { status, limit } => {
            let mut path = format!("/jobs?limit={limit}");
            if let Some(status) = status {
                path.push_str(&format!("&status={}", status.as_str()));
            }
            let jobs: Vec<Job> = client.get(&path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_job_table(&jobs);
            }
            Ok(())
        }
        JobCommand::Cancel { id } => {
            let job: Job = client.post(&format!("/jobs/{id}/cancel"), &serde_json::json!({})).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                println!("  {} Job {id} is now {}", style("*").green().bold(), status_text(job.status));
            }
            Ok(())
        }
    }
}

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Queued => Color::Blue,
        JobStatus::Assigned | JobStatus::Running => Color::Yellow,
        JobStatus::Succeeded => Color::Green,
        JobStatus::Failed | JobStatus::TimedOut => Color::Red,
        JobStatus::Cancelled => Color::DarkGrey,
    }
}

fn status_text(status: JobStatus) -> console::StyledObject<&'static str> {
    let text = style(status.as_str());
    match status {
        JobStatus::Succeeded => text.green(),
        JobStatus::Failed | JobStatus::TimedOut => text.red(),
        JobStatus::Queued => text.blue(),
        JobStatus::Cancelled => text.dim(),
        JobStatus::Assigned | JobStatus::Running => text.yellow(),
    }
}

fn print_job(job: &Job) {
    let when = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    println!();
    println!("  {} {}", style("Job").bold(), style(job.id).cyan());
    println!("  Workflow:  {} ({})", job.workflow_name, job.workflow_id);
    println!("  Status:    {}", status_text(job.status));
    println!("  Priority:  {}", job.priority.as_str());
    println!("  Robot:     {}", job.assigned_robot_id.as_deref().unwrap_or("-"));
    if job.requeue_count > 0 {
        println!("  Requeued:  {} time(s)", job.requeue_count);
    }
    println!("  Submitted: {}", when(Some(job.submitted_at)));
    println!("  Started:   {}", when(job.started_at));
    println!("  Finished:  {}", when(job.completed_at));
    if let Some(error) = &job.error {
        println!("  Error:     {}", style(error).red());
    }
    if let Some(result) = &job.result {
        if let Some(vars) = result.get("variables").and_then(Value::as_object) {
            println!("  Variables:");
            for (name, value) in vars {
                println!("    {name} = {value}");
            }
        }
    }
    println!();
}

fn print_job_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!();
        println!("  {} No jobs.", style("i").blue().bold());
        println!();
        return;
    }
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Job ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Priority"),
            Cell::new("Status"),
            Cell::new("Robot"),
            Cell::new("Submitted"),
        ]);
    for job in jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.workflow_name),
            Cell::new(job.priority.as_str()),
            Cell::new(job.status.as_str()).fg(status_color(job.status)),
            Cell::new(job.assigned_robot_id.as_deref().unwrap_or("-")),
            Cell::new(job.submitted_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!("{table}");
}
