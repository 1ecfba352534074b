//! CLI command definitions for the `fleetflow` binary.
//!
//! Uses clap derive macros. `serve` and `agent` start long-running
//! processes; `validate`, `run` and `resume` work on local files; the
//! `workflow`, `job` and `robots` commands talk to a running server over
//! HTTP.

pub mod client;
pub mod job;
pub mod local;
pub mod robot;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Run workflows locally or across a fleet of robots.
#[derive(Parser)]
#[command(name = "fleetflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory holding config.toml and the database.
    #[arg(long, global = true, env = "FLEETFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Base URL of a running `fleetflow serve`.
    #[arg(
        long,
        global = true,
        env = "FLEETFLOW_SERVER",
        default_value = "http://127.0.0.1:7420"
    )]
    pub server: String,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Log directives used when `RUST_LOG` is unset. Long-running commands
    /// log at `info` by default; one-shot commands stay quiet.
    pub fn log_directives(&self) -> &'static str {
        let daemon = matches!(self.command, Commands::Serve { .. } | Commands::Agent(_));
        match self.verbose {
            0 if self.quiet => "error",
            0 if daemon => "info",
            0 => "warn",
            1 => "info,fleetflow_core=debug,fleetflow_infra=debug,fleetflow_api=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the dispatcher: HTTP API, agent endpoint and health monitor.
    Serve {
        /// Bind address (overrides config).
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config).
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a worker agent connected to a dispatcher.
    Agent(AgentArgs),

    /// Validate a workflow file (JSON or YAML).
    Validate {
        file: PathBuf,
    },

    /// Execute a workflow file locally.
    Run {
        file: PathBuf,

        /// Initial variable, `name=value`; values parse as JSON when they can.
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Resume a local run from its latest checkpoint.
    Resume {
        run_id: Uuid,
        file: PathBuf,
    },

    /// Manage registered workflows.
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Submit and inspect jobs.
    Job {
        #[command(subcommand)]
        action: job::JobCommand,
    },

    /// List robots known to the dispatcher.
    Robots,

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

#[derive(clap::Args)]
pub struct AgentArgs {
    /// Dispatcher WebSocket URL, e.g. `ws://host:7420/ws/agent`.
    #[arg(long, env = "FLEETFLOW_AGENT_URL")]
    pub url: Option<String>,

    /// Stable robot id (reused across reconnects).
    #[arg(long)]
    pub robot_id: Option<String>,

    #[arg(long)]
    pub name: Option<String>,

    /// Capability this robot offers; repeatable.
    #[arg(long = "capability", short = 'c')]
    pub capabilities: Vec<String>,

    #[arg(long)]
    pub environment: Option<String>,

    /// Free-form tag; repeatable.
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Jobs this robot runs at once.
    #[arg(long)]
    pub max_jobs: Option<u32>,
}

/// Parse `name=value`. The value is JSON if it parses as JSON, else a string.
pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

pub fn vars_to_map(vars: Vec<(String, Value)>) -> Map<String, Value> {
    vars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn var_values_prefer_json() {
        assert_eq!(parse_var("count=3").unwrap(), ("count".into(), json!(3)));
        assert_eq!(parse_var("tags=[\"a\"]").unwrap(), ("tags".into(), json!(["a"])));
        assert_eq!(parse_var("name=robot one").unwrap(), ("name".into(), json!("robot one")));
        assert_eq!(parse_var("empty=").unwrap(), ("empty".into(), json!("")));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=5").is_err());
    }

    #[test]
    fn daemons_log_at_info_by_default() {
        let serve = Cli::parse_from(["fleetflow", "serve"]);
        assert_eq!(serve.log_directives(), "info");
        let list = Cli::parse_from(["fleetflow", "robots"]);
        assert_eq!(list.log_directives(), "warn");
        let quiet = Cli::parse_from(["fleetflow", "--quiet", "robots"]);
        assert_eq!(quiet.log_directives(), "error");
    }

    #[test]
    fn run_collects_repeated_vars() {
        let cli = Cli::parse_from(["fleetflow", "run", "wf.json", "--var", "a=1", "--var", "b=x"]);
        match cli.command {
            Commands::Run { vars, .. } => {
                let map = vars_to_map(vars);
                assert_eq!(map["a"], json!(1));
                assert_eq!(map["b"], json!("x"));
            }
            _ => panic!("expected run"),
        }
    }
}
