//! Fleetflow CLI and dispatcher entry point.
//!
//! Binary name: `fleetflow`
//!
//! Parses CLI arguments, loads configuration from the data directory, then
//! dispatches to the matching command or starts a long-running process
//! (`serve` for the dispatcher, `agent` for a worker).

mod cli;
mod http;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use fleetflow_core::action::ActionRegistry;
use fleetflow_core::fleet::WorkerAgent;
use fleetflow_infra::config::load_config;
use fleetflow_types::config::FleetConfig;

use cli::client::ApiClient;
use cli::{AgentArgs, Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions need nothing else.
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "fleetflow", &mut std::io::stdout());
        return Ok(());
    }

    fleetflow_observe::init_tracing(cli.log_directives(), cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    fleetflow_observe::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(fleetflow_infra::config::data_dir);
    let config = load_config(&data_dir).await;
    let client = ApiClient::new(&cli.server);

    match cli.command {
        Commands::Serve { host, port } => serve(data_dir, config, host, port).await,
        Commands::Agent(args) => agent(config, args).await,
        Commands::Validate { file } => cli::local::validate(&file, cli.json).await,
        Commands::Run { file, vars } => {
            cli::local::run(&file, cli::vars_to_map(vars), &data_dir, &config, cli.json).await
        }
        Commands::Resume { run_id, file } => {
            cli::local::resume(run_id, &file, &data_dir, &config, cli.json).await
        }
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &client, cli.json).await
        }
        Commands::Job { action } => cli::job::handle_job_command(action, &client, cli.json).await,
        Commands::Robots => cli::robot::list_robots(&client, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Dispatcher process: REST API, agent endpoint and health monitor.
async fn serve(
    data_dir: PathBuf,
    mut config: FleetConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState::init(&data_dir, config).await?;
    let shutdown = CancellationToken::new();
    let monitor = tokio::spawn(state.health_monitor().run(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!(
        "  {} Fleetflow dispatcher listening on {}",
        console::style("⚡").bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!("  Agents connect to {}", console::style(format!("ws://{addr}/ws/agent")).cyan());
    println!("  {}", console::style("Press Ctrl+C to stop").dim());

    let router = http::router::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    let _ = monitor.await;
    println!("\n  Dispatcher stopped.");
    Ok(())
}

/// Worker process: connect to the dispatcher and run assigned jobs.
async fn agent(config: FleetConfig, args: AgentArgs) -> anyhow::Result<()> {
    let mut agent_config = config.agent.clone();
    if let Some(url) = args.url {
        agent_config.server_url = url;
    }
    if args.robot_id.is_some() {
        agent_config.robot_id = args.robot_id;
    }
    if let Some(name) = args.name {
        agent_config.name = name;
    }
    if !args.capabilities.is_empty() {
        agent_config.capabilities = args.capabilities;
    }
    if let Some(environment) = args.environment {
        agent_config.environment = environment;
    }
    if !args.tags.is_empty() {
        agent_config.tags = args.tags;
    }
    if let Some(max_jobs) = args.max_jobs {
        agent_config.max_concurrent_jobs = max_jobs;
    }

    let server_url = agent_config.server_url.clone();
    let reconnect_delay = Duration::from_secs(agent_config.reconnect_delay_secs.max(1));
    let worker = Arc::new(WorkerAgent::new(
        agent_config,
        Arc::new(ActionRegistry::with_builtins()),
        config.orchestrator.clone(),
    ));

    println!(
        "  {} Fleetflow agent connecting to {}",
        console::style("⚡").bold(),
        console::style(&server_url).cyan()
    );

    let cancel = CancellationToken::new();
    let transport = tokio::spawn(fleetflow_infra::transport::run_agent(
        Arc::clone(&worker),
        server_url,
        reconnect_delay,
        cancel.clone(),
    ));
    shutdown_signal().await;
    cancel.cancel();
    let _ = transport.await;
    println!("\n  Agent stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
