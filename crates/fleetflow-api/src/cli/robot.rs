//! `fleetflow robots` (over HTTP).

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use fleetflow_types::robot::{Robot, RobotStatus};

use crate::cli::client::ApiClient;

pub async fn list_robots(client: &ApiClient, json: bool) -> Result<()> {
    let robots: Vec<Robot> = client.get("/robots").await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&robots)?);
        return Ok(());
    }
    if robots.is_empty() {
        println!();
        println!("  {} No robots have registered.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Robot").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Environment"),
            Cell::new("Capabilities"),
            Cell::new("Jobs"),
            Cell::new("Last heartbeat"),
        ]);
    for robot in &robots {
        let color = match robot.status {
            RobotStatus::Online => Color::Green,
            RobotStatus::Busy => Color::Yellow,
            RobotStatus::Offline => Color::Red,
        };
        let caps: Vec<&str> = robot.capabilities.iter().map(String::as_str).collect();
        table.add_row(vec![
            Cell::new(&robot.id),
            Cell::new(robot.status).fg(color),
            Cell::new(&robot.environment),
            Cell::new(caps.join(", ")),
            Cell::new(format!(
                "{}/{}",
                robot.current_job_ids.len(),
                robot.max_concurrent_jobs
            )),
            Cell::new(robot.last_heartbeat.format("%H:%M:%S").to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}
