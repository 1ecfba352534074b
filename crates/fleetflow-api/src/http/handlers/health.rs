//! Liveness and fleet summary.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use serde::Serialize;

use fleetflow_types::robot::RobotStatus;

use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// `ok`, or `degraded` when the database does not answer.
    pub status: &'static str,
    pub database: &'static str,
    pub version: &'static str,
    pub uptime_secs: i64,
    pub queued_jobs: usize,
    pub robots_total: usize,
    pub robots_offline: usize,
}

/// GET /api/v1/health
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthReport>> {
    let start = Instant::now();
    let robots = state.dispatcher.robots();
    let database = match state.db_pool.ping().await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(error = %err, "database health check failed");
            "unreachable"
        }
    };
    let report = HealthReport {
        status: if database == "ok" { "ok" } else { "degraded" },
        database,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        queued_jobs: state.dispatcher.queue_len(),
        robots_total: robots.len(),
        robots_offline: robots
            .iter()
            .filter(|r| r.status == RobotStatus::Offline)
            .count(),
    };
    Json(ApiResponse::success(report, start))
}
