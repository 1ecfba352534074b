//! Robot registry handlers.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};

use fleetflow_core::fleet::DispatchError;
use fleetflow_types::robot::Robot;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// GET /api/v1/robots
pub async fn list_robots(State(state): State<AppState>) -> Json<ApiResponse<Vec<Robot>>> {
    let start = Instant::now();
    let mut robots = state.dispatcher.robots();
    robots.sort_by(|a, b| a.id.cmp(&b.id));
    Json(ApiResponse::success(robots, start).with_link("self", "/api/v1/robots"))
}

/// GET /api/v1/robots/{id}
pub async fn get_robot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Robot>>, AppError> {
    let start = Instant::now();
    let robot = state
        .dispatcher
        .robot(&id)
        .ok_or(DispatchError::RobotNotFound(id))?;
    Ok(Json(ApiResponse::success(robot, start)))
}
