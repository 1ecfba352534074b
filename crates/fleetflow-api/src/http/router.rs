//! Axum router configuration with middleware.
//!
//! REST routes live under `/api/v1/`; the WebSocket endpoints sit at the
//! root. Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflow definitions
        .route(
            "/workflows",
            post(handlers::workflow::register_workflow).get(handlers::workflow::list_workflows),
        )
        .route("/workflows/validate", post(handlers::workflow::validate_workflow))
        .route(
            "/workflows/{id}",
            get(handlers::workflow::get_workflow).delete(handlers::workflow::delete_workflow),
        )
        // Jobs
        .route(
            "/jobs",
            post(handlers::job::submit_job).get(handlers::job::list_jobs),
        )
        .route("/jobs/{id}", get(handlers::job::get_job))
        .route("/jobs/{id}/cancel", post(handlers::job::cancel_job))
        // Fleet
        .route("/robots", get(handlers::robot::list_robots))
        .route("/robots/{id}", get(handlers::robot::get_robot))
        .route("/health", get(handlers::health::health));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/agent", get(handlers::ws::agent_ws))
        .route("/ws/events", get(handlers::ws::events_ws))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
