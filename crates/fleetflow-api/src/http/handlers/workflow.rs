//! Workflow definition handlers.
//!
//! Bodies are workflow documents in JSON, or YAML when the request's
//! `Content-Type` says so.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fleetflow_core::workflow::WorkflowGraph;
use fleetflow_core::workflow::definition::{parse_workflow_json, parse_workflow_yaml};
use fleetflow_types::workflow::{WorkflowDocument, WorkflowRecord};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: usize,
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowRecord> for WorkflowSummary {
    fn from(record: &WorkflowRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            version: record.version.clone(),
            description: record.description.clone(),
            nodes: record.document.nodes.len(),
            fingerprint: record.fingerprint.clone(),
            updated_at: record.updated_at,
        }
    }
}

/// Outcome of `POST /workflows/validate`.
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub entry: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn parse_document(headers: &HeaderMap, body: &str) -> Result<WorkflowDocument, AppError> {
    let is_yaml = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("yaml"));
    let parsed = if is_yaml {
        parse_workflow_yaml(body)
    } else {
        parse_workflow_json(body)
    };
    parsed.map_err(|e| AppError::Validation(e.to_string()))
}

/// POST /api/v1/workflows - Register (or replace) a definition.
pub async fn register_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowRecord>>), AppError> {
    let start = Instant::now();
    let document = parse_document(&headers, &body)?;
    let record = state.dispatcher.register_workflow(document).await?;
    let href = format!("/api/v1/workflows/{}", record.id);
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(record, start).with_link("self", &href)),
    ))
}

/// GET /api/v1/workflows
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowSummary>>>, AppError> {
    let start = Instant::now();
    let records = state.dispatcher.list_workflows().await?;
    let summaries = records.iter().map(WorkflowSummary::from).collect();
    Ok(Json(
        ApiResponse::success(summaries, start).with_link("self", "/api/v1/workflows"),
    ))
}

/// GET /api/v1/workflows/{id} - `id` may also be a workflow name.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowRecord>>, AppError> {
    let start = Instant::now();
    let record = state.dispatcher.resolve_workflow(&id).await?;
    let href = format!("/api/v1/workflows/{}", record.id);
    Ok(Json(ApiResponse::success(record, start).with_link("self", &href)))
}

/// DELETE /api/v1/workflows/{id}
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let start = Instant::now();
    if !state.dispatcher.delete_workflow(&id).await? {
        return Err(AppError::NotFound(format!("workflow {id} not found")));
    }
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "deleted": id }),
        start,
    )))
}

/// POST /api/v1/workflows/validate - Check a document without storing it.
pub async fn validate_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ApiResponse<ValidationReport>>, AppError> {
    let start = Instant::now();
    let document = parse_document(&headers, &body)?;
    let name = document.metadata.name.clone();
    let report = match WorkflowGraph::load(document, state.dispatcher.registry()) {
        Ok(graph) => ValidationReport {
            valid: true,
            name,
            fingerprint: Some(graph.fingerprint().to_string()),
            entry: graph.entry().to_vec(),
            error: None,
        },
        Err(e) => ValidationReport {
            valid: false,
            name,
            fingerprint: None,
            entry: Vec::new(),
            error: Some(e.to_string()),
        },
    };
    Ok(Json(ApiResponse::success(report, start)))
}
