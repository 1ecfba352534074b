//! JSON envelope shared by every REST endpoint.
//!
//! Handlers return `{data, meta, errors, _links}`; the CLI client unwraps
//! `data` or turns the first entry of `errors` into its error message.
//! Job and workflow responses link back to themselves under `_links.self`.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

/// Body of every REST response, success or failure.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// The job, workflow or robot payload. Absent on errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    /// Per-request bookkeeping, always present.
    pub meta: ApiMeta,

    /// Failures; empty whenever `data` is set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ApiErrorDetail>,

    /// Related resources by relation name, e.g. `self -> /api/v1/jobs/{id}`.
    #[serde(rename = "_links", skip_serializing_if = "HashMap::is_empty")]
    pub links: HashMap<String, String>,
}

/// Request metadata attached to every envelope.
#[derive(Debug, Serialize)]
pub struct ApiMeta {
    /// Fresh UUIDv7 per response, for matching client reports to server logs.
    pub request_id: String,
    /// RFC 3339 timestamp of the response.
    pub timestamp: String,
    /// Wall time spent in the handler.
    pub response_time_ms: u64,
}

impl ApiMeta {
    fn since(started: Instant) -> Self {
        Self {
            request_id: Uuid::now_v7().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            response_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// One entry of `errors`, mapped from a dispatcher or workflow error.
#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message, shown verbatim by the CLI.
    pub message: String,
    /// Structured context such as validation issues.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Success envelope for a request that began at `started`.
    pub fn success(data: T, started: Instant) -> Self {
        Self {
            data: Some(data),
            meta: ApiMeta::since(started),
            errors: Vec::new(),
            links: HashMap::new(),
        }
    }

    pub fn with_link(mut self, rel: &str, href: &str) -> Self {
        self.links.insert(rel.to_string(), href.to_string());
        self
    }
}

impl ApiResponse<()> {
    /// Error envelope (no data).
    pub fn error(code: &str, message: String, details: Option<serde_json::Value>) -> Self {
        Self {
            data: None,
            meta: ApiMeta::since(Instant::now()),
            errors: vec![ApiErrorDetail {
                code: code.to_string(),
                message,
                details,
            }],
            links: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_omits_errors() {
        let resp = ApiResponse::success(vec![1, 2], Instant::now()).with_link("self", "/api/v1/jobs");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["data"], serde_json::json!([1, 2]));
        assert_eq!(value["_links"]["self"], "/api/v1/jobs");
        assert!(value.get("errors").is_none());
        assert!(!value["meta"]["request_id"].as_str().unwrap().is_empty());
    }

    #[test]
    fn error_envelope_omits_data() {
        let resp = ApiResponse::error("JOB_NOT_FOUND", "job x not found".into(), None);
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("data").is_none());
        assert_eq!(value["errors"][0]["code"], "JOB_NOT_FOUND");
    }
}
