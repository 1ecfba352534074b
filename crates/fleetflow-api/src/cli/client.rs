//! Thin HTTP client for the dispatcher's REST API.
//!
//! Unwraps the `{data, meta, errors}` envelope: the first error becomes the
//! command's error, otherwise `data` is deserialized into the caller's type.

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, serde::Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<EnvelopeError>,
}

#[derive(Debug, serde::Deserialize)]
struct EnvelopeError {
    code: String,
    message: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("{}/api/v1", server.trim_end_matches('/')),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(self.url(path)).send().await.with_context(|| self.unreachable())?;
        read_envelope(resp).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| self.unreachable())?;
        read_envelope(resp).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.delete(self.url(path)).send().await.with_context(|| self.unreachable())?;
        read_envelope(resp).await
    }

    /// POST a pre-encoded body, e.g. a workflow file read from disk.
    pub async fn post_raw<T: DeserializeOwned>(
        &self,
        path: &str,
        body: String,
        content_type: &str,
    ) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .with_context(|| self.unreachable())?;
        read_envelope(resp).await
    }

    fn unreachable(&self) -> String {
        format!("cannot reach fleetflow server at {}", self.base)
    }
}

async fn read_envelope<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await.context("failed to read response body")?;
    decode_envelope(status.as_u16(), &body)
}

pub fn decode_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<T> {
    let envelope: Envelope<T> = serde_json::from_str(body)
        .with_context(|| format!("unexpected response (HTTP {status}): {body}"))?;
    if let Some(err) = envelope.errors.into_iter().next() {
        return Err(anyhow!("{} ({})", err.message, err.code));
    }
    envelope
        .data
        .ok_or_else(|| anyhow!("response (HTTP {status}) carried no data"))
}
