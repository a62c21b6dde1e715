//! HTTP client for the clinicsync bridge.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::protocol::{
    BatchRequest, BatchResponse, ChangesQuery, ChangesResponse, WriteRequest, BATCH_PATH,
    CHANGES_PATH, HEALTH_PATH, QUERY_PATH, WRITE_PATH,
};
use super::RemoteExecutor;
use crate::error::{Error, Result};
use crate::models::{MutationResult, QueryOutcome, Statement};
use crate::util::{compact_text, is_http_url, normalize_text_option};

#[derive(Clone)]
pub struct BridgeClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl fmt::Debug for BridgeClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BridgeClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl BridgeClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_text_option(Some(base_url.to_string()))
            .ok_or_else(|| Error::Config("bridge URL must not be empty".to_string()))?;
        if !is_http_url(&base_url) {
            return Err(Error::Config(
                "bridge URL must include http:// or https://".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: normalize_text_option(token),
            client,
        })
    }

    pub async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url(HEALTH_PATH)).send().await?;
        check_status(response).await.map(|_| ())
    }

    pub async fn write(&self, write: &WriteRequest) -> Result<MutationResult> {
        self.post(WRITE_PATH, write).await
    }

    /// All writes in one remote transaction.
    pub async fn batch(&self, operations: Vec<WriteRequest>) -> Result<Vec<MutationResult>> {
        let response: BatchResponse = self.post(BATCH_PATH, &BatchRequest { operations }).await?;
        Ok(response.results)
    }

    /// Rows changed after `since` for every table the bridge exposes.
    pub async fn changes_since(&self, since: Option<&str>, limit: Option<u32>) -> Result<ChangesResponse> {
        let query = ChangesQuery {
            since: since.map(str::to_string),
            limit,
        };
        let request = self.authorized(self.client.get(self.url(CHANGES_PATH))).query(&query);
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let request = self
            .authorized(self.client.post(self.url(path)))
            .header("Accept", "application/json")
            .json(body);
        let response = check_status(request.send().await?).await?;
        Ok(response.json().await?)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl RemoteExecutor for BridgeClient {
    async fn execute(&self, statement: &Statement) -> Result<QueryOutcome> {
        self.post(QUERY_PATH, statement).await
    }

    fn describe(&self) -> String {
        format!("bridge {}", self.base_url)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<String>,
    message: Option<String>,
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Validation(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            Error::RemoteUnavailable(message)
        }
        status if status.is_server_error() => Error::RemoteUnavailable(message),
        _ => Error::Remote(message),
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) {
        if let Some(message) = payload.error.or(payload.message) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}
