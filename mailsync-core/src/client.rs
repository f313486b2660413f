use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8001";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("ingestion process returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Busy,
    Transient,
    Permanent,
}

/// Handle on the ingestion process's control and status endpoints.
///
/// Every call takes its own timeout: the caller decides how long a probe or
/// command may hold it up.
#[derive(Clone)]
pub struct IngestClient {
    http: Client,
    base_url: Url,
}

impl IngestClient {
    pub fn new() -> Result<Self, IngestError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, IngestError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn start(
        &self,
        request: &StartRequest,
        timeout: Duration,
    ) -> Result<StartResponse, IngestError> {
        let url = self.endpoint("/sync/start")?;
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn stop(&self, timeout: Duration) -> Result<StopResponse, IngestError> {
        let url = self.endpoint("/sync/stop")?;
        let response = self.http.post(url).timeout(timeout).send().await?;
        Self::handle_response(response).await
    }

    pub async fn status(&self, timeout: Duration) -> Result<IngestStatus, IngestError> {
        let url = self.endpoint("/sync/status")?;
        let response = self.http.get(url).timeout(timeout).send().await?;
        Self::handle_response(response).await
    }

    pub async fn progress(&self, timeout: Duration) -> Result<IngestProgress, IngestError> {
        let url = self.endpoint("/sync/progress")?;
        let response = self.http.get(url).timeout(timeout).send().await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, IngestError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, IngestError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(IngestError::Api { status, body })
        }
    }
}

impl IngestError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            IngestError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Request(err) => err.is_timeout() || err.is_connect(),
            IngestError::Url(_) => false,
            IngestError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::Busy | ApiErrorClass::Transient)
            ),
        }
    }

    /// True when the request gave up waiting, as opposed to being refused.
    pub fn is_timeout(&self) -> bool {
        matches!(self, IngestError::Request(err) if err.is_timeout())
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    ) {
        ApiErrorClass::Busy
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StartRequest {
    pub sync_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_filter: Option<String>,
    pub session_id: i64,
}

/// Identifier echoed back by the ingestion process; some deployments send a
/// number, others a string.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RemoteSessionId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RemoteSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteSessionId::Number(id) => write!(f, "{id}"),
            RemoteSessionId::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StartResponse {
    #[serde(default)]
    pub session_id: Option<RemoteSessionId>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StopResponse {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IngestStatus {
    pub sync_in_progress: bool,
    #[serde(default)]
    pub stats: Option<IngestStats>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IngestStats {
    #[serde(default)]
    pub last_sync_start: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IngestProgress {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub elapsed_time: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub emails_processed: u64,
    #[serde(default)]
    pub emails_per_minute: f64,
    #[serde(default)]
    pub current_batch: u64,
    #[serde(default)]
    pub total_batches: u64,
}
