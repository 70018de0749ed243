use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Response bodies are truncated to this many bytes before being stored.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Why an outbound request produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorCode {
    Timeout,
    Connect,
    Request,
    Body,
}

impl TransportErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Request => "request",
            Self::Body => "body",
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network-level delivery failure. Retryable like a non-2xx response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TransportErrorCode::Timeout,
            format!("Request timeout after {after:?}"),
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            TransportErrorCode::Timeout
        } else if err.is_connect() {
            TransportErrorCode::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorCode::Body
        } else {
            TransportErrorCode::Request
        };
        Self::new(code, err.to_string())
    }
}

/// Whatever the receiver answered, success or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status_code: u16,
    pub body: String,
    pub elapsed_ms: u64,
}

impl DispatchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Performs the outbound POST of one delivery attempt.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
        timeout: Duration,
    ) -> Result<DispatchResponse, TransportError>;
}

/// [`Dispatcher`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    /// Build the client. `connect_timeout` bounds connection setup only;
    /// the per-request timeout is passed to [`Dispatcher::send`].
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(format!("CrmWebhooks/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    /// Read response body with size limit. Stops pulling chunks once the
    /// limit is reached.
    async fn read_response_body(mut response: Response) -> Result<String, TransportError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            TransportError::new(
                TransportErrorCode::Body,
                format!("Failed to read response body: {e}"),
            )
        })? {
            let take = chunk.len().min(MAX_BODY_SIZE - bytes.len());
            bytes.extend_from_slice(&chunk[..take]);
            if bytes.len() >= MAX_BODY_SIZE {
                if take < chunk.len() {
                    debug!(max_size = MAX_BODY_SIZE, "Response body too large, truncating");
                }
                break;
            }
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn send(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
        timeout: Duration,
    ) -> Result<DispatchResponse, TransportError> {
        debug!(url = %url, "Sending webhook");
        let start = Instant::now();

        let mut request = self.client.post(url).timeout(timeout);
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        // Bounds the whole exchange, body read included.
        let exchange = async {
            let response = request.body(body.to_string()).send().await?;
            let status_code = response.status().as_u16();
            let body = Self::read_response_body(response).await?;
            Ok::<_, TransportError>((status_code, body))
        };

        let (status_code, body) = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(url = %url, code = %e.code, error = %e.message, "Webhook request failed");
                return Err(e);
            }
            Err(_) => {
                warn!(url = %url, timeout = ?timeout, "Webhook request timed out");
                return Err(TransportError::timeout(timeout));
            }
        };

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            url = %url,
            status = %status_code,
            response_time_ms = %elapsed_ms,
            "Webhook response received"
        );

        Ok(DispatchResponse {
            status_code,
            body,
            elapsed_ms,
        })
    }
}
