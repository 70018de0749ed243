use super::http_client::{DispatchResponse, Dispatcher, TransportError, TransportErrorCode};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// One request seen by [`ScriptedDispatcher`].
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// In-process dispatcher replaying canned outcomes in order, then a fallback.
pub struct ScriptedDispatcher {
    script: Mutex<VecDeque<Result<DispatchResponse, TransportError>>>,
    fallback: Result<DispatchResponse, TransportError>,
    sent: Mutex<Vec<SentRequest>>,
}

pub fn response(status_code: u16) -> Result<DispatchResponse, TransportError> {
    Ok(DispatchResponse {
        status_code,
        body: format!("status {status_code}"),
        elapsed_ms: 12,
    })
}

pub fn timeout() -> Result<DispatchResponse, TransportError> {
    Err(TransportError::new(
        TransportErrorCode::Timeout,
        "Request timeout after 30s",
    ))
}

impl ScriptedDispatcher {
    /// Answer every request with `status_code`.
    pub fn always(status_code: u16) -> Self {
        Self::scripted(Vec::new(), response(status_code))
    }

    pub fn scripted(
        script: Vec<Result<DispatchResponse, TransportError>>,
        fallback: Result<DispatchResponse, TransportError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn send(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
        _timeout: Duration,
    ) -> Result<DispatchResponse, TransportError> {
        self.sent.lock().expect("sent lock").push(SentRequest {
            url: url.to_string(),
            headers: headers.clone(),
            body: body.to_string(),
        });
        let next = self.script.lock().expect("script lock").pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
