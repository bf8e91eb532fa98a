//! HTTP transport to the agent backend
//!
//! The turn controller talks to the backend only through [`ChatTransport`], which
//! covers both endpoints of the wire contract:
//!
//! - [`ChatTransport::open_stream`] POSTs the request to the streaming endpoint and
//!   hands back the raw body as a byte stream. Failing to get a usable body is not an
//!   error at this level; it is reported as [`StreamOpen::Unavailable`] so that the
//!   caller can fall back to the non-streaming endpoint.
//! - [`ChatTransport::complete`] POSTs the same request to the non-streaming endpoint
//!   and decodes the full answer. Failures here are real errors.
//!
//! [`HttpTransport`] is the reqwest implementation. Tests substitute scripted
//! transports.

use crate::config::ClientOptions;
use crate::types::{ChatRequest, ChatResponse};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_LENGTH};
use std::pin::Pin;
use std::time::Duration;

/// Raw response body of the streaming endpoint, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Result of trying to open the streaming endpoint.
pub enum StreamOpen {
    /// The backend accepted the request; events follow on the body.
    Opened(ByteStream),
    /// No usable stream; the reason is for logs only.
    Unavailable(String),
}

impl std::fmt::Debug for StreamOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamOpen::Opened(_) => f.write_str("Opened(..)"),
            StreamOpen::Unavailable(reason) => f.debug_tuple("Unavailable").field(reason).finish(),
        }
    }
}

/// Both halves of the agent wire contract.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issues the streaming request.
    async fn open_stream(&self, request: &ChatRequest) -> StreamOpen;

    /// Issues the non-streaming request and returns the complete answer.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

/// reqwest-backed [`ChatTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    stream_url: String,
    chat_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport for the endpoints in `options`.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        Ok(Self {
            http: build_http_client(options)?,
            stream_url: options.stream_url(),
            chat_url: options.chat_url(),
            api_key: options.api_key.clone(),
            timeout: Duration::from_secs(options.timeout),
        })
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.post(url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(&self, request: &ChatRequest) -> StreamOpen {
        // No overall timeout here: a healthy stream can stay open for minutes.
        let response = match self
            .post(&self.stream_url)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return StreamOpen::Unavailable(format!("request failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            return StreamOpen::Unavailable(format!("streaming endpoint returned {status}"));
        }
        if status == StatusCode::NO_CONTENT || declares_empty_body(&response) {
            return StreamOpen::Unavailable("streaming endpoint returned no body".to_string());
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::Http));
        StreamOpen::Opened(Box::pin(body))
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .post(&self.chat_url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        let response = error_for_status(response).await?;
        response.json::<ChatResponse>().await.map_err(map_send_error)
    }
}

/// Builds the shared reqwest client for the backend.
pub(crate) fn build_http_client(options: &ClientOptions) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(options.connect_timeout))
        .build()
        .map_err(Error::Http)
}

/// Converts a non-success response into [`Error::Api`] with the backend's detail.
pub(crate) async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_else(|e| {
        log::warn!("Failed to read error response body: {}", e);
        String::new()
    });
    Err(Error::api(status.as_u16(), error_detail(status, &body)))
}

pub(crate) fn map_send_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(error)
    }
}

fn declares_empty_body(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "0")
}

/// Pulls a human-readable message out of an error body.
///
/// Understands `{"detail": "..."}`, `{"message": "..."}` and `{"error": "..."}`;
/// anything else falls back to the raw body, then to the status reason.
fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "message", "error"] {
            match value.get(key) {
                Some(serde_json::Value::String(text)) if !text.trim().is_empty() => {
                    return text.clone();
                }
                Some(serde_json::Value::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }

    let body = body.trim();
    if !body.is_empty() {
        return body.chars().take(500).collect();
    }

    status
        .canonical_reason()
        .unwrap_or("Request failed")
        .to_string()
}
