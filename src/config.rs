//! Configuration for the clinical streaming client

use crate::types::ReasoningEffort;
use crate::{Error, Result};
use std::env;

/// Environment variable overriding the backend base URL
pub const BASE_URL_ENV: &str = "CLINICAL_STREAM_BASE_URL";

/// Environment variable overriding the model name
pub const MODEL_ENV: &str = "CLINICAL_STREAM_MODEL";

/// Options for connecting to the agent backend
#[derive(Clone)]
pub struct ClientOptions {
    /// Backend root, without a trailing slash (e.g., "http://localhost:8000/api")
    pub base_url: String,

    /// Model name sent with every request
    pub model: String,

    /// Reasoning effort sent with every request, if any
    pub reasoning_effort: Option<ReasoningEffort>,

    /// Path of the streaming endpoint
    pub stream_path: String,

    /// Path of the non-streaming endpoint
    pub chat_path: String,

    /// Path of the session collection
    pub sessions_path: String,

    /// Timeout in seconds for non-streaming requests
    pub timeout: u64,

    /// Timeout in seconds for establishing connections
    pub connect_timeout: u64,

    /// Maximum number of prior messages sent as history (None sends all)
    pub max_history_messages: Option<usize>,

    /// Bearer token for the backend, if it requires one
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("stream_path", &self.stream_path)
            .field("chat_path", &self.chat_path)
            .field("sessions_path", &self.sessions_path)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_history_messages", &self.max_history_messages)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ClientOptions {
    /// Create a new builder for ClientOptions
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Full URL of the streaming endpoint
    pub fn stream_url(&self) -> String {
        format!("{}{}", self.base_url, self.stream_path)
    }

    /// Full URL of the non-streaming endpoint
    pub fn chat_url(&self) -> String {
        format!("{}{}", self.base_url, self.chat_path)
    }

    /// Full URL of the session collection
    pub fn sessions_url(&self) -> String {
        format!("{}{}", self.base_url, self.sessions_path)
    }
}

/// Builder for ClientOptions
#[derive(Debug, Default)]
pub struct ClientOptionsBuilder {
    base_url: Option<String>,
    model: Option<String>,
    reasoning_effort: Option<ReasoningEffort>,
    stream_path: Option<String>,
    chat_path: Option<String>,
    sessions_path: Option<String>,
    timeout: Option<u64>,
    connect_timeout: Option<u64>,
    max_history_messages: Option<usize>,
    api_key: Option<String>,
}

impl ClientOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }

    pub fn stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = Some(path.into());
        self
    }

    pub fn chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = Some(path.into());
        self
    }

    pub fn sessions_path(mut self, path: impl Into<String>) -> Self {
        self.sessions_path = Some(path.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout = Some(seconds);
        self
    }

    pub fn max_history_messages(mut self, count: usize) -> Self {
        self.max_history_messages = Some(count);
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn build(self) -> Result<ClientOptions> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::config("base_url is required"))?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "base_url must start with http:// or https://, got '{base_url}'"
            )));
        }

        let model = self
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::config("model is required"))?;

        Ok(ClientOptions {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            reasoning_effort: self.reasoning_effort,
            stream_path: normalize_path(self.stream_path, "/chat/stream"),
            chat_path: normalize_path(self.chat_path, "/chat"),
            sessions_path: normalize_path(self.sessions_path, "/sessions"),
            timeout: self.timeout.unwrap_or(120),
            connect_timeout: self.connect_timeout.unwrap_or(10),
            max_history_messages: self.max_history_messages,
            api_key: self.api_key,
        })
    }
}

fn normalize_path(path: Option<String>, default: &str) -> String {
    let path = path.unwrap_or_else(|| default.to_string());
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

/// Get the base URL from environment variable or fallback
///
/// Priority:
/// 1. CLINICAL_STREAM_BASE_URL environment variable
/// 2. fallback parameter
/// 3. "http://localhost:8000"
pub fn get_base_url(fallback: Option<&str>) -> String {
    if let Ok(url) = env::var(BASE_URL_ENV) {
        return url;
    }

    fallback.unwrap_or("http://localhost:8000").to_string()
}

/// Get the model name from environment variable or fallback
///
/// The environment variable wins only when `prefer_env` is true.
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    if prefer_env {
        if let Ok(model) = env::var(MODEL_ENV) {
            return Some(model);
        }
    }

    fallback.map(|s| s.to_string())
}
