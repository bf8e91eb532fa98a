//! Persisted chat-session lookup
//!
//! A chat thread is backed by a session record on the backend. The conversation
//! client asks for the thread's session id lazily, on the first send: a known id is
//! checked with `GET {sessions}/{id}`, and a 404 (or no id at all) creates a new one
//! with `POST {sessions}`. Transient failures are retried with backoff.

use crate::config::ClientOptions;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::transport::{build_http_client, error_for_status, map_send_error};
use crate::types::Subject;
use crate::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Looks up or creates the session backing a chat thread.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Returns `known` if the backend still has it, otherwise the id of a new session
    /// for `subject`.
    async fn ensure_session(&self, subject: &Subject, known: Option<&str>) -> Result<String>;
}

/// reqwest-backed [`SessionService`].
#[derive(Debug, Clone)]
pub struct HttpSessionService {
    http: reqwest::Client,
    sessions_url: String,
    api_key: Option<String>,
    retry: RetryConfig,
}

#[derive(Serialize)]
struct CreateSession<'a> {
    patient_id: &'a str,
}

#[derive(Deserialize)]
struct SessionRecord {
    #[serde(alias = "session_id")]
    id: String,
}

impl HttpSessionService {
    pub fn new(options: &ClientOptions) -> Result<Self> {
        Ok(Self {
            http: build_http_client(options)?,
            sessions_url: options.sessions_url(),
            api_key: options.api_key.clone(),
            retry: RetryConfig::default(),
        })
    }

    /// Replaces the retry policy for session calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// `Ok(None)` when the backend no longer knows the session.
    async fn lookup(&self, id: &str) -> Result<Option<String>> {
        let url = format!("{}/{}", self.sessions_url, id);
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(map_send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: SessionRecord = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(map_send_error)?;
        Ok(Some(record.id))
    }

    async fn create(&self, subject: &Subject) -> Result<String> {
        let response = self
            .authorize(self.http.post(&self.sessions_url))
            .json(&CreateSession {
                patient_id: &subject.id,
            })
            .send()
            .await
            .map_err(map_send_error)?;

        let record: SessionRecord = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(map_send_error)?;
        Ok(record.id)
    }
}

#[async_trait]
impl SessionService for HttpSessionService {
    async fn ensure_session(&self, subject: &Subject, known: Option<&str>) -> Result<String> {
        if let Some(id) = known {
            if let Some(id) = retry_with_backoff(self.retry.clone(), || self.lookup(id)).await? {
                log::debug!("Reusing session {}", id);
                return Ok(id);
            }
            log::debug!("Session {} not found; creating a new one", id);
        }

        let id = retry_with_backoff(self.retry.clone(), || self.create(subject)).await?;
        log::debug!("Created session {} for patient {}", id, subject.id);
        Ok(id)
    }
}
