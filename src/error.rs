//! Error types for the clinical streaming client

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Non-success HTTP status from the agent backend
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code returned by the backend
        status: u16,
        /// Error detail extracted from the response body
        message: String,
    },

    /// Error reported by the backend through an `error` event
    #[error("Agent error: {0}")]
    Backend(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// A message was sent while no patient is selected
    #[error("No patient selected")]
    NoSubject,

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error from a status code and detail
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Error::Api {
            status,
            message: msg.into(),
        }
    }

    /// Create a new backend-reported error
    pub fn backend(detail: impl Into<String>) -> Self {
        Error::Backend(detail.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}
