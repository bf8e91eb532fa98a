//! # Clinical Stream
//!
//! Streaming client core for a clinical assistant chat: it sends a question about a
//! patient to an agent backend, renders the answer while it streams, and falls back to
//! a single request when streaming is not available.
//!
//! ## Overview
//!
//! The backend answers on a Server-Sent Events stream of typed events:
//!
//! | event | payload | meaning |
//! |---|---|---|
//! | `tool_call` | `{ name, call_id, arguments }` | the agent started a tool |
//! | `tool_result` | `{ call_id, output }` | result of an announced tool call |
//! | `reasoning` | `{ delta }` | reasoning text |
//! | `narrative` | `{ delta }` | answer text shown to the user |
//! | `done` | `{ conversation_id, response }` | terminal success with the full answer |
//! | `error` | `{ detail }` | terminal failure reported by the agent |
//!
//! ## Key Features
//!
//! - **Chunk-independent parsing**: the same events come out however the body is split,
//!   down to one byte at a time
//! - **Progressive rendering**: every event updates the placeholder message at once
//! - **Automatic fallback**: a stream that cannot open or ends early is retried once
//!   without streaming
//! - **All-or-nothing turns**: a failed send removes both of its messages
//! - **Cancellation**: a turn can be aborted at any await point without leaving a
//!   half-streamed message behind
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clinical_stream::{ClientOptions, ConversationClient, Subject};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ClientOptions::builder()
//!         .base_url("http://localhost:8000/api")
//!         .model("gpt-5")
//!         .build()?;
//!
//!     let client = ConversationClient::new(options)?;
//!     client.set_subject(Some(Subject::new("patient-42")));
//!
//!     // Render snapshots while the turn runs
//!     let mut snapshots = client.subscribe();
//!     tokio::spawn(async move {
//!         while let Some(snapshot) = snapshots.next().await {
//!             if let Some(last) = snapshot.messages.last() {
//!                 println!("{}", last.content);
//!             }
//!         }
//!     });
//!
//!     client.send_message("What medications is the patient on?").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **sse**: event-frame parser and byte-level decoder
//! - **reducer**: pure streaming state reducer and its application to a message
//! - **turn**: stream session controller for one turn
//! - **fallback**: the non-streaming path
//! - **client**: the conversation façade
//! - **transport**: the wire contract and its reqwest implementation
//! - **sessions**: session lookup and creation
//! - **history**: request history shaping
//! - **cache**: keyed resource cache with subscriptions
//! - **retry**: retryable classification and exponential backoff

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Conversation façade with optimistic messages, rollback and snapshots.
mod client;

/// Client options builder and environment helpers.
mod config;

/// Error types and the crate-wide `Result<T>` alias.
mod error;

/// Non-streaming fallback for turns whose stream did not complete.
mod fallback;

/// History sent with each request.
mod history;

/// Core data model and wire payloads.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Keyed resource cache with deduplicated loads and change notifications.
pub mod cache;

/// Pure streaming state reducer.
pub mod reducer;

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

/// Session lookup and creation.
pub mod sessions;

/// Server-Sent Events frame parser.
pub mod sse;

/// Backend transport seam.
pub mod transport;

/// Stream session controller.
pub mod turn;

// --- Conversation API ---

pub use client::{ConversationClient, ConversationSnapshot};

// --- Configuration ---

pub use config::{
    BASE_URL_ENV, ClientOptions, ClientOptionsBuilder, MODEL_ENV, get_base_url, get_model,
};

// --- History ---

pub use history::{build_history, estimate_tokens, truncate_history};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Core Types ---

pub use types::{
    AgentResponse, ChatRequest, ChatResponse, Citation, ErrorRecord, HistoryEntry, Insight,
    InsightKind, Message, Phase, ReasoningEffort, Role, StreamEvent, StreamingState, Subject,
    ToolCallRecord, ToolCallSummary,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types.
/// Import with `use clinical_stream::prelude::*;`.
pub mod prelude {
    pub use crate::{
        AgentResponse, ClientOptions, ConversationClient, ConversationSnapshot, Error,
        ErrorRecord, Message, Phase, ReasoningEffort, Result, Role, StreamEvent,
        StreamingState, Subject,
    };
}
