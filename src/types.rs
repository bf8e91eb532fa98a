//! Core types for the clinical streaming client

use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Author of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Stage of an in-flight assistant message's streaming lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Request issued, no event received yet
    #[default]
    Waiting,
    Reasoning,
    ToolCalling,
    Narrative,
    Done,
}

impl Phase {
    /// Returns true once the message can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done)
    }
}

/// A tool invocation announced by the agent, with its result once reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub name: String,
    pub call_id: String,
    /// Serialized arguments as sent by the backend
    pub arguments: String,
    pub result: Option<String>,
}

impl ToolCallRecord {
    pub fn new(
        name: impl Into<String>,
        call_id: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            call_id: call_id.into(),
            arguments: arguments.into(),
            result: None,
        }
    }
}

/// Progress of an assistant message while its stream is open.
///
/// The reasoning and narrative accumulators only ever grow until the phase reaches
/// [`Phase::Done`], after which the record is frozen onto [`Message::trace`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamingState {
    pub phase: Phase,
    pub reasoning: String,
    pub narrative: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Time spent in the reasoning phase, measured by the turn controller
    pub reasoning_duration: Option<Duration>,
}

impl StreamingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a tool call by its call id.
    pub fn tool_call(&self, call_id: &str) -> Option<&ToolCallRecord> {
        self.tool_calls.iter().find(|call| call.call_id == call_id)
    }
}

/// Category of a clinical insight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightKind {
    #[default]
    Info,
    Warning,
    Critical,
    Positive,
    #[serde(other)]
    Other,
}

/// Source reference backing an insight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A structured clinical finding attached to an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    #[serde(rename = "type", default)]
    pub kind: InsightKind,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

/// Summary entry for a tool the agent used while answering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// The full structured answer from the agent.
///
/// Delivered by the `done` event and by the non-streaming endpoint; both paths
/// finalize a message from this same structure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub narrative: String,
    #[serde(default)]
    pub insights: Vec<Insight>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallSummary>,
}

/// One conversational turn as rendered by the UI
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Display text; follows the narrative while streaming
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Finished agent answer, set when the turn completes
    pub response: Option<AgentResponse>,
    /// Present only while the message is being streamed
    pub streaming: Option<StreamingState>,
    /// Frozen streaming record kept after a streamed turn completes
    pub trace: Option<StreamingState>,
    pub pending: bool,
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            response: None,
            streaming: None,
            trace: None,
            pending: false,
        }
    }

    /// Create the empty assistant message that a turn streams into
    pub fn assistant_placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            response: None,
            streaming: Some(StreamingState::new()),
            trace: None,
            pending: true,
        }
    }

    /// Returns true while the message has a non-terminal streaming state.
    pub fn is_streaming(&self) -> bool {
        self.streaming
            .as_ref()
            .is_some_and(|state| !state.phase.is_terminal())
    }

    /// Drops any in-progress state so the message renders as settled.
    pub fn settle(&mut self) {
        self.streaming = None;
        self.pending = false;
    }
}

/// Reasoning effort requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningEffort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(ReasoningEffort::Low),
            "medium" | "med" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            other => Err(Error::config(format!("unknown reasoning effort: {other}"))),
        }
    }
}

/// The patient a conversation is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// User-visible failure of the last turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub message: String,
    pub retryable: bool,
}

impl ErrorRecord {
    /// Builds the record shown to the user for a terminal error.
    pub fn from_error(error: &Error) -> Self {
        let message = match error {
            Error::Backend(detail) => detail.clone(),
            Error::Api { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            message,
            retryable: crate::retry::is_retryable_error(error),
        }
    }
}

/// A prior message as sent back to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Request body shared by the streaming and non-streaming endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub patient_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<HistoryEntry>>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Response body of the non-streaming endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub response: AgentResponse,
}

/// A typed event decoded from the agent's event stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ToolCall {
        name: String,
        call_id: String,
        arguments: String,
    },
    ToolResult {
        call_id: String,
        output: String,
    },
    Reasoning {
        delta: String,
    },
    Narrative {
        delta: String,
    },
    Done {
        conversation_id: String,
        response: AgentResponse,
    },
    Error {
        detail: String,
    },
}

impl StreamEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Reasoning { .. } => "reasoning",
            StreamEvent::Narrative { .. } => "narrative",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}
