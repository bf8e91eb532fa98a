//! Event-stream framing for the agent's streaming endpoint.
//!
//! The backend answers a streaming request with a Server-Sent Events body in which
//! every record carries a named event and a single JSON object:
//!
//! ```text
//! event: reasoning
//! data: {"delta": "Checking medication list"}
//!
//! event: narrative
//! data: {"delta": "Patient is on "}
//!
//! event: done
//! data: {"conversation_id": "c-42", "response": {...}}
//!
//! ```
//!
//! The HTTP body arrives in chunks whose boundaries have nothing to do with the record
//! boundaries: a chunk can end in the middle of a line, in the middle of a JSON
//! payload, or even in the middle of a multi-byte UTF-8 character. This module turns
//! such a chunked body back into discrete records in two layers:
//!
//! ```text
//! raw bytes ──► FrameDecoder (UTF-8 carry) ──► parse_frames (record carry) ──► SseFrame
//!                                                                        │
//!                                                     decode_event ◄─────┘
//!                                                          │
//!                                                          ▼
//!                                                     StreamEvent
//! ```
//!
//! # Carry-over contract
//!
//! [`parse_frames`] takes the text left over from the previous call plus the new chunk
//! and returns every record completed by the chunk together with the new carry-over.
//! The carry-over always starts at the beginning of the first incomplete record, so
//! nothing is dropped or emitted twice no matter how the body was split. Feeding a body
//! one byte at a time yields the same records as feeding it in one piece.
//!
//! # Tolerance
//!
//! - A record needs an `event:` line, at least one `data:` line, and a blank line.
//!   Records missing either field are discarded when their blank line arrives.
//! - Lines starting with `:` are comments and are ignored, as are unknown fields.
//! - `\r\n` line endings are accepted.
//! - Multiple `data:` lines in one record are joined with `\n`.
//! - A record whose data is not valid JSON is skipped; parsing continues with the
//!   next record.

use crate::types::{AgentResponse, StreamEvent};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::Value;

/// One complete record from the event stream: its name and JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

/// Splits `carry + chunk` into complete records and the text still waiting for its
/// terminator.
///
/// # Examples
///
/// ```rust
/// use clinical_stream::sse::parse_frames;
///
/// let (frames, carry) = parse_frames("", "event: narrative\ndata: {\"delta\":\"Hi\"}\n\nevent: nar");
/// assert_eq!(frames.len(), 1);
/// assert_eq!(frames[0].event, "narrative");
/// assert_eq!(carry, "event: nar");
///
/// let (frames, carry) = parse_frames(&carry, "rative\ndata: {\"delta\":\"!\"}\n\n");
/// assert_eq!(frames.len(), 1);
/// assert!(carry.is_empty());
/// ```
pub fn parse_frames(carry: &str, chunk: &str) -> (Vec<SseFrame>, String) {
    let mut text = String::with_capacity(carry.len() + chunk.len());
    text.push_str(carry);
    text.push_str(chunk);

    let mut frames = Vec::new();
    // Byte offset where the record currently being assembled begins.
    let mut frame_start = 0;
    let mut pos = 0;
    let mut event: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();

    while let Some(offset) = text[pos..].find('\n') {
        let line_end = pos + offset;
        let raw_line = &text[pos..line_end];
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        pos = line_end + 1;

        if line.is_empty() {
            match (event, data.is_empty()) {
                (Some(name), false) => {
                    let payload = data.join("\n");
                    match serde_json::from_str::<Value>(&payload) {
                        Ok(value) => frames.push(SseFrame {
                            event: name.to_string(),
                            data: value,
                        }),
                        Err(e) => {
                            log::debug!("Skipping malformed '{}' frame: {}", name, e);
                        }
                    }
                }
                (None, true) => {}
                _ => log::debug!("Skipping incomplete frame (event or data line missing)"),
            }
            event = None;
            data.clear();
            frame_start = pos;
            continue;
        }

        if line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    let remainder = text[frame_start..].to_string();
    (frames, remainder)
}

/// Converts a frame into a typed event.
///
/// Returns `Ok(None)` for event names this client does not know, and an error when
/// the payload does not have the shape its event name requires.
pub fn decode_event(frame: &SseFrame) -> Result<Option<StreamEvent>> {
    let event = match frame.event.as_str() {
        "tool_call" => {
            let payload: ToolCallPayload = serde_json::from_value(frame.data.clone())?;
            StreamEvent::ToolCall {
                name: payload.name,
                call_id: value_to_text(payload.call_id),
                arguments: value_to_text(payload.arguments),
            }
        }
        "tool_result" => {
            let payload: ToolResultPayload = serde_json::from_value(frame.data.clone())?;
            StreamEvent::ToolResult {
                call_id: value_to_text(payload.call_id),
                output: value_to_text(payload.output),
            }
        }
        "reasoning" => {
            let payload: DeltaPayload = serde_json::from_value(frame.data.clone())?;
            StreamEvent::Reasoning {
                delta: payload.delta,
            }
        }
        "narrative" => {
            let payload: DeltaPayload = serde_json::from_value(frame.data.clone())?;
            StreamEvent::Narrative {
                delta: payload.delta,
            }
        }
        "done" => {
            let payload: DonePayload = serde_json::from_value(frame.data.clone())?;
            StreamEvent::Done {
                conversation_id: payload.conversation_id,
                response: payload.response,
            }
        }
        "error" => {
            let payload: ErrorPayload = serde_json::from_value(frame.data.clone())?;
            StreamEvent::Error {
                detail: payload
                    .detail
                    .filter(|detail| !detail.trim().is_empty())
                    .unwrap_or_else(|| "Unknown error from agent".to_string()),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Incremental decoder from raw body bytes to typed events.
///
/// Holds three carries between calls: bytes of a UTF-8 character that was cut by the
/// chunk boundary, the complete lines of the record still being assembled, and the
/// text after the last newline. Only chunks that finish a line reach
/// [`parse_frames`], so a long line split into many small chunks is scanned once.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: String,
    line: String,
    partial_utf8: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of raw bytes and returns the events it completed.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.partial_utf8.extend_from_slice(bytes);
        let text = take_utf8_prefix(&mut self.partial_utf8);
        self.push_str(&text)
    }

    /// Feeds a chunk of text and returns the events it completed.
    pub fn push_str(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let Some(last_newline) = chunk.rfind('\n') else {
            self.line.push_str(chunk);
            return Vec::new();
        };
        let (complete, rest) = chunk.split_at(last_newline + 1);
        self.line.push_str(complete);
        let lines = std::mem::replace(&mut self.line, rest.to_string());

        let (frames, carry) = parse_frames(&self.carry, &lines);
        self.carry = carry;

        frames
            .iter()
            .filter_map(|frame| match decode_event(frame) {
                Ok(Some(event)) => Some(event),
                Ok(None) => {
                    log::debug!("Ignoring unknown event '{}'", frame.event);
                    None
                }
                Err(e) => {
                    log::debug!("Skipping '{}' event with bad payload: {}", frame.event, e);
                    None
                }
            })
            .collect()
    }

    /// Text received but not yet part of a complete record.
    pub fn remainder(&self) -> String {
        format!("{}{}", self.carry, self.line)
    }
}

/// Removes and returns the longest decodable prefix of `buf`.
///
/// An incomplete character at the end stays in `buf` for the next chunk. Bytes that
/// can never be valid UTF-8 are replaced with U+FFFD.
fn take_utf8_prefix(buf: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buf) {
            Ok(text) => {
                out.push_str(text);
                buf.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                match e.error_len() {
                    None => {
                        out.push_str(&String::from_utf8_lossy(&buf[..valid]));
                        buf.drain(..valid);
                        return out;
                    }
                    Some(len) => {
                        out.push_str(&String::from_utf8_lossy(&buf[..valid + len]));
                        buf.drain(..valid + len);
                    }
                }
            }
        }
    }
}

fn value_to_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct ToolCallPayload {
    name: String,
    call_id: Value,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct ToolResultPayload {
    call_id: Value,
    #[serde(default)]
    output: Value,
}

#[derive(Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    delta: String,
}

#[derive(Deserialize)]
struct DonePayload {
    conversation_id: String,
    response: AgentResponse,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    detail: Option<String>,
}

impl TryFrom<&SseFrame> for StreamEvent {
    type Error = Error;

    fn try_from(frame: &SseFrame) -> Result<Self> {
        decode_event(frame)?
            .ok_or_else(|| Error::stream(format!("unknown event '{}'", frame.event)))
    }
}
