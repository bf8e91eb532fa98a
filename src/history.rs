//! Conversation history sent along with each request
//!
//! The backend receives prior turns as plain `{role, content}` pairs. Only settled
//! messages are included: the in-flight placeholder of the current turn, and any
//! message still marked pending or streaming, never are. An assistant reply counts
//! only once it was finalized with a response; the partial text of a cancelled or
//! superseded turn stays on screen but is not sent back.
//!
//! # Examples
//!
//! ```rust
//! use clinical_stream::{Message, build_history, estimate_tokens};
//!
//! let messages = vec![Message::user("Any allergies?"), Message::assistant_placeholder()];
//! let history = build_history(&messages, None);
//! assert_eq!(history.len(), 1);
//! println!("Estimated tokens: {}", estimate_tokens(&history));
//! ```

use crate::types::{HistoryEntry, Message, Role};

/// Builds the history for a request from the current message list.
///
/// When `max_messages` is set, only the most recent entries are kept (see
/// [`truncate_history`]).
pub fn build_history(messages: &[Message], max_messages: Option<usize>) -> Vec<HistoryEntry> {
    let entries: Vec<HistoryEntry> = messages
        .iter()
        .filter(|m| !m.pending && !m.is_streaming())
        .filter(|m| m.role == Role::User || is_finalized_reply(m))
        .map(|m| HistoryEntry {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    match max_messages {
        Some(keep) => truncate_history(entries, keep),
        None => entries,
    }
}

fn is_finalized_reply(message: &Message) -> bool {
    message.response.is_some() && !message.content.trim().is_empty()
}

/// Estimate token count for a history
///
/// Uses character-based approximation (1 token ≈ 4 characters), plus a small
/// per-message overhead for role formatting. This is an APPROXIMATION; leave a
/// safety margin when comparing against a model's context limit.
pub fn estimate_tokens(entries: &[HistoryEntry]) -> usize {
    if entries.is_empty() {
        return 0;
    }

    let total_chars: usize = entries
        .iter()
        .map(|entry| entry.content.chars().count() + 8)
        .sum::<usize>()
        + 16;

    total_chars.div_ceil(4)
}

/// Keeps the most recent `keep` entries.
///
/// If the cut would start the history with an assistant reply, that reply is
/// dropped too so the backend never sees an answer without its question.
pub fn truncate_history(entries: Vec<HistoryEntry>, keep: usize) -> Vec<HistoryEntry> {
    if entries.len() <= keep {
        return entries;
    }

    let start = entries.len() - keep;
    let mut kept: Vec<HistoryEntry> = entries.into_iter().skip(start).collect();
    if kept.first().is_some_and(|e| e.role == Role::Assistant) {
        kept.remove(0);
    }
    kept
}
