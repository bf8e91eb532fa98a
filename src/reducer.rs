//! Folding stream events into an in-flight assistant message.
//!
//! [`reduce`] is the pure transition over [`StreamingState`]:
//!
//! | event         | effect on the state                                   | phase after    |
//! |---------------|-------------------------------------------------------|----------------|
//! | `tool_call`   | appends a [`ToolCallRecord`]                          | `tool_calling` |
//! | `tool_result` | attaches the output to the record with the same id    | unchanged      |
//! | `reasoning`   | appends to the reasoning text                         | `reasoning`    |
//! | `narrative`   | appends to the narrative text                         | `narrative`    |
//! | `done`        | none                                                  | `done`         |
//! | `error`       | none (handled at the message level)                   | unchanged      |
//!
//! Once the phase is `done` every further event is ignored.
//!
//! [`apply_event`] lifts the transition onto a [`Message`]: it keeps the display
//! content in step with the narrative, finalizes the message on `done`, and settles
//! it on `error`. Events must be applied in the order they were received; the HTTP
//! body is ordered, so no reordering is attempted here.

use crate::types::{Message, Phase, StreamEvent, StreamingState, ToolCallRecord};

/// What applying an event did to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The streaming state changed; the message should be republished.
    Updated,
    /// The event had no effect (message already settled, or an orphan tool result).
    Ignored,
    /// A `done` event finalized the message.
    Finished { conversation_id: String },
    /// An `error` event settled the message; the turn has failed.
    Failed { detail: String },
}

/// Pure transition of the streaming state for one event.
pub fn reduce(mut state: StreamingState, event: &StreamEvent) -> StreamingState {
    if state.phase.is_terminal() {
        return state;
    }

    match event {
        StreamEvent::ToolCall {
            name,
            call_id,
            arguments,
        } => {
            state
                .tool_calls
                .push(ToolCallRecord::new(name, call_id, arguments));
            state.phase = Phase::ToolCalling;
        }
        StreamEvent::ToolResult { call_id, output } => {
            match state
                .tool_calls
                .iter_mut()
                .find(|call| call.call_id == *call_id)
            {
                Some(call) => call.result = Some(output.clone()),
                None => log::debug!("Dropping tool_result for unknown call id '{}'", call_id),
            }
        }
        StreamEvent::Reasoning { delta } => {
            state.reasoning.push_str(delta);
            state.phase = Phase::Reasoning;
        }
        StreamEvent::Narrative { delta } => {
            state.narrative.push_str(delta);
            state.phase = Phase::Narrative;
        }
        StreamEvent::Done { .. } => {
            state.phase = Phase::Done;
        }
        StreamEvent::Error { .. } => {}
    }

    state
}

/// Applies one event to an assistant message.
///
/// A message without streaming state (finalized, failed, or cancelled) ignores every
/// event, which makes finalization idempotent.
pub fn apply_event(message: &mut Message, event: &StreamEvent) -> Applied {
    let Some(state) = message.streaming.take() else {
        log::debug!("Ignoring '{}' event for settled message {}", event.name(), message.id);
        return Applied::Ignored;
    };

    match event {
        StreamEvent::Error { detail } => {
            message.settle();
            Applied::Failed {
                detail: detail.clone(),
            }
        }
        StreamEvent::Done {
            conversation_id,
            response,
        } => {
            let frozen = reduce(state, event);
            message.content = response.narrative.clone();
            message.response = Some(response.clone());
            message.trace = Some(frozen);
            message.settle();
            Applied::Finished {
                conversation_id: conversation_id.clone(),
            }
        }
        StreamEvent::ToolResult { call_id, .. } if state.tool_call(call_id).is_none() => {
            log::debug!("Ignoring tool_result for unknown call id '{}'", call_id);
            message.streaming = Some(state);
            Applied::Ignored
        }
        _ => {
            let next = reduce(state, event);
            if matches!(event, StreamEvent::Narrative { .. }) {
                message.content.clone_from(&next.narrative);
            }
            message.streaming = Some(next);
            Applied::Updated
        }
    }
}
