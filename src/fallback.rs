//! Non-streaming fallback for a turn whose stream could not be completed.
//!
//! When the streaming endpoint cannot be opened, or its body ends without a `done`
//! event, the turn is retried exactly once against the non-streaming endpoint with the
//! same request body. A successful answer finalizes the placeholder the same way `done`
//! would; a failure is terminal.
//!
//! Partial reasoning and tool-call data from the abandoned stream is discarded here:
//! the placeholder goes back to an empty, pending message before the request is sent.

use crate::transport::ChatTransport;
use crate::types::{AgentResponse, ChatRequest, ChatResponse, Message};
use crate::Result;

/// Clears what the abandoned stream left on the placeholder.
///
/// The message stays pending so the UI keeps showing a loading state.
pub fn reset_placeholder(message: &mut Message) {
    message.content.clear();
    message.streaming = None;
    message.trace = None;
    message.response = None;
    message.pending = true;
}

/// Issues the single non-streaming request.
pub async fn complete(transport: &dyn ChatTransport, request: &ChatRequest) -> Result<ChatResponse> {
    log::debug!("Requesting non-streaming answer for patient {}", request.patient_id);
    transport.complete(request).await
}

/// Finalizes the placeholder from a complete answer, mirroring a `done` event.
pub fn finalize(message: &mut Message, response: &AgentResponse) {
    message.content = response.narrative.clone();
    message.response = Some(response.clone());
    message.settle();
}
