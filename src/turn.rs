//! Stream session controller: drives one turn from request to settled message.
//!
//! # Turn state machine
//!
//! ```text
//! Idle ──► Requesting ──► Streaming ──► Finalized
//!              │              │
//!              │              └──► (no `done`) ──► Requesting (fallback) ──► Finalized
//!              │                                          │
//!              └──► (stream unavailable) ─────────────────┤
//!                                                         ▼
//!                                                       Failed
//! ```
//!
//! - The streaming request carries the outgoing message, the prior history, the
//!   conversation and session ids when known, and the model selection.
//! - Each body chunk goes through the [`FrameDecoder`]; each event is applied with
//!   [`apply_event`] and the updated message is published at once, so the UI sees
//!   partial text while it arrives.
//! - `done` is the only streaming success. A body that ends (or breaks) before `done`,
//!   and a stream that cannot be opened, both fall back to the non-streaming request.
//! - An `error` event is a terminal failure and is not retried.
//!
//! # Cancellation
//!
//! Every await point races against the turn's [`CancellationToken`]. Once the token
//! fires no further chunk is read and no further event is applied; the placeholder is
//! handed back settled (no streaming state, not pending) in
//! [`TurnOutcome::Cancelled`].

use crate::Error;
use crate::Result;
use crate::fallback;
use crate::reducer::{Applied, apply_event};
use crate::sse::FrameDecoder;
use crate::transport::{ChatTransport, StreamOpen};
use crate::types::{ChatRequest, Message, Phase, StreamEvent};
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Requesting,
    Streaming,
    Finalized,
    Failed,
}

/// Which path produced the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Streamed,
    Fallback,
}

/// How the streaming attempt ended.
#[derive(Debug)]
pub enum StreamOutcome {
    /// A `done` event finalized the message.
    Completed {
        conversation_id: String,
        message: Message,
    },
    /// The stream could not be opened or ended before `done`.
    Unavailable { reason: String, message: Message },
    /// The turn was cancelled; the message is settled.
    Cancelled { message: Message },
}

/// How the whole turn ended, after fallback if one was needed.
#[derive(Debug)]
pub enum TurnOutcome {
    Completed {
        conversation_id: String,
        message: Message,
        delivery: Delivery,
    },
    Cancelled {
        message: Message,
    },
}

/// Callback receiving the placeholder every time it changes.
pub type Publish<'p> = dyn FnMut(&Message) + Send + 'p;

/// Runs a single turn against a transport.
pub struct TurnController<'a> {
    transport: &'a dyn ChatTransport,
    cancel: CancellationToken,
    state: TurnState,
}

impl<'a> TurnController<'a> {
    pub fn new(transport: &'a dyn ChatTransport, cancel: CancellationToken) -> Self {
        Self {
            transport,
            cancel,
            state: TurnState::Idle,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Streams the turn and falls back to the non-streaming endpoint when the stream
    /// does not complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] for an `error` event, or the fallback request's error.
    /// The caller owns rollback of the turn's messages.
    pub async fn run_turn(
        &mut self,
        request: &ChatRequest,
        message: Message,
        publish: &mut Publish<'_>,
    ) -> Result<TurnOutcome> {
        let outcome = match self.run_stream(request, message, publish).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state = TurnState::Failed;
                return Err(e);
            }
        };

        match outcome {
            StreamOutcome::Completed {
                conversation_id,
                message,
            } => Ok(TurnOutcome::Completed {
                conversation_id,
                message,
                delivery: Delivery::Streamed,
            }),
            StreamOutcome::Cancelled { message } => Ok(TurnOutcome::Cancelled { message }),
            StreamOutcome::Unavailable { reason, message } => {
                log::warn!("Streaming unavailable ({}); falling back to a single request", reason);
                self.run_fallback(request, message, publish).await
            }
        }
    }

    /// Streams the turn without any fallback.
    pub async fn run_stream(
        &mut self,
        request: &ChatRequest,
        mut message: Message,
        publish: &mut Publish<'_>,
    ) -> Result<StreamOutcome> {
        self.state = TurnState::Requesting;

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            opened = self.transport.open_stream(request) => Some(opened),
        };
        let Some(opened) = opened else {
            return Ok(StreamOutcome::Cancelled {
                message: self.cancelled(message),
            });
        };

        let mut body = match opened {
            StreamOpen::Opened(body) => body,
            StreamOpen::Unavailable(reason) => {
                return Ok(StreamOutcome::Unavailable { reason, message });
            }
        };

        self.state = TurnState::Streaming;
        let mut decoder = FrameDecoder::new();
        let mut reasoning_started: Option<Instant> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                chunk = body.next() => Some(chunk),
            };
            let Some(chunk) = next else {
                return Ok(StreamOutcome::Cancelled {
                    message: self.cancelled(message),
                });
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    return Ok(StreamOutcome::Unavailable {
                        reason: format!("stream interrupted: {e}"),
                        message,
                    });
                }
                None => {
                    return Ok(StreamOutcome::Unavailable {
                        reason: "stream ended before done".to_string(),
                        message,
                    });
                }
            };

            for event in decoder.push_bytes(&bytes) {
                if self.cancel.is_cancelled() {
                    return Ok(StreamOutcome::Cancelled {
                        message: self.cancelled(message),
                    });
                }

                if matches!(event, StreamEvent::Reasoning { .. }) && reasoning_started.is_none() {
                    reasoning_started = Some(Instant::now());
                }

                log::trace!("Applying '{}' event to message {}", event.name(), message.id);
                let applied = apply_event(&mut message, &event);
                record_reasoning_duration(&mut message, reasoning_started);

                match applied {
                    Applied::Updated => publish(&message),
                    Applied::Ignored => {}
                    Applied::Finished { conversation_id } => {
                        self.state = TurnState::Finalized;
                        publish(&message);
                        return Ok(StreamOutcome::Completed {
                            conversation_id,
                            message,
                        });
                    }
                    Applied::Failed { detail } => {
                        self.state = TurnState::Failed;
                        return Err(Error::backend(detail));
                    }
                }
            }
        }
    }

    async fn run_fallback(
        &mut self,
        request: &ChatRequest,
        mut message: Message,
        publish: &mut Publish<'_>,
    ) -> Result<TurnOutcome> {
        fallback::reset_placeholder(&mut message);
        publish(&message);
        self.state = TurnState::Requesting;

        let answer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            answer = fallback::complete(self.transport, request) => Some(answer),
        };
        let Some(answer) = answer else {
            return Ok(TurnOutcome::Cancelled {
                message: self.cancelled(message),
            });
        };

        match answer {
            Ok(answer) => {
                fallback::finalize(&mut message, &answer.response);
                self.state = TurnState::Finalized;
                publish(&message);
                Ok(TurnOutcome::Completed {
                    conversation_id: answer.conversation_id,
                    message,
                    delivery: Delivery::Fallback,
                })
            }
            Err(e) => {
                self.state = TurnState::Failed;
                Err(e)
            }
        }
    }

    fn cancelled(&mut self, mut message: Message) -> Message {
        log::debug!("Turn cancelled while {:?}", self.state);
        message.settle();
        self.state = TurnState::Idle;
        message
    }
}

/// Stamps the reasoning duration once the message leaves the reasoning phase.
fn record_reasoning_duration(message: &mut Message, started: Option<Instant>) {
    let Some(started) = started else {
        return;
    };
    let state = match (message.streaming.as_mut(), message.trace.as_mut()) {
        (Some(state), _) => state,
        (None, Some(trace)) => trace,
        (None, None) => return,
    };
    if state.phase != Phase::Reasoning && state.reasoning_duration.is_none() {
        state.reasoning_duration = Some(started.elapsed());
    }
}
