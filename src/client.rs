//! Conversation client: the façade a chat UI talks to
//!
//! This module ties the protocol pieces together into one object per chat thread. The
//! UI calls a handful of operations ([`send_message`], [`retry`], [`cancel_stream`],
//! [`clear_messages`], [`set_subject`]) and renders whatever [`subscribe`] yields.
//!
//! # Architecture Overview
//!
//! ```text
//! send_message(text)
//!     │
//!     ├─> no subject bound? ──> ErrorRecord (not retryable), Err(NoSubject)
//!     │
//!     ├─> cancel the in-flight turn, if any
//!     │
//!     ├─> append user message + assistant placeholder, publish snapshot
//!     │
//!     ├─> ensure_session (failure is logged, never fatal)
//!     │
//!     ├─> TurnController::run_turn ── each update replaces the placeholder ──> publish
//!     │       │
//!     │       ├─> Completed  ──> commit conversation id + session id
//!     │       ├─> Cancelled  ──> leave the settled placeholder, no error
//!     │       └─> Err        ──> roll back both messages, ErrorRecord, remember text
//!     │
//!     └─> publish snapshot
//! ```
//!
//! ## One writer per conversation
//!
//! Only one turn may be in flight per conversation. Each turn owns a generation number
//! and a [`CancellationToken`]; starting a new turn (or cancelling, clearing, switching
//! patient) cancels the token of the current one. Every write a turn makes to the
//! shared state first checks, under the lock, that its generation is still the current
//! one and its token has not fired, so a superseded turn can never touch the message
//! list again.
//!
//! ## Thread Safety
//!
//! [`ConversationClient`] is cheap to clone; clones share the same conversation. The
//! state lock is a plain `std::sync::Mutex` that is never held across an `.await`, so
//! [`cancel_stream`] can be called from another task while [`send_message`] is awaiting
//! the network.
//!
//! ## Consistency Guarantees
//!
//! - A terminal failure leaves the message list exactly as it was before the send.
//! - The conversation id and session id change only when a turn completes.
//! - Cancellation is not an error: no error record is set, the placeholder stays in the
//!   list settled (no streaming state, not pending).
//!
//! [`send_message`]: ConversationClient::send_message
//! [`retry`]: ConversationClient::retry
//! [`cancel_stream`]: ConversationClient::cancel_stream
//! [`clear_messages`]: ConversationClient::clear_messages
//! [`set_subject`]: ConversationClient::set_subject
//! [`subscribe`]: ConversationClient::subscribe

use crate::config::ClientOptions;
use crate::history::build_history;
use crate::sessions::{HttpSessionService, SessionService};
use crate::transport::{ChatTransport, HttpTransport};
use crate::turn::{TurnController, TurnOutcome};
use crate::types::{ChatRequest, ErrorRecord, Message, ReasoningEffort, Subject};
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

/// Everything the UI needs to render a conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub error: Option<ErrorRecord>,
    /// True while a turn is in flight
    pub is_streaming: bool,
}

/// The turn currently allowed to write.
#[derive(Debug)]
struct ActiveTurn {
    generation: u64,
    cancel: CancellationToken,
    user_id: String,
    placeholder_id: String,
}

#[derive(Debug)]
struct Conversation {
    subject: Option<Subject>,
    messages: Vec<Message>,
    conversation_id: Option<String>,
    session_id: Option<String>,
    error: Option<ErrorRecord>,
    last_failed: Option<String>,
    model: String,
    reasoning_effort: Option<ReasoningEffort>,
    active: Option<ActiveTurn>,
    generation: u64,
}

impl Conversation {
    fn new(options: &ClientOptions) -> Self {
        Self {
            subject: None,
            messages: Vec::new(),
            conversation_id: None,
            session_id: None,
            error: None,
            last_failed: None,
            model: options.model.clone(),
            reasoning_effort: options.reasoning_effort,
            active: None,
            generation: 0,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|turn| turn.generation == generation && !turn.cancel.is_cancelled())
    }

    /// Cancels the in-flight turn and settles every message it left mid-stream.
    fn abort(&mut self) {
        if let Some(turn) = self.active.take() {
            log::debug!("Aborting turn {}", turn.generation);
            turn.cancel.cancel();
        }
        for message in &mut self.messages {
            if message.streaming.is_some() || message.pending {
                message.settle();
            }
        }
    }

    fn replace(&mut self, updated: &Message) {
        if let Some(slot) = self.messages.iter_mut().find(|m| m.id == updated.id) {
            slot.clone_from(updated);
        }
    }

    fn reset(&mut self) {
        self.abort();
        self.messages.clear();
        self.conversation_id = None;
        self.error = None;
        self.last_failed = None;
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.messages.clone(),
            conversation_id: self.conversation_id.clone(),
            session_id: self.session_id.clone(),
            error: self.error.clone(),
            is_streaming: self.active.is_some(),
        }
    }
}

struct Inner {
    transport: Arc<dyn ChatTransport>,
    sessions: Option<Arc<dyn SessionService>>,
    max_history_messages: Option<usize>,
    state: Mutex<Conversation>,
    snapshots: watch::Sender<ConversationSnapshot>,
}

/// Settles the turn of a `send_message` future dropped before it resolved.
struct TurnGuard<'c> {
    client: &'c ConversationClient,
    generation: u64,
    armed: bool,
}

impl<'c> TurnGuard<'c> {
    fn new(client: &'c ConversationClient, generation: u64) -> Self {
        Self {
            client,
            generation,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut conversation = self.client.lock();
        if conversation.is_current(self.generation) {
            log::debug!("Turn {} dropped before settling", self.generation);
            conversation.abort();
            self.client.publish(&conversation);
        }
    }
}

/// Client for one chat thread about one patient.
///
/// # Examples
///
/// ```rust,no_run
/// use clinical_stream::{ClientOptions, ConversationClient, Subject};
///
/// # async fn example() -> clinical_stream::Result<()> {
/// let client = ConversationClient::new(
///     ClientOptions::builder()
///         .base_url("http://localhost:8000/api")
///         .model("gpt-5")
///         .build()?,
/// )?;
///
/// client.set_subject(Some(Subject::new("patient-42")));
/// client.send_message("What medications is the patient on?").await?;
///
/// for message in client.messages() {
///     println!("{:?}: {}", message.role, message.content);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConversationClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConversationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationClient")
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl ConversationClient {
    /// Creates a client talking HTTP to the backend described by `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&options)?);
        let sessions = Arc::new(HttpSessionService::new(&options)?);
        Ok(Self::with_services(transport, Some(sessions), options))
    }

    /// Creates a client over a custom transport, without a session service.
    pub fn with_transport(transport: Arc<dyn ChatTransport>, options: ClientOptions) -> Self {
        Self::with_services(transport, None, options)
    }

    /// Creates a client over a custom transport and session service.
    pub fn with_services(
        transport: Arc<dyn ChatTransport>,
        sessions: Option<Arc<dyn SessionService>>,
        options: ClientOptions,
    ) -> Self {
        let conversation = Conversation::new(&options);
        let (snapshots, _) = watch::channel(conversation.snapshot());
        Self {
            inner: Arc::new(Inner {
                transport,
                sessions,
                max_history_messages: options.max_history_messages,
                state: Mutex::new(conversation),
                snapshots,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, conversation: &Conversation) {
        self.inner.snapshots.send_replace(conversation.snapshot());
    }

    /// Sends a message and drives the turn to completion.
    ///
    /// Resolves once the turn is settled: answered, cancelled or rolled back. Blank
    /// text is ignored.
    ///
    /// # Behavior Details
    ///
    /// - A turn already in flight is cancelled first and its message settled.
    /// - The user message and an empty, pending assistant placeholder are appended and
    ///   published before any network call.
    /// - The placeholder is republished on every streamed update.
    /// - When streaming is unavailable or ends early the same request is sent once to
    ///   the non-streaming endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::NoSubject`] when no patient is bound. The message list is untouched.
    /// - The terminal error of the turn ([`Error::Backend`] for an `error` event, or the
    ///   fallback request's error). Both messages of the turn have been removed, the
    ///   error record is set and the text is kept for [`retry`](Self::retry).
    ///
    /// A cancelled turn returns `Ok(())`. Dropping the returned future before it
    /// resolves cancels the turn the same way [`cancel_stream`](Self::cancel_stream)
    /// does. The error record of an earlier failure is cleared only when a turn
    /// completes.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let (subject, mut request, known_session, generation, cancel, placeholder) = {
            let mut conversation = self.lock();
            let Some(subject) = conversation.subject.clone() else {
                let error = Error::NoSubject;
                conversation.error = Some(ErrorRecord::from_error(&error));
                self.publish(&conversation);
                return Err(error);
            };

            conversation.abort();
            let history = build_history(&conversation.messages, self.inner.max_history_messages);

            let user = Message::user(text);
            let placeholder = Message::assistant_placeholder();
            conversation.generation += 1;
            let generation = conversation.generation;
            let cancel = CancellationToken::new();
            conversation.active = Some(ActiveTurn {
                generation,
                cancel: cancel.clone(),
                user_id: user.id.clone(),
                placeholder_id: placeholder.id.clone(),
            });
            conversation.messages.push(user);
            conversation.messages.push(placeholder.clone());
            self.publish(&conversation);

            let request = ChatRequest {
                patient_id: subject.id.clone(),
                message: text.to_string(),
                conversation_id: conversation.conversation_id.clone(),
                session_id: None,
                conversation_history: (!history.is_empty()).then_some(history),
                model: conversation.model.clone(),
                reasoning_effort: conversation.reasoning_effort,
            };
            let known_session = conversation.session_id.clone();
            (subject, request, known_session, generation, cancel, placeholder)
        };

        let mut guard = TurnGuard::new(self, generation);

        request.session_id = match self.inner.sessions.as_ref() {
            Some(service) => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                found = service.ensure_session(&subject, known_session.as_deref()) => match found {
                    Ok(id) => Some(id),
                    Err(e) => {
                        log::warn!("Continuing without a session for patient {}: {}", subject.id, e);
                        None
                    }
                },
            },
            None => known_session,
        };

        let transport = Arc::clone(&self.inner.transport);
        let mut controller = TurnController::new(transport.as_ref(), cancel.clone());
        let mut publish = |message: &Message| {
            let mut conversation = self.lock();
            if conversation.is_current(generation) {
                conversation.replace(message);
                self.publish(&conversation);
            }
        };
        let result = controller.run_turn(&request, placeholder, &mut publish).await;
        guard.disarm();

        let mut conversation = self.lock();
        let current = conversation.is_current(generation);
        match result {
            Ok(TurnOutcome::Completed {
                conversation_id,
                message,
                delivery,
            }) => {
                if !current {
                    log::debug!("Dropping answer of superseded turn {}", generation);
                    return Ok(());
                }
                log::debug!("Turn {} completed via {:?}", generation, delivery);
                conversation.replace(&message);
                conversation.conversation_id = Some(conversation_id);
                if request.session_id.is_some() {
                    conversation.session_id = request.session_id;
                }
                conversation.error = None;
                conversation.last_failed = None;
                conversation.active = None;
                self.publish(&conversation);
                Ok(())
            }
            Ok(TurnOutcome::Cancelled { message }) => {
                if conversation
                    .active
                    .as_ref()
                    .is_some_and(|turn| turn.generation == generation)
                {
                    conversation.active = None;
                    conversation.replace(&message);
                    self.publish(&conversation);
                }
                Ok(())
            }
            Err(e) if cancel.is_cancelled() => {
                log::debug!("Turn {} failed after cancellation: {}", generation, e);
                Ok(())
            }
            Err(e) => {
                if current {
                    if let Some(turn) = conversation.active.take() {
                        conversation
                            .messages
                            .retain(|m| m.id != turn.user_id && m.id != turn.placeholder_id);
                    }
                    conversation.error = Some(ErrorRecord::from_error(&e));
                    conversation.last_failed = Some(text.to_string());
                    self.publish(&conversation);
                }
                log::warn!("Turn {} failed: {}", generation, e);
                Err(e)
            }
        }
    }

    /// Resubmits the text of the most recent failed send, if there is one.
    pub async fn retry(&self) -> Result<()> {
        let text = self.lock().last_failed.clone();
        match text {
            Some(text) => self.send_message(&text).await,
            None => Ok(()),
        }
    }

    /// Aborts the in-flight turn.
    ///
    /// Messages already appended stay; any message still streaming is settled.
    pub fn cancel_stream(&self) {
        let mut conversation = self.lock();
        conversation.abort();
        self.publish(&conversation);
    }

    /// Resets the thread: messages, conversation id, error and failed text.
    ///
    /// The session id is kept; the backend session stays valid for the patient.
    pub fn clear_messages(&self) {
        let mut conversation = self.lock();
        conversation.reset();
        self.publish(&conversation);
    }

    /// Binds the conversation to a patient, or unbinds it with `None`.
    ///
    /// Switching to a different patient aborts the in-flight turn and resets the
    /// client to its initial empty state, session included. Re-binding the same
    /// patient is a no-op.
    pub fn set_subject(&self, subject: Option<Subject>) {
        let mut conversation = self.lock();
        let unchanged = match (&conversation.subject, &subject) {
            (Some(current), Some(next)) => current.id == next.id,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        conversation.reset();
        conversation.session_id = None;
        conversation.subject = subject;
        self.publish(&conversation);
    }

    /// Model used from the next turn on.
    pub fn set_model(&self, model: impl Into<String>) {
        self.lock().model = model.into();
    }

    /// Reasoning effort used from the next turn on.
    pub fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) {
        self.lock().reasoning_effort = effort;
    }

    /// Clears the error record without touching anything else.
    pub fn dismiss_error(&self) {
        let mut conversation = self.lock();
        if conversation.error.take().is_some() {
            self.publish(&conversation);
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.lock().snapshot()
    }

    /// Stream of snapshots, starting with the current one.
    ///
    /// Intermediate snapshots may be skipped by a slow consumer; the latest is never
    /// lost.
    pub fn subscribe(&self) -> WatchStream<ConversationSnapshot> {
        WatchStream::new(self.inner.snapshots.subscribe())
    }

    pub fn subject(&self) -> Option<Subject> {
        self.lock().subject.clone()
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.lock().conversation_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn error(&self) -> Option<ErrorRecord> {
        self.lock().error.clone()
    }

    /// Text kept for [`retry`](Self::retry) after a failed send.
    pub fn last_failed_text(&self) -> Option<String> {
        self.lock().last_failed.clone()
    }

    pub fn model(&self) -> String {
        self.lock().model.clone()
    }

    pub fn reasoning_effort(&self) -> Option<ReasoningEffort> {
        self.lock().reasoning_effort
    }

    /// True while a turn is in flight.
    pub fn is_streaming(&self) -> bool {
        self.lock().active.is_some()
    }
}
