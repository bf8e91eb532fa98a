//! Conversation client scenarios against a scripted in-memory transport
//!
//! Each test scripts the backend turn by turn: the chunks the streaming endpoint
//! returns (or that it is unavailable), and what the non-streaming endpoint answers.

use async_trait::async_trait;
use clinical_stream::sessions::SessionService;
use clinical_stream::transport::{ChatTransport, StreamOpen};
use clinical_stream::{
    AgentResponse, ChatRequest, ChatResponse, ClientOptions, ConversationClient, Error, Message,
    Role, Subject,
};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Body {
    /// Chunks, then the body ends
    Complete(Vec<String>),
    /// Chunks, then the body never yields again
    Hang(Vec<String>),
    Unavailable,
}

struct Turn {
    body: Body,
    fallback: Option<clinical_stream::Result<ChatResponse>>,
}

#[derive(Default)]
struct ScriptedTransport {
    turns: Mutex<VecDeque<Turn>>,
    fallback: Mutex<Option<clinical_stream::Result<ChatResponse>>>,
    requests: Mutex<Vec<ChatRequest>>,
    fallback_requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, body: Body, fallback: Option<clinical_stream::Result<ChatResponse>>) {
        self.turns.lock().unwrap().push_back(Turn { body, fallback });
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn into_body(chunks: Vec<String>, hang: bool) -> StreamOpen {
    let items: Vec<clinical_stream::Result<Vec<u8>>> =
        chunks.into_iter().map(|c| Ok(c.into_bytes())).collect();
    let body = futures::stream::iter(items);
    if hang {
        StreamOpen::Opened(Box::pin(body.chain(futures::stream::pending())))
    } else {
        StreamOpen::Opened(Box::pin(body))
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(&self, request: &ChatRequest) -> StreamOpen {
        self.requests.lock().unwrap().push(request.clone());
        let Some(turn) = self.turns.lock().unwrap().pop_front() else {
            return StreamOpen::Unavailable("nothing scripted".to_string());
        };
        *self.fallback.lock().unwrap() = turn.fallback;

        match turn.body {
            Body::Complete(chunks) => into_body(chunks, false),
            Body::Hang(chunks) => into_body(chunks, true),
            Body::Unavailable => StreamOpen::Unavailable("503 Service Unavailable".to_string()),
        }
    }

    async fn complete(&self, request: &ChatRequest) -> clinical_stream::Result<ChatResponse> {
        self.fallback_requests.lock().unwrap().push(request.clone());
        self.fallback
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(Error::api(500, "no fallback scripted")))
    }
}

struct FixedSessions(clinical_stream::Result<&'static str>);

#[async_trait]
impl SessionService for FixedSessions {
    async fn ensure_session(
        &self,
        _subject: &Subject,
        _known: Option<&str>,
    ) -> clinical_stream::Result<String> {
        match &self.0 {
            Ok(id) => Ok(id.to_string()),
            Err(_) => Err(Error::api(503, "sessions down")),
        }
    }
}

fn options() -> ClientOptions {
    ClientOptions::builder()
        .base_url("http://localhost:8000/api")
        .model("gpt-5")
        .build()
        .unwrap()
}

fn client_for(transport: &Arc<ScriptedTransport>) -> ConversationClient {
    let client = ConversationClient::with_transport(transport.clone(), options());
    client.set_subject(Some(Subject::new("p-1")));
    client
}

fn event(name: &str, data: serde_json::Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

fn done(conversation_id: &str, narrative: &str) -> String {
    event(
        "done",
        serde_json::json!({
            "conversation_id": conversation_id,
            "response": {"narrative": narrative, "follow_ups": ["Any side effects?"]}
        }),
    )
}

fn medication_stream() -> Vec<String> {
    vec![
        event("reasoning", serde_json::json!({"delta": "Checking…"})),
        event("narrative", serde_json::json!({"delta": "Patient is on "})),
        event("narrative", serde_json::json!({"delta": "lisinopril."})),
        done("c-1", "Patient is on lisinopril."),
    ]
}

fn answer(conversation_id: &str, narrative: &str) -> ChatResponse {
    ChatResponse {
        conversation_id: conversation_id.to_string(),
        response: AgentResponse {
            narrative: narrative.to_string(),
            follow_ups: vec!["Any side effects?".to_string()],
            ..Default::default()
        },
    }
}

async fn wait_for<F>(client: &ConversationClient, mut ready: F)
where
    F: FnMut(&clinical_stream::ConversationSnapshot) -> bool,
{
    let mut snapshots = client.subscribe();
    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(snapshot) = snapshots.next().await {
            if ready(&snapshot) {
                return;
            }
        }
    })
    .await;
    assert!(seen.is_ok(), "Timed out waiting for snapshot");
}

#[tokio::test]
async fn test_streamed_answer_finalizes_message() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Complete(medication_stream()), None);
    let client = client_for(&transport);

    client
        .send_message("What medications is the patient on?")
        .await
        .unwrap();

    let messages = client.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].content, "Patient is on lisinopril.");
    assert!(messages[1].streaming.is_none());
    assert!(!messages[1].pending);
    assert_eq!(
        messages[1].response.as_ref().unwrap().follow_ups,
        vec!["Any side effects?".to_string()]
    );
    assert_eq!(client.conversation_id().as_deref(), Some("c-1"));
    assert!(!client.is_streaming());

    let requests = transport.requests();
    assert_eq!(requests[0].patient_id, "p-1");
    assert_eq!(requests[0].model, "gpt-5");
    assert!(requests[0].conversation_history.is_none());
    assert!(requests[0].conversation_id.is_none());
}

#[tokio::test]
async fn test_second_turn_carries_history_and_conversation_id() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Complete(medication_stream()), None);
    transport.push(Body::Complete(vec![done("c-1", "No known allergies.")]), None);
    let client = client_for(&transport);

    client.send_message("Medications?").await.unwrap();
    client.send_message("Allergies?").await.unwrap();

    let second = &transport.requests()[1];
    assert_eq!(second.conversation_id.as_deref(), Some("c-1"));
    let history = second.conversation_history.as_ref().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "Medications?");
    assert_eq!(history[1].content, "Patient is on lisinopril.");
    assert_eq!(client.messages().len(), 4);
}

#[tokio::test]
async fn test_fallback_yields_same_content_as_streaming() {
    let streamed = ScriptedTransport::new();
    streamed.push(Body::Complete(medication_stream()), None);
    let streamed_client = client_for(&streamed);

    let fallback = ScriptedTransport::new();
    fallback.push(
        Body::Unavailable,
        Some(Ok(answer("c-1", "Patient is on lisinopril."))),
    );
    let fallback_client = client_for(&fallback);

    streamed_client.send_message("Medications?").await.unwrap();
    fallback_client.send_message("Medications?").await.unwrap();

    let a = &streamed_client.messages()[1];
    let b = &fallback_client.messages()[1];
    assert_eq!(a.content, b.content);
    assert_eq!(a.response, b.response);
    assert!(b.streaming.is_none());
    assert!(!b.pending);
    assert_eq!(fallback_client.conversation_id().as_deref(), Some("c-1"));
    assert_eq!(fallback.fallback_requests.lock().unwrap().len(), 1);
    assert_eq!(
        fallback.fallback_requests.lock().unwrap()[0],
        fallback.requests()[0]
    );
}

#[tokio::test]
async fn test_stream_ending_without_done_falls_back() {
    let transport = ScriptedTransport::new();
    transport.push(
        Body::Complete(vec![event(
            "narrative",
            serde_json::json!({"delta": "Patient is"}),
        )]),
        Some(Ok(answer("c-9", "Patient is on metformin."))),
    );
    let client = client_for(&transport);

    client.send_message("Medications?").await.unwrap();

    let reply = &client.messages()[1];
    assert_eq!(reply.content, "Patient is on metformin.");
    assert!(reply.trace.is_none());
    assert_eq!(client.conversation_id().as_deref(), Some("c-9"));
}

#[tokio::test]
async fn test_terminal_failure_restores_message_list() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Complete(medication_stream()), None);
    transport.push(
        Body::Complete(vec![
            event("reasoning", serde_json::json!({"delta": "Looking"})),
            event("error", serde_json::json!({"detail": "Patient chart locked"})),
        ]),
        None,
    );
    let client = client_for(&transport);

    client.send_message("Medications?").await.unwrap();
    let before = client.messages();

    let err = client.send_message("Allergies?").await.unwrap_err();

    assert!(matches!(err, Error::Backend(_)));
    assert_eq!(client.messages(), before);
    let record = client.error().unwrap();
    assert_eq!(record.message, "Patient chart locked");
    assert!(!record.retryable);
    assert_eq!(client.last_failed_text().as_deref(), Some("Allergies?"));
    assert_eq!(client.conversation_id().as_deref(), Some("c-1"));
    assert!(transport.fallback_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_fallback_is_retryable_for_server_errors() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Unavailable, Some(Err(Error::api(503, "overloaded"))));
    let client = client_for(&transport);

    let err = client.send_message("Medications?").await.unwrap_err();

    assert!(matches!(err, Error::Api { status: 503, .. }));
    assert!(client.messages().is_empty());
    assert!(client.error().unwrap().retryable);
}

#[tokio::test]
async fn test_retry_resubmits_failed_text() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Unavailable, Some(Err(Error::api(502, "bad gateway"))));
    transport.push(Body::Complete(medication_stream()), None);
    let client = client_for(&transport);

    assert!(client.send_message("Medications?").await.is_err());
    client.retry().await.unwrap();

    let messages = client.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "Medications?");
    assert_eq!(messages[1].content, "Patient is on lisinopril.");
    assert!(client.error().is_none());
    assert!(client.last_failed_text().is_none());
    assert_eq!(transport.requests()[1].message, "Medications?");
}

#[tokio::test]
async fn test_retry_without_failure_is_noop() {
    let transport = ScriptedTransport::new();
    let client = client_for(&transport);

    client.retry().await.unwrap();
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_no_subject_fails_fast() {
    let transport = ScriptedTransport::new();
    let client = ConversationClient::with_transport(transport.clone(), options());

    let err = client
        .send_message("What medications is the patient on?")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoSubject));
    assert!(client.messages().is_empty());
    assert!(!client.error().unwrap().retryable);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_stream_settles_messages() {
    let transport = ScriptedTransport::new();
    transport.push(
        Body::Hang(vec![
            event("reasoning", serde_json::json!({"delta": "Checking…"})),
            event("narrative", serde_json::json!({"delta": "Patient is on "})),
        ]),
        None,
    );
    let client = client_for(&transport);

    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("Medications?").await }
    });
    wait_for(&client, |s| {
        s.messages.last().is_some_and(|m| m.content == "Patient is on ")
    })
    .await;

    client.cancel_stream();
    handle.await.unwrap().unwrap();

    let messages = client.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.streaming.is_none() && !m.pending));
    assert!(client.error().is_none());
    assert!(client.conversation_id().is_none());
    assert!(!client.is_streaming());
}

#[tokio::test]
async fn test_new_send_supersedes_in_flight_turn() {
    let transport = ScriptedTransport::new();
    transport.push(
        Body::Hang(vec![event(
            "narrative",
            serde_json::json!({"delta": "Patient is"}),
        )]),
        None,
    );
    transport.push(Body::Complete(vec![done("c-2", "No known allergies.")]), None);
    let client = client_for(&transport);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("Medications?").await }
    });
    wait_for(&client, |s| {
        s.messages.last().is_some_and(|m| m.content == "Patient is")
    })
    .await;

    client.send_message("Allergies?").await.unwrap();
    first.await.unwrap().unwrap();

    let messages = client.messages();
    assert_eq!(messages.len(), 4);
    assert!(messages[1].streaming.is_none());
    assert!(!messages[1].pending);
    assert_eq!(messages[3].content, "No known allergies.");
    assert_eq!(client.conversation_id().as_deref(), Some("c-2"));
    assert!(messages.iter().all(|m| !m.is_streaming()));
}

#[tokio::test]
async fn test_tool_call_is_recorded_on_trace() {
    let transport = ScriptedTransport::new();
    transport.push(
        Body::Complete(vec![
            event(
                "tool_call",
                serde_json::json!({
                    "name": "query_patient_data",
                    "call_id": "1",
                    "arguments": "{\"fields\":[\"medications\"]}"
                }),
            ),
            event(
                "tool_result",
                serde_json::json!({"call_id": "1", "output": "lisinopril 10mg"}),
            ),
            done("c-1", "Patient is on lisinopril."),
        ]),
        None,
    );
    let client = client_for(&transport);

    client.send_message("Medications?").await.unwrap();

    let reply = &client.messages()[1];
    let trace = reply.trace.as_ref().unwrap();
    let call = trace.tool_call("1").unwrap();
    assert_eq!(call.name, "query_patient_data");
    assert!(!call.arguments.is_empty());
    assert_eq!(call.result.as_deref(), Some("lisinopril 10mg"));
}

#[tokio::test]
async fn test_clear_messages_resets_conversation() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Unavailable, Some(Err(Error::api(500, "boom"))));
    transport.push(Body::Complete(medication_stream()), None);
    let client = client_for(&transport);

    let _ = client.send_message("Labs?").await;
    client.send_message("Medications?").await.unwrap();
    client.clear_messages();

    let snapshot = client.snapshot();
    assert!(snapshot.messages.is_empty());
    assert!(snapshot.conversation_id.is_none());
    assert!(snapshot.error.is_none());
    assert!(client.last_failed_text().is_none());
}

#[tokio::test]
async fn test_switching_subject_aborts_and_resets() {
    let transport = ScriptedTransport::new();
    transport.push(
        Body::Hang(vec![event(
            "narrative",
            serde_json::json!({"delta": "Patient is"}),
        )]),
        None,
    );
    let client = client_for(&transport);

    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("Medications?").await }
    });
    wait_for(&client, |s| s.messages.len() == 2).await;

    client.set_subject(Some(Subject::new("p-2")));
    handle.await.unwrap().unwrap();

    assert!(client.messages().is_empty());
    assert!(client.conversation_id().is_none());
    assert!(!client.is_streaming());
    assert_eq!(client.subject().unwrap().id, "p-2");
}

#[tokio::test]
async fn test_session_committed_only_on_success() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Unavailable, Some(Err(Error::api(500, "boom"))));
    transport.push(Body::Complete(medication_stream()), None);
    let client = ConversationClient::with_services(
        transport.clone(),
        Some(Arc::new(FixedSessions(Ok("s-1")))),
        options(),
    );
    client.set_subject(Some(Subject::new("p-1")));

    assert!(client.send_message("Labs?").await.is_err());
    assert!(client.session_id().is_none());

    client.send_message("Medications?").await.unwrap();
    assert_eq!(client.session_id().as_deref(), Some("s-1"));
    assert_eq!(transport.requests()[1].session_id.as_deref(), Some("s-1"));
}

#[tokio::test]
async fn test_session_failure_does_not_fail_turn() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Complete(medication_stream()), None);
    let client = ConversationClient::with_services(
        transport.clone(),
        Some(Arc::new(FixedSessions(Err(Error::other("down"))))),
        options(),
    );
    client.set_subject(Some(Subject::new("p-1")));

    client.send_message("Medications?").await.unwrap();

    assert!(transport.requests()[0].session_id.is_none());
    assert!(client.session_id().is_none());
    assert_eq!(client.messages().len(), 2);
}

#[tokio::test]
async fn test_model_selection_applies_to_next_turn() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Complete(medication_stream()), None);
    let client = client_for(&transport);

    client.set_model("gpt-5-mini");
    client.set_reasoning_effort(Some(clinical_stream::ReasoningEffort::High));
    client.send_message("Medications?").await.unwrap();

    let request = &transport.requests()[0];
    assert_eq!(request.model, "gpt-5-mini");
    assert_eq!(
        request.reasoning_effort,
        Some(clinical_stream::ReasoningEffort::High)
    );
}

#[tokio::test]
async fn test_placeholder_published_before_network() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Hang(Vec::new()), None);
    let client = client_for(&transport);

    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("Medications?").await }
    });
    wait_for(&client, |s| s.is_streaming && s.messages.len() == 2).await;

    let messages: Vec<Message> = client.messages();
    assert!(messages[1].pending);
    assert!(messages[1].content.is_empty());

    client.cancel_stream();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dropped_send_settles_turn() {
    let transport = ScriptedTransport::new();
    transport.push(
        Body::Hang(vec![event(
            "narrative",
            serde_json::json!({"delta": "Patient is"}),
        )]),
        None,
    );
    let client = client_for(&transport);

    let timed_out =
        tokio::time::timeout(Duration::from_millis(100), client.send_message("Medications?")).await;
    assert!(timed_out.is_err());

    let messages = client.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.streaming.is_none() && !m.pending));
    assert!(!client.is_streaming());
    assert!(!client.snapshot().is_streaming);
    assert!(client.error().is_none());
}

#[tokio::test]
async fn test_aborted_send_task_settles_turn() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Hang(Vec::new()), None);
    let client = client_for(&transport);

    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("Medications?").await }
    });
    wait_for(&client, |s| s.is_streaming).await;

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    assert!(!client.is_streaming());
    assert!(client.messages().iter().all(|m| !m.pending && !m.is_streaming()));
}

#[tokio::test]
async fn test_cancelled_partial_reply_not_sent_as_history() {
    let transport = ScriptedTransport::new();
    transport.push(
        Body::Hang(vec![event(
            "narrative",
            serde_json::json!({"delta": "Patient is"}),
        )]),
        None,
    );
    transport.push(Body::Complete(vec![done("c-2", "No known allergies.")]), None);
    let client = client_for(&transport);

    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("Medications?").await }
    });
    wait_for(&client, |s| {
        s.messages.last().is_some_and(|m| m.content == "Patient is")
    })
    .await;
    client.cancel_stream();
    handle.await.unwrap().unwrap();

    client.send_message("Allergies?").await.unwrap();

    let history = transport.requests()[1].conversation_history.clone().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "Medications?");
    // The partial reply is still shown.
    assert_eq!(client.messages()[1].content, "Patient is");
}

#[tokio::test]
async fn test_error_record_survives_cancelled_send() {
    let transport = ScriptedTransport::new();
    transport.push(Body::Unavailable, Some(Err(Error::api(500, "boom"))));
    transport.push(Body::Hang(Vec::new()), None);
    transport.push(Body::Complete(medication_stream()), None);
    let client = client_for(&transport);

    assert!(client.send_message("Medications?").await.is_err());
    assert!(client.error().is_some());

    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("Medications?").await }
    });
    wait_for(&client, |s| s.is_streaming).await;
    client.cancel_stream();
    handle.await.unwrap().unwrap();
    assert!(client.error().is_some());

    client.send_message("Medications?").await.unwrap();
    assert!(client.error().is_none());
}
