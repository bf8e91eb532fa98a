//! Stream Chat - ask questions about a patient from the terminal
//!
//! Renders each answer while it streams: reasoning and tool activity on stderr, the
//! narrative on stdout. Type a question per line; `/retry`, `/clear` and `/quit` are
//! commands. Press Ctrl+C while an answer streams to cancel it.
//!
//! Usage:
//!     CLINICAL_STREAM_BASE_URL=http://localhost:8000/api \
//!         cargo run --example stream_chat -- patient-42

use anyhow::Context;
use clinical_stream::{
    ClientOptions, ConversationClient, ConversationSnapshot, ReasoningEffort, Subject,
    get_base_url, get_model,
};
use futures::StreamExt;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

// ============================================================================
// Rendering
// ============================================================================

/// Prints what changed on the last assistant message since the previous snapshot.
#[derive(Default)]
struct Renderer {
    message_id: Option<String>,
    narrative_len: usize,
    reasoning_len: usize,
    tool_calls: usize,
}

impl Renderer {
    fn render(&mut self, snapshot: &ConversationSnapshot) {
        let Some(last) = snapshot.messages.last() else {
            return;
        };
        if self.message_id.as_deref() != Some(last.id.as_str()) {
            *self = Renderer {
                message_id: Some(last.id.clone()),
                ..Default::default()
            };
        }

        let state = last.streaming.as_ref().or(last.trace.as_ref());
        if let Some(state) = state {
            if state.reasoning.len() > self.reasoning_len {
                eprint!("{}", &state.reasoning[self.reasoning_len..]);
                self.reasoning_len = state.reasoning.len();
            }
            for call in state.tool_calls.iter().skip(self.tool_calls) {
                eprintln!("\n🔧 {} {}", call.name, call.arguments);
            }
            self.tool_calls = state.tool_calls.len();
        }

        // The fallback path restarts the placeholder from empty.
        if last.content.len() < self.narrative_len {
            println!();
            self.narrative_len = 0;
        }
        if last.content.len() > self.narrative_len && last.content.is_char_boundary(self.narrative_len) {
            print!("{}", &last.content[self.narrative_len..]);
            self.narrative_len = last.content.len();
        }
        let _ = std::io::stdout().flush();

        if let Some(error) = &snapshot.error {
            let hint = if error.retryable { " (type /retry)" } else { "" };
            eprintln!("\n❌ {}{}", error.message, hint);
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let patient = std::env::args()
        .nth(1)
        .context("usage: stream_chat <patient-id>")?;

    let options = ClientOptions::builder()
        .base_url(get_base_url(None))
        .model(get_model(Some("gpt-5"), true).unwrap_or_else(|| "gpt-5".to_string()))
        .reasoning_effort(ReasoningEffort::Medium)
        .max_history_messages(20)
        .build()?;
    println!("Connecting to {}", options.base_url);

    let client = ConversationClient::new(options)?;
    client.set_subject(Some(Subject::new(patient)));

    let mut snapshots = client.subscribe();
    tokio::spawn(async move {
        let mut renderer = Renderer::default();
        while let Some(snapshot) = snapshots.next().await {
            renderer.render(&snapshot);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let turn = match line.trim() {
            "/quit" => break,
            "/clear" => {
                client.clear_messages();
                continue;
            }
            "/retry" => {
                let client = client.clone();
                tokio::spawn(async move { client.retry().await })
            }
            text => {
                let client = client.clone();
                let text = text.to_string();
                tokio::spawn(async move { client.send_message(&text).await })
            }
        };

        tokio::select! {
            result = turn => {
                if let Err(e) = result? {
                    log::debug!("Turn failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                client.cancel_stream();
                eprintln!("\n⏹  cancelled");
            }
        }
    }

    Ok(())
}
