use super::{require_api_key, send_json};
use crate::error::BackendError;
use crate::settings::ConfigSnapshot;
use crate::state::{ConversationState, PendingState, TokenKind};
use crate::store::StoreHandle;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const RUN_POLL_INTERVAL: Duration = Duration::from_millis(800);

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct Run {
    id: String,
    status: String,
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    text: Option<TextPart>,
}

#[derive(Deserialize)]
struct TextPart {
    value: String,
}

struct Api<'a> {
    http: &'a reqwest::Client,
    snapshot: &'a ConfigSnapshot,
    api_key: &'a str,
}

impl Api<'_> {
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.snapshot.base_url, path);
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .timeout(self.snapshot.timeout());
        if let Some(organization) = &self.snapshot.organization {
            request = request.header("OpenAI-Organization", organization);
        }
        request
    }

    async fn create_thread(&self) -> Result<String, BackendError> {
        let thread: Created = send_json(
            self.request(Method::POST, "/threads").json(&json!({})),
            self.snapshot.timeout_secs,
        )
        .await?;
        Ok(thread.id)
    }

    async fn add_message(&self, thread: &str, content: &str) -> Result<(), BackendError> {
        let _: Created = send_json(
            self.request(Method::POST, &format!("/threads/{}/messages", thread))
                .json(&json!({ "role": "user", "content": content })),
            self.snapshot.timeout_secs,
        )
        .await?;
        Ok(())
    }

    async fn start_run(&self, thread: &str, assistant_id: &str) -> Result<Run, BackendError> {
        send_json(
            self.request(Method::POST, &format!("/threads/{}/runs", thread))
                .json(&json!({ "assistant_id": assistant_id })),
            self.snapshot.timeout_secs,
        )
        .await
    }

    async fn run_status(&self, thread: &str, run: &str) -> Result<Run, BackendError> {
        send_json(
            self.request(Method::GET, &format!("/threads/{}/runs/{}", thread, run)),
            self.snapshot.timeout_secs,
        )
        .await
    }

    async fn latest_reply(&self, thread: &str) -> Result<String, BackendError> {
        let messages: MessageList = send_json(
            self.request(Method::GET, &format!("/threads/{}/messages", thread))
                .query(&[("order", "desc"), ("limit", "10")]),
            self.snapshot.timeout_secs,
        )
        .await?;

        let message = messages
            .data
            .into_iter()
            .find(|m| m.role == "assistant")
            .ok_or_else(|| BackendError::Malformed("thread has no assistant message".into()))?;

        Ok(message
            .content
            .into_iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Appends `prompt` to the conversation's thread, runs the configured
/// assistant and waits for it within the configured timeout. A newly created
/// thread is recorded in `pending`.
pub async fn reply(
    http: &reqwest::Client,
    store: &StoreHandle,
    pending: &mut PendingState,
    snapshot: &ConfigSnapshot,
    conversation_id: i64,
    prompt: &str,
) -> Result<String, BackendError> {
    let api_key = require_api_key(snapshot)?;
    let assistant_id = snapshot
        .assistant_id
        .as_deref()
        .ok_or_else(|| BackendError::Config("assistant_id is not set".to_string()))?;
    let api = Api {
        http,
        snapshot,
        api_key,
    };

    let existing =
        ConversationState::lookup(store, pending, conversation_id, TokenKind::AssistantsThread)
            .await?;
    let thread = match existing {
        Some(thread) => thread,
        None => {
            let created = api.create_thread().await?;
            info!(
                "Created assistants thread {} for conversation {}",
                created, conversation_id
            );
            pending.record(conversation_id, TokenKind::AssistantsThread, &created);
            created
        }
    };

    api.add_message(&thread, prompt).await?;
    let mut run = api.start_run(&thread, assistant_id).await?;
    let deadline = Instant::now() + snapshot.timeout();

    loop {
        match run.status.as_str() {
            "completed" => break,
            "queued" | "in_progress" | "requires_action" => {
                if Instant::now() >= deadline {
                    return Err(BackendError::Timeout(snapshot.timeout_secs));
                }
                tokio::time::sleep(RUN_POLL_INTERVAL).await;
                run = api.run_status(&thread, &run.id).await?;
                debug!("Run {} on thread {} is {}", run.id, thread, run.status);
            }
            other => return Err(BackendError::RunFailed(other.to_string())),
        }
    }

    api.latest_reply(&thread).await
}
