use super::{ReplyRequest, require_api_key, send_json};
use crate::error::BackendError;
use crate::settings::ConfigSnapshot;
use crate::store::{Message, StoreHandle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// System prompt, then `history` (already bounded and oldest first), then
/// the new prompt. Messages written by `bot_id` become assistant turns.
pub fn assemble_messages(
    system_prompt: &str,
    history: &[Message],
    bot_id: i64,
    prompt: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    let system_prompt = system_prompt.trim();
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::new(Role::System, system_prompt));
    }

    for message in history {
        let content = message.body.trim();
        if content.is_empty() {
            continue;
        }
        let role = if message.author_id == Some(bot_id) {
            Role::Assistant
        } else {
            Role::User
        };
        messages.push(ChatMessage::new(role, content));
    }

    if !prompt.is_empty() {
        messages.push(ChatMessage::new(Role::User, prompt));
    }

    messages
}

pub async fn load_context(
    store: &StoreHandle,
    snapshot: &ConfigSnapshot,
    request: &ReplyRequest,
    bot_id: i64,
) -> Result<Vec<ChatMessage>, BackendError> {
    let mut tx = store.begin_read().await?;
    let history = tx
        .recent_messages(
            request.conversation_id,
            snapshot.context_count,
            request.exclude_message_id,
        )
        .await?;
    tx.rollback().await?;
    Ok(assemble_messages(
        &snapshot.system_prompt,
        &history,
        bot_id,
        &request.prompt,
    ))
}

pub async fn complete(
    http: &reqwest::Client,
    snapshot: &ConfigSnapshot,
    messages: &[ChatMessage],
) -> Result<String, BackendError> {
    let api_key = require_api_key(snapshot)?;
    let url = format!("{}/chat/completions", snapshot.base_url);

    let payload = json!({
        "model": snapshot.model,
        "messages": messages,
        "temperature": snapshot.temperature,
    });
    debug!("Chat completion request to {} ({} messages)", url, messages.len());

    let mut request = http
        .post(&url)
        .bearer_auth(api_key)
        .timeout(snapshot.timeout())
        .json(&payload);
    if let Some(organization) = &snapshot.organization {
        request = request.header("OpenAI-Organization", organization);
    }

    let response: CompletionResponse = send_json(request, snapshot.timeout_secs).await?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| BackendError::Malformed("completion has no message content".to_string()))
}
