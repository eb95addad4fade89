use crate::error::BackendError;
use crate::identity::BotIdentityResolver;
use crate::settings::{ConfigSnapshot, ReplyMode};
use crate::state::PendingState;
use crate::store::StoreHandle;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{info, warn};

mod agents;
mod assistants;
mod chat;
mod session;

pub use agents::{AgentRequest, AgentRunner, AgentsBackend, RigAgentRunner};
pub use session::{SessionStore, SessionTurn};

/// Posted in place of a reply whenever no backend produced usable text.
pub const NO_RESPONSE_TEXT: &str = "Could not obtain a response from the model.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Chat,
    Assistants,
    Agents,
}

impl Backend {
    /// Backends to try, in order, for a configured mode. Assistants failures
    /// are final; agents failures get one chat attempt.
    pub fn fallback_chain(mode: ReplyMode) -> &'static [Backend] {
        match mode {
            ReplyMode::Chat => &[Backend::Chat],
            ReplyMode::Assistants => &[Backend::Assistants],
            ReplyMode::Agents => &[Backend::Agents, Backend::Chat],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Chat => "chat",
            Backend::Assistants => "assistants",
            Backend::Agents => "agents",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub conversation_id: i64,
    pub prompt: String,
    /// Left out of the chat context, e.g. a placeholder awaiting deletion.
    pub exclude_message_id: Option<i64>,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Produces non-empty reply text or an error. Reads use short read
    /// transactions that end before any backend call; continuation tokens
    /// created on the way go into `pending` for the caller to write.
    async fn generate(
        &self,
        store: &StoreHandle,
        request: &ReplyRequest,
        pending: &mut PendingState,
    ) -> Result<String, BackendError>;
}

pub struct ResponseGenerator {
    http: reqwest::Client,
    identity: Arc<BotIdentityResolver>,
    agents: AgentsBackend,
}

impl ResponseGenerator {
    pub fn new(
        identity: Arc<BotIdentityResolver>,
        runner: Arc<dyn AgentRunner>,
        sessions: SessionStore,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            identity,
            agents: AgentsBackend::new(runner, sessions),
        }
    }

    async fn run_backend(
        &self,
        backend: Backend,
        store: &StoreHandle,
        pending: &mut PendingState,
        snapshot: &ConfigSnapshot,
        request: &ReplyRequest,
    ) -> Result<String, BackendError> {
        match backend {
            Backend::Chat => {
                let bot = self.identity.get_or_create().await?;
                let messages = chat::load_context(store, snapshot, request, bot.id).await?;
                chat::complete(&self.http, snapshot, &messages).await
            }
            Backend::Assistants => {
                assistants::reply(
                    &self.http,
                    store,
                    pending,
                    snapshot,
                    request.conversation_id,
                    &request.prompt,
                )
                .await
            }
            Backend::Agents => {
                self.agents
                    .reply(
                        store,
                        pending,
                        snapshot,
                        request.conversation_id,
                        &request.prompt,
                    )
                    .await
            }
        }
    }
}

#[async_trait]
impl ReplyGenerator for ResponseGenerator {
    async fn generate(
        &self,
        store: &StoreHandle,
        request: &ReplyRequest,
        pending: &mut PendingState,
    ) -> Result<String, BackendError> {
        let mut tx = store.begin_read().await?;
        let snapshot = ConfigSnapshot::load(tx.as_mut()).await?;
        tx.rollback().await?;

        let chain = Backend::fallback_chain(snapshot.mode);
        let mut last_error = None;

        for backend in chain {
            match self
                .run_backend(*backend, store, pending, &snapshot, request)
                .await
            {
                Ok(text) if !text.trim().is_empty() => {
                    info!(
                        "Generated reply for conversation {} via {} backend ({} chars)",
                        request.conversation_id,
                        backend.name(),
                        text.len()
                    );
                    return Ok(text);
                }
                Ok(_) => {
                    warn!("{} backend returned an empty reply", backend.name());
                    last_error = Some(BackendError::Malformed("empty reply".to_string()));
                }
                Err(e) => {
                    warn!("{} backend failed: {}", backend.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackendError::Config("no backend configured".into())))
    }
}

fn require_api_key(snapshot: &ConfigSnapshot) -> Result<&str, BackendError> {
    snapshot
        .api_key
        .as_deref()
        .ok_or_else(|| BackendError::Config("API key is not set".to_string()))
}

/// Sends `request` and decodes a JSON body, mapping HTTP error statuses,
/// timeouts and undecodable payloads to distinct errors.
async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    timeout_secs: u64,
) -> Result<T, BackendError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            BackendError::Timeout(timeout_secs)
        } else {
            BackendError::from(e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Http {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ConversationState, TokenKind};
    use crate::store::{ConversationKind, NewMessage, SqliteStore};
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct FailingRunner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentRunner for FailingRunner {
        async fn run(&self, request: AgentRequest<'_>) -> Result<String, BackendError> {
            self.calls.lock().unwrap().push(request.model.to_string());
            Err(BackendError::Agent("runner unavailable".into()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: StoreHandle,
        generator: ResponseGenerator,
        runner: Arc<FailingRunner>,
        conversation_id: i64,
    }

    async fn fixture(settings: &[(&str, String)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: StoreHandle = SqliteStore::open(dir.path()).await.unwrap();
        let identity = Arc::new(BotIdentityResolver::new(store.clone()));
        let bot = identity.get_or_create().await.unwrap();
        let runner = Arc::new(FailingRunner {
            calls: Mutex::new(Vec::new()),
        });
        let generator = ResponseGenerator::new(
            identity,
            runner.clone(),
            SessionStore::new(dir.path()),
        );

        let mut tx = store.begin().await.unwrap();
        for (key, value) in settings {
            tx.put_setting(key, value).await.unwrap();
        }
        let conversation = tx
            .create_conversation("general", ConversationKind::Group, &[bot.id, 100])
            .await
            .unwrap();
        tx.insert_message(NewMessage {
            conversation_id: conversation.id,
            author_id: Some(100),
            body: "/ai hello".into(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        Fixture {
            _dir: dir,
            store,
            generator,
            runner,
            conversation_id: conversation.id,
        }
    }

    fn request(conversation_id: i64) -> ReplyRequest {
        ReplyRequest {
            conversation_id,
            prompt: "hello".into(),
            exclude_message_id: None,
        }
    }

    #[test]
    fn fallback_chains() {
        assert_eq!(Backend::fallback_chain(ReplyMode::Chat), &[Backend::Chat]);
        assert_eq!(
            Backend::fallback_chain(ReplyMode::Assistants),
            &[Backend::Assistants]
        );
        assert_eq!(
            Backend::fallback_chain(ReplyMode::Agents),
            &[Backend::Agents, Backend::Chat]
        );
    }

    #[tokio::test]
    async fn agents_failure_falls_back_to_chat() {
        let server = MockServer::start_async().await;
        let completion = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"role": "assistant", "content": "from chat"}}]
                }));
            })
            .await;

        let fx = fixture(&[
            ("api_key", "sk-test".into()),
            ("base_url", server.base_url()),
            ("mode", "agents".into()),
            ("model", "broken-model".into()),
        ])
        .await;

        let reply = fx
            .generator
            .generate(&fx.store, &request(fx.conversation_id), &mut PendingState::new())
            .await
            .unwrap();

        assert_eq!(reply, "from chat");
        completion.assert_async().await;
        let calls = fx.runner.calls.lock().unwrap().clone();
        assert_eq!(calls, ["broken-model", "gpt-4o-mini"]);
    }

    #[tokio::test]
    async fn assistants_failure_does_not_fall_back() {
        let server = MockServer::start_async().await;
        let completion = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"content": "should not be used"}}]
                }));
            })
            .await;
        let threads = server
            .mock_async(|when, then| {
                when.method(POST).path("/threads");
                then.status(500).body("upstream down");
            })
            .await;

        let fx = fixture(&[
            ("api_key", "sk-test".into()),
            ("base_url", server.base_url()),
            ("mode", "assistants".into()),
            ("assistant_id", "asst_1".into()),
        ])
        .await;

        let mut pending = PendingState::new();
        let err = fx
            .generator
            .generate(&fx.store, &request(fx.conversation_id), &mut pending)
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::Http { status: 500, .. }));
        threads.assert_async().await;
        assert_eq!(completion.hits_async().await, 0);
    }

    #[tokio::test]
    async fn empty_chat_reply_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"content": "   "}}]
                }));
            })
            .await;

        let fx = fixture(&[("api_key", "sk-test".into()), ("base_url", server.base_url())]).await;

        let result = fx
            .generator
            .generate(&fx.store, &request(fx.conversation_id), &mut PendingState::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn new_thread_is_left_for_the_caller_to_store() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/threads");
                then.status(200).json_body(json!({"id": "thread_9"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/threads/thread_9/messages");
                then.status(200).json_body(json!({"id": "msg_1"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/threads/thread_9/runs");
                then.status(200)
                    .json_body(json!({"id": "run_1", "status": "completed"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/threads/thread_9/messages");
                then.status(200).json_body(json!({"data": [
                    {"role": "assistant", "content": [{"type": "text", "text": {"value": "hi there"}}]}
                ]}));
            })
            .await;

        let fx = fixture(&[
            ("api_key", "sk-test".into()),
            ("base_url", server.base_url()),
            ("mode", "assistants".into()),
            ("assistant_id", "asst_1".into()),
        ])
        .await;

        let mut pending = PendingState::new();
        let reply = fx
            .generator
            .generate(&fx.store, &request(fx.conversation_id), &mut pending)
            .await
            .unwrap();

        assert_eq!(reply, "hi there");
        assert_eq!(
            pending.get(fx.conversation_id, TokenKind::AssistantsThread),
            Some("thread_9")
        );
        let stored = ConversationState::lookup(
            &fx.store,
            &PendingState::new(),
            fx.conversation_id,
            TokenKind::AssistantsThread,
        )
        .await
        .unwrap();
        assert_eq!(stored, None);
    }
}
