use super::require_api_key;
use super::session::{SessionStore, SessionTurn, TurnRole};
use crate::error::BackendError;
use crate::settings::{ConfigSnapshot, DEFAULT_MODEL};
use crate::state::{ConversationState, PendingState, TokenKind};
use crate::store::StoreHandle;
use async_trait::async_trait;
use rig::{
    client::CompletionClient,
    completion::{Chat, Message},
    providers::openai,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Model used for the single retry after the configured one fails.
pub const FALLBACK_AGENT_MODEL: &str = DEFAULT_MODEL;

#[derive(Debug, Clone, Copy)]
pub struct AgentRequest<'a> {
    pub snapshot: &'a ConfigSnapshot,
    pub model: &'a str,
    pub instructions: &'a str,
    pub prompt: &'a str,
    pub history: &'a [SessionTurn],
    /// `None` asks the runner to run unbounded.
    pub timeout: Option<Duration>,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Returns the agent's final text output. Runners that cannot honour
    /// `timeout` fail with `BackendError::UnsupportedOption("timeout")`.
    async fn run(&self, request: AgentRequest<'_>) -> Result<String, BackendError>;
}

/// Runs a single-turn rig agent against the OpenAI-compatible endpoint.
pub struct RigAgentRunner;

#[async_trait]
impl AgentRunner for RigAgentRunner {
    async fn run(&self, request: AgentRequest<'_>) -> Result<String, BackendError> {
        let snapshot = request.snapshot;
        let api_key = require_api_key(snapshot)?;

        let client: openai::CompletionsClient = openai::CompletionsClient::builder()
            .api_key(api_key)
            .base_url(&snapshot.base_url)
            .build()
            .map_err(|e| BackendError::Agent(e.to_string()))?;

        let agent = client
            .agent(request.model)
            .preamble(request.instructions)
            .temperature(snapshot.temperature)
            .build();

        let history: Vec<Message> = request
            .history
            .iter()
            .map(|turn| match turn.role {
                TurnRole::User => Message::user(turn.content.as_str()),
                TurnRole::Assistant => Message::assistant(turn.content.as_str()),
            })
            .collect();

        let call = async {
            agent
                .chat(request.prompt, history)
                .await
                .map_err(|e| BackendError::Agent(e.to_string()))
        };

        match request.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| BackendError::Timeout(limit.as_secs()))?,
            None => call.await,
        }
    }
}

/// Agent-mode backend: durable per-conversation session plus a runner.
pub struct AgentsBackend {
    runner: Arc<dyn AgentRunner>,
    sessions: SessionStore,
}

impl AgentsBackend {
    pub fn new(runner: Arc<dyn AgentRunner>, sessions: SessionStore) -> Self {
        Self { runner, sessions }
    }

    /// A session handle the conversation does not have yet is recorded in
    /// `pending`.
    pub async fn reply(
        &self,
        store: &StoreHandle,
        pending: &mut PendingState,
        snapshot: &ConfigSnapshot,
        conversation_id: i64,
        prompt: &str,
    ) -> Result<String, BackendError> {
        let stored =
            ConversationState::lookup(store, pending, conversation_id, TokenKind::AgentSession)
                .await?;
        let handle = match stored {
            Some(handle) => handle,
            None => {
                let handle = SessionStore::handle_for(conversation_id);
                pending.record(conversation_id, TokenKind::AgentSession, &handle);
                handle
            }
        };
        let history = self.sessions.load(&handle).await?;

        let model = snapshot.agent_model.as_deref().unwrap_or(&snapshot.model);
        let instructions = snapshot
            .agent_instructions
            .as_deref()
            .unwrap_or(&snapshot.system_prompt);
        let request = AgentRequest {
            snapshot,
            model,
            instructions,
            prompt,
            history: &history,
            timeout: Some(snapshot.timeout()),
        };

        let output = match self.run_once(request).await {
            Ok(output) => output,
            Err(e) if model == FALLBACK_AGENT_MODEL => return Err(e),
            Err(e) => {
                warn!(
                    "Agent run with model {} failed ({}), retrying with {}",
                    model, e, FALLBACK_AGENT_MODEL
                );
                self.run_once(AgentRequest {
                    model: FALLBACK_AGENT_MODEL,
                    ..request
                })
                .await?
            }
        };

        if output.trim().is_empty() {
            return Err(BackendError::Malformed("agent produced no text".to_string()));
        }

        let turns = [SessionTurn::user(prompt), SessionTurn::assistant(&output)];
        if let Err(e) = self.sessions.append(&handle, &turns).await {
            warn!("Failed to save agent session {}: {}", handle, e);
        }
        info!(
            "Agent replied in conversation {} ({} prior turns)",
            conversation_id,
            history.len()
        );
        Ok(output)
    }

    /// One runner call, repeated without a timeout if the runner refuses one.
    async fn run_once(&self, request: AgentRequest<'_>) -> Result<String, BackendError> {
        match self.runner.run(request).await {
            Err(BackendError::UnsupportedOption("timeout")) if request.timeout.is_some() => {
                warn!("Agent runner does not support timeouts, running without one");
                self.runner
                    .run(AgentRequest {
                        timeout: None,
                        ..request
                    })
                    .await
            }
            other => other,
        }
    }
}
