use crate::error::StoreError;
use crate::store::{StoreHandle, StoreTx};
use tracing::warn;

/// Which backend a continuation token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    AssistantsThread,
    AgentSession,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::AssistantsThread => "assistants",
            TokenKind::AgentSession => "agents",
        }
    }
}

/// Tokens created while generating a reply. Nothing is written until the
/// reply itself is, so the token commits or rolls back with it.
#[derive(Debug, Default)]
pub struct PendingState {
    tokens: Vec<(i64, TokenKind, String)>,
}

impl PendingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the first token recorded for a slot.
    pub fn record(&mut self, conversation_id: i64, kind: TokenKind, token: &str) {
        if self.get(conversation_id, kind).is_none() {
            self.tokens.push((conversation_id, kind, token.to_string()));
        }
    }

    pub fn get(&self, conversation_id: i64, kind: TokenKind) -> Option<&str> {
        self.tokens
            .iter()
            .find(|(id, k, _)| *id == conversation_id && *k == kind)
            .map(|(_, _, token)| token.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Writes every recorded token into `tx`. Slots that were filled in the
    /// meantime keep their existing token.
    pub async fn apply(&self, tx: &mut dyn StoreTx) -> Result<(), StoreError> {
        for (conversation_id, kind, token) in &self.tokens {
            ConversationState::set(tx, *conversation_id, *kind, token).await?;
        }
        Ok(())
    }
}

/// Per-conversation continuation tokens. Writes go through the caller's
/// transaction so they commit or roll back with the reply.
pub struct ConversationState;

impl ConversationState {
    /// Pending tokens first, then a short read of the stored one.
    pub async fn lookup(
        store: &StoreHandle,
        pending: &PendingState,
        conversation_id: i64,
        kind: TokenKind,
    ) -> Result<Option<String>, StoreError> {
        if let Some(token) = pending.get(conversation_id, kind) {
            return Ok(Some(token.to_string()));
        }
        let mut tx = store.begin_read().await?;
        let token = Self::get(tx.as_mut(), conversation_id, kind).await?;
        tx.rollback().await?;
        Ok(token)
    }

    pub async fn get(
        tx: &mut dyn StoreTx,
        conversation_id: i64,
        kind: TokenKind,
    ) -> Result<Option<String>, StoreError> {
        tx.continuation_token(conversation_id, kind.as_str()).await
    }

    /// Stores `token` unless the slot is already populated. Returns the token
    /// that is live afterwards.
    pub async fn set(
        tx: &mut dyn StoreTx,
        conversation_id: i64,
        kind: TokenKind,
        token: &str,
    ) -> Result<String, StoreError> {
        if let Some(existing) = Self::get(tx, conversation_id, kind).await? {
            if existing != token {
                warn!(
                    "Conversation {} already has a {} token, keeping it",
                    conversation_id,
                    kind.as_str()
                );
            }
            return Ok(existing);
        }

        tx.insert_continuation_token(conversation_id, kind.as_str(), token)
            .await?;
        Ok(token.to_string())
    }

    /// Administrative reset; the reply path never calls this.
    pub async fn clear(tx: &mut dyn StoreTx, conversation_id: i64) -> Result<u64, StoreError> {
        tx.clear_continuation_tokens(conversation_id).await
    }
}
