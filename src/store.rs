use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(test)]
pub mod flaky;
mod sqlite;

pub use sqlite::SqliteStore;

/// Opaque datastore handle carried into background work.
pub type StoreHandle = Arc<dyn Datastore>;

/// Runs once the owning transaction has durably committed.
pub type CommitHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Group,
    Direct,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Group => "group",
            ConversationKind::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "group" => Some(ConversationKind::Group),
            "direct" => Some(ConversationKind::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub marker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub name: String,
    pub kind: ConversationKind,
    pub members: Vec<i64>,
}

impl Conversation {
    /// A one-to-one conversation between `identity_id` and exactly one other member.
    pub fn is_direct_with(&self, identity_id: i64) -> bool {
        self.kind == ConversationKind::Direct
            && self.members.len() == 2
            && self.members.contains(&identity_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub author_id: Option<i64>,
    pub body: String,
    pub created_us: i64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub author_id: Option<i64>,
    pub body: String,
}

/// Connection-level operations. Everything here commits on its own and is
/// visible to every other connection immediately.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Write transaction. Takes the database write lock when it opens, so
    /// commits made elsewhere after that point cannot invalidate it.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Read transaction. Its snapshot starts at the first read; keep it short
    /// and never hold it across a network call.
    async fn begin_read(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Non-blocking attempt to take the advisory lock `key` for `holder`.
    async fn try_advisory_lock(&self, key: i64, holder: &str) -> Result<bool, StoreError>;
    async fn advisory_unlock(&self, key: i64, holder: &str) -> Result<(), StoreError>;

    async fn find_identity_by_marker(&self, marker: &str) -> Result<Option<Identity>, StoreError>;
    async fn create_identity(
        &self,
        name: &str,
        marker: Option<&str>,
    ) -> Result<Identity, StoreError>;
}

/// One open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    async fn settings(&mut self) -> Result<HashMap<String, String>, StoreError>;
    async fn put_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn create_conversation(
        &mut self,
        name: &str,
        kind: ConversationKind,
        members: &[i64],
    ) -> Result<Conversation, StoreError>;
    async fn conversation(&mut self, id: i64) -> Result<Option<Conversation>, StoreError>;

    /// The newest `limit` messages with a non-blank body, returned oldest
    /// first.
    async fn recent_messages(
        &mut self,
        conversation_id: i64,
        limit: u64,
        exclude: Option<i64>,
    ) -> Result<Vec<Message>, StoreError>;
    async fn insert_message(&mut self, message: NewMessage) -> Result<Message, StoreError>;
    async fn delete_message(&mut self, id: i64) -> Result<bool, StoreError>;

    /// Exclusive locks on the conversation row and its membership rows, held
    /// until the transaction ends.
    async fn lock_conversation_rows(&mut self, conversation_id: i64) -> Result<(), StoreError>;

    async fn continuation_token(
        &mut self,
        conversation_id: i64,
        backend: &str,
    ) -> Result<Option<String>, StoreError>;
    async fn insert_continuation_token(
        &mut self,
        conversation_id: i64,
        backend: &str,
        token: &str,
    ) -> Result<(), StoreError>;
    async fn clear_continuation_tokens(&mut self, conversation_id: i64)
    -> Result<u64, StoreError>;

    fn on_commit(&mut self, hook: CommitHook);

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
