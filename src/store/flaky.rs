use super::{
    CommitHook, Conversation, ConversationKind, Datastore, Identity, Message, NewMessage,
    StoreHandle, StoreTx,
};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wraps a real datastore and fails the first `conflicts` commits with a
/// write conflict. Can also make every settings read fail.
pub struct FlakyStore {
    inner: StoreHandle,
    conflicts_left: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
    broken_settings: bool,
}

impl FlakyStore {
    pub fn new(inner: StoreHandle, conflicts: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            conflicts_left: Arc::new(AtomicUsize::new(conflicts)),
            commits: Arc::new(AtomicUsize::new(0)),
            broken_settings: false,
        })
    }

    /// Commits go through, but `settings()` fails in every transaction.
    pub fn with_broken_settings(inner: StoreHandle) -> Arc<Self> {
        Arc::new(Self {
            inner,
            conflicts_left: Arc::new(AtomicUsize::new(0)),
            commits: Arc::new(AtomicUsize::new(0)),
            broken_settings: true,
        })
    }

    fn wrap(&self, inner: Box<dyn StoreTx>) -> Box<dyn StoreTx> {
        Box::new(FlakyTx {
            inner,
            conflicts_left: self.conflicts_left.clone(),
            commits: self.commits.clone(),
            broken_settings: self.broken_settings,
        })
    }

    /// Commits that actually reached the database.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Datastore for FlakyStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(self.wrap(self.inner.begin().await?))
    }

    async fn begin_read(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(self.wrap(self.inner.begin_read().await?))
    }

    async fn try_advisory_lock(&self, key: i64, holder: &str) -> Result<bool, StoreError> {
        self.inner.try_advisory_lock(key, holder).await
    }

    async fn advisory_unlock(&self, key: i64, holder: &str) -> Result<(), StoreError> {
        self.inner.advisory_unlock(key, holder).await
    }

    async fn find_identity_by_marker(&self, marker: &str) -> Result<Option<Identity>, StoreError> {
        self.inner.find_identity_by_marker(marker).await
    }

    async fn create_identity(
        &self,
        name: &str,
        marker: Option<&str>,
    ) -> Result<Identity, StoreError> {
        self.inner.create_identity(name, marker).await
    }
}

struct FlakyTx {
    inner: Box<dyn StoreTx>,
    conflicts_left: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
    broken_settings: bool,
}

#[async_trait]
impl StoreTx for FlakyTx {
    async fn settings(&mut self) -> Result<HashMap<String, String>, StoreError> {
        if self.broken_settings {
            return Err(StoreError::Database("settings table unavailable".into()));
        }
        self.inner.settings().await
    }

    async fn put_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.put_setting(key, value).await
    }

    async fn create_conversation(
        &mut self,
        name: &str,
        kind: ConversationKind,
        members: &[i64],
    ) -> Result<Conversation, StoreError> {
        self.inner.create_conversation(name, kind, members).await
    }

    async fn conversation(&mut self, id: i64) -> Result<Option<Conversation>, StoreError> {
        self.inner.conversation(id).await
    }

    async fn recent_messages(
        &mut self,
        conversation_id: i64,
        limit: u64,
        exclude: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        self.inner
            .recent_messages(conversation_id, limit, exclude)
            .await
    }

    async fn insert_message(&mut self, message: NewMessage) -> Result<Message, StoreError> {
        self.inner.insert_message(message).await
    }

    async fn delete_message(&mut self, id: i64) -> Result<bool, StoreError> {
        self.inner.delete_message(id).await
    }

    async fn lock_conversation_rows(&mut self, conversation_id: i64) -> Result<(), StoreError> {
        self.inner.lock_conversation_rows(conversation_id).await
    }

    async fn continuation_token(
        &mut self,
        conversation_id: i64,
        backend: &str,
    ) -> Result<Option<String>, StoreError> {
        self.inner.continuation_token(conversation_id, backend).await
    }

    async fn insert_continuation_token(
        &mut self,
        conversation_id: i64,
        backend: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .insert_continuation_token(conversation_id, backend, token)
            .await
    }

    async fn clear_continuation_tokens(
        &mut self,
        conversation_id: i64,
    ) -> Result<u64, StoreError> {
        self.inner.clear_continuation_tokens(conversation_id).await
    }

    fn on_commit(&mut self, hook: CommitHook) {
        self.inner.on_commit(hook);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let injected = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.inner.rollback().await?;
            return Err(StoreError::Conflict("injected serialization failure".into()));
        }
        self.inner.commit().await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}
