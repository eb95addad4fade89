use crate::error::StoreError;
use crate::settings::ConfigSnapshot;
use crate::store::{NewMessage, StoreHandle, StoreTx};
use crate::worker::{ReplyJob, WorkerPool};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PLACEHOLDER_TEXT: &str = "Thinking...";
pub const MISSING_KEY_TEXT: &str =
    "AI replies are enabled but no API key is configured. Set `api_key` to use them.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// A job will reach the pool once the transaction commits.
    Deferred { placeholder_id: Option<i64> },
    /// No credentials; an error note was posted instead.
    MissingCredentials,
}

/// Hands reply jobs to the worker pool once the triggering transaction has
/// committed.
pub struct ReplyScheduler {
    pool: Arc<WorkerPool>,
    store: StoreHandle,
}

impl ReplyScheduler {
    pub fn new(pool: Arc<WorkerPool>, store: StoreHandle) -> Arc<Self> {
        Arc::new(Self { pool, store })
    }

    pub async fn schedule(
        &self,
        tx: &mut dyn StoreTx,
        snapshot: &ConfigSnapshot,
        conversation_id: i64,
        prompt: String,
        bot_id: i64,
    ) -> Result<Scheduled, StoreError> {
        if !snapshot.has_credentials() {
            warn!(
                "Reply requested in conversation {} but no API key is configured",
                conversation_id
            );
            tx.insert_message(NewMessage {
                conversation_id,
                author_id: Some(bot_id),
                body: MISSING_KEY_TEXT.to_string(),
            })
            .await?;
            return Ok(Scheduled::MissingCredentials);
        }

        let placeholder_id = if snapshot.placeholder {
            let placeholder = tx
                .insert_message(NewMessage {
                    conversation_id,
                    author_id: Some(bot_id),
                    body: PLACEHOLDER_TEXT.to_string(),
                })
                .await?;
            Some(placeholder.id)
        } else {
            None
        };

        let job = ReplyJob {
            conversation_id,
            prompt,
            placeholder_id,
            bot_id,
            store: self.store.clone(),
        };
        let pool = self.pool.clone();
        tx.on_commit(Box::new(move || {
            pool.submit(job);
        }));
        debug!(
            "Reply for conversation {} deferred until commit",
            conversation_id
        );

        Ok(Scheduled::Deferred { placeholder_id })
    }
}
