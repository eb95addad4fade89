use crate::error::{BackendError, StoreError};
use crate::generator::{NO_RESPONSE_TEXT, ReplyGenerator, ReplyRequest};
use crate::state::PendingState;
use crate::store::{NewMessage, StoreHandle, StoreTx};
use crate::utils::preview;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

mod lock;
mod pool;

pub use lock::AdvisoryLock;
pub use pool::WorkerPool;

/// Everything a worker needs, copied out of the triggering request.
#[derive(Clone)]
pub struct ReplyJob {
    pub conversation_id: i64,
    pub prompt: String,
    pub placeholder_id: Option<i64>,
    pub bot_id: i64,
    pub store: StoreHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Posted { message_id: i64, attempts: u32 },
    /// Another worker held the conversation lock for the whole wait.
    LockTimeout,
    Abandoned(String),
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_attempts: u32,
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lock_timeout: Duration::from_secs(5),
            lock_poll: Duration::from_millis(200),
            backoff_min: Duration::from_millis(250),
            backoff_max: Duration::from_millis(500),
        }
    }
}

impl CoordinatorSettings {
    fn backoff(&self) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = (self.backoff_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

enum Attempt {
    Posted(i64),
    LockTimeout,
    Conflict(StoreError),
    Fatal(String),
}

impl From<StoreError> for Attempt {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            Attempt::Conflict(err)
        } else {
            Attempt::Fatal(err.to_string())
        }
    }
}

/// Runs the lock, generate, post and commit loop for one reply. Generation
/// happens with no transaction open; the reply is written in a short write
/// transaction afterwards.
pub struct WorkerCoordinator {
    generator: Arc<dyn ReplyGenerator>,
    settings: CoordinatorSettings,
}

impl WorkerCoordinator {
    pub fn new(generator: Arc<dyn ReplyGenerator>, settings: CoordinatorSettings) -> Arc<Self> {
        Arc::new(Self {
            generator,
            settings,
        })
    }

    pub async fn run(&self, job: ReplyJob) -> ReplyOutcome {
        let max_attempts = self.settings.max_attempts.max(1);
        // Survives retries so a thread or session created once is reused.
        let mut pending = PendingState::new();

        for attempt in 1..=max_attempts {
            let holder = format!("reply-worker-{}", Uuid::new_v4());
            match self.attempt(&job, &holder, &mut pending).await {
                Attempt::Posted(message_id) => {
                    info!(
                        "Posted reply {} in conversation {} (attempt {})",
                        message_id, job.conversation_id, attempt
                    );
                    return ReplyOutcome::Posted {
                        message_id,
                        attempts: attempt,
                    };
                }
                Attempt::LockTimeout => {
                    warn!(
                        "Conversation {} stayed locked for {:?}, dropping trigger",
                        job.conversation_id, self.settings.lock_timeout
                    );
                    return ReplyOutcome::LockTimeout;
                }
                Attempt::Conflict(e) => {
                    warn!(
                        "Write conflict on conversation {} (attempt {}/{}): {}",
                        job.conversation_id, attempt, max_attempts, e
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.backoff()).await;
                    }
                }
                Attempt::Fatal(e) => {
                    error!(
                        "Reply for conversation {} abandoned: {}",
                        job.conversation_id, e
                    );
                    return ReplyOutcome::Abandoned(e);
                }
            }
        }

        error!(
            "Reply for conversation {} not posted after {} attempts",
            job.conversation_id, max_attempts
        );
        ReplyOutcome::Exhausted
    }

    async fn attempt(&self, job: &ReplyJob, holder: &str, pending: &mut PendingState) -> Attempt {
        let lock = match AdvisoryLock::acquire(
            &job.store,
            job.conversation_id,
            holder,
            self.settings.lock_timeout,
            self.settings.lock_poll,
        )
        .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => return Attempt::LockTimeout,
            Err(e) => return e.into(),
        };

        let outcome = match self.reply_text(job, pending).await {
            Ok(text) => self.post_reply(job, pending, text).await,
            Err(e) => e.into(),
        };

        lock.release().await;
        outcome
    }

    /// Generator output, or the fallback notice when it failed. Only a write
    /// conflict is passed on, so the attempt can be retried.
    async fn reply_text(
        &self,
        job: &ReplyJob,
        pending: &mut PendingState,
    ) -> Result<String, StoreError> {
        let request = ReplyRequest {
            conversation_id: job.conversation_id,
            prompt: job.prompt.clone(),
            exclude_message_id: job.placeholder_id,
        };

        match self.generator.generate(&job.store, &request, pending).await {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) => {
                warn!("Generator returned empty text, posting fallback notice");
                Ok(NO_RESPONSE_TEXT.to_string())
            }
            Err(BackendError::Store(e)) if e.is_conflict() => Err(e),
            Err(e) => {
                warn!(
                    "Reply generation failed for conversation {} (prompt '{}'): {}",
                    job.conversation_id,
                    preview(&job.prompt, 60),
                    e
                );
                Ok(NO_RESPONSE_TEXT.to_string())
            }
        }
    }

    async fn post_reply(&self, job: &ReplyJob, pending: &PendingState, text: String) -> Attempt {
        let mut tx = match job.store.begin().await {
            Ok(tx) => tx,
            Err(e) => return e.into(),
        };

        match self.write_reply(tx.as_mut(), job, pending, text).await {
            Ok(message_id) => match tx.commit().await {
                Ok(()) => Attempt::Posted(message_id),
                Err(e) => e.into(),
            },
            Err(e) => {
                rollback(tx).await;
                e.into()
            }
        }
    }

    async fn write_reply(
        &self,
        tx: &mut dyn StoreTx,
        job: &ReplyJob,
        pending: &PendingState,
        text: String,
    ) -> Result<i64, StoreError> {
        pending.apply(tx).await?;

        if let Some(placeholder_id) = job.placeholder_id {
            match tx.delete_message(placeholder_id).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => return Err(e),
                Err(e) => warn!("Failed to delete placeholder {}: {}", placeholder_id, e),
            }
        }

        tx.lock_conversation_rows(job.conversation_id).await?;
        let message = tx
            .insert_message(NewMessage {
                conversation_id: job.conversation_id,
                author_id: Some(job.bot_id),
                body: text,
            })
            .await?;
        Ok(message.id)
    }
}

async fn rollback(tx: Box<dyn StoreTx>) {
    if let Err(e) = tx.rollback().await {
        warn!("Rollback failed: {}", e);
    }
}
