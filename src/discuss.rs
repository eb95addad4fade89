use crate::error::StoreError;
use crate::identity::BotIdentityResolver;
use crate::scheduler::{ReplyScheduler, Scheduled};
use crate::settings::ConfigSnapshot;
use crate::store::{Conversation, Identity, Message, NewMessage, StoreHandle, StoreTx};
use crate::trigger;
use crate::utils::preview;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tries at writing one post before a write conflict is handed back.
const POST_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostOptions {
    /// Write the message without running trigger detection.
    pub skip_ai: bool,
}

#[derive(Debug, Clone)]
pub struct Posted {
    pub message: Message,
    pub reply: Option<Scheduled>,
}

/// The inbound "post a message" operation.
pub struct Discuss {
    store: StoreHandle,
    identity: Arc<BotIdentityResolver>,
    scheduler: Arc<ReplyScheduler>,
}

impl Discuss {
    pub fn new(
        store: StoreHandle,
        identity: Arc<BotIdentityResolver>,
        scheduler: Arc<ReplyScheduler>,
    ) -> Self {
        Self {
            store,
            identity,
            scheduler,
        }
    }

    pub async fn post_message(
        &self,
        conversation_id: i64,
        author_id: Option<i64>,
        body: &str,
        options: PostOptions,
    ) -> Result<Posted, StoreError> {
        // Resolved before the transaction opens; creation commits on its own.
        let bot = self.identity.get_or_create().await?;

        let mut attempt = 1;
        loop {
            match self
                .write_post(conversation_id, author_id, body, options, &bot)
                .await
            {
                Err(e) if e.is_conflict() && attempt < POST_ATTEMPTS => {
                    warn!(
                        "Write conflict posting to conversation {} (attempt {}/{}): {}",
                        conversation_id, attempt, POST_ATTEMPTS, e
                    );
                    let jitter = rand::rng().random_range(50..=150);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn write_post(
        &self,
        conversation_id: i64,
        author_id: Option<i64>,
        body: &str,
        options: PostOptions,
        bot: &Identity,
    ) -> Result<Posted, StoreError> {
        let mut tx = self.store.begin().await?;
        let conversation = tx
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;
        let message = tx
            .insert_message(NewMessage {
                conversation_id,
                author_id,
                body: body.to_string(),
            })
            .await?;

        let reply = if options.skip_ai {
            None
        } else {
            match self
                .handle_trigger(tx.as_mut(), &conversation, &message, bot)
                .await
            {
                Ok(reply) => reply,
                Err(e) if e.is_conflict() => return Err(e),
                Err(e) => {
                    warn!(
                        "Failed to schedule AI reply for message {}: {}",
                        message.id, e
                    );
                    tx.insert_message(NewMessage {
                        conversation_id,
                        author_id: Some(bot.id),
                        body: format!("Could not schedule an AI reply: {}", e),
                    })
                    .await?;
                    None
                }
            }
        };

        tx.commit().await?;
        Ok(Posted { message, reply })
    }

    async fn handle_trigger(
        &self,
        tx: &mut dyn StoreTx,
        conversation: &Conversation,
        message: &Message,
        bot: &Identity,
    ) -> Result<Option<Scheduled>, StoreError> {
        let snapshot = ConfigSnapshot::load(tx).await?;
        if !snapshot.enabled {
            return Ok(None);
        }

        let Some(prompt) = trigger::evaluate(&message.body, conversation, message.author_id, bot.id)
        else {
            return Ok(None);
        };

        info!(
            "AI reply triggered in conversation {} by message {}: {}",
            conversation.id,
            message.id,
            preview(&prompt, 80)
        );
        self.scheduler
            .schedule(tx, &snapshot, conversation.id, prompt, bot.id)
            .await
            .map(Some)
    }
}
