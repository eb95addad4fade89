use super::{
    CommitHook, Conversation, ConversationKind, Datastore, Identity, Message, NewMessage, StoreTx,
};
use crate::entity::{
    advisory_locks, continuation_tokens, conversation_members, conversations, identities,
    messages, settings,
};
use crate::error::StoreError;
use crate::utils::now_us;
use anyhow::Result;
use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, mpsc};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const DB_FILE: &str = "replyclaw.db";

/// Advisory locks older than this belong to a worker that died mid-attempt.
const LOCK_TTL_US: i64 = 10 * 60 * 1_000_000;

pub struct SqliteStore {
    db_url: String,
}

impl SqliteStore {
    pub async fn open(data_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        tokio::task::spawn_blocking({
            let db_url = db_url.clone();
            move || -> Result<()> {
                let db = Database::connect(&db_url)?;
                db.execute_unprepared("PRAGMA journal_mode=WAL;")?;

                db.get_schema_builder()
                    .register(identities::Entity)
                    .register(conversations::Entity)
                    .register(conversation_members::Entity)
                    .register(messages::Entity)
                    .register(continuation_tokens::Entity)
                    .register(settings::Entity)
                    .register(advisory_locks::Entity)
                    .apply(&db)?;

                Ok(())
            }
        })
        .await??;

        info!("Datastore ready ({})", db_path.display());
        Ok(Arc::new(Self { db_url }))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DatabaseConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_url = self.db_url.clone();
        tokio::task::spawn_blocking(move || {
            let db = Database::connect(&db_url)?;
            f(&db)
        })
        .await?
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = SqliteTx::start(self.db_url.clone(), SqliteTransactionMode::Immediate).await?;
        Ok(Box::new(tx))
    }

    async fn begin_read(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = SqliteTx::start(self.db_url.clone(), SqliteTransactionMode::Deferred).await?;
        Ok(Box::new(tx))
    }

    async fn try_advisory_lock(&self, key: i64, holder: &str) -> Result<bool, StoreError> {
        let holder = holder.to_string();
        self.with_conn(move |db| {
            let now = now_us();
            let stale = advisory_locks::Entity::delete_many()
                .filter(advisory_locks::Column::Key.eq(key))
                .filter(advisory_locks::Column::AcquiredUs.lt(now - LOCK_TTL_US))
                .exec(db)?;
            if stale.rows_affected > 0 {
                warn!("Took over stale advisory lock {}", key);
            }

            let record = advisory_locks::ActiveModel {
                key: Set(key),
                holder: Set(holder),
                acquired_us: Set(now),
            };
            match advisory_locks::Entity::insert(record).exec(db) {
                Ok(_) => Ok(true),
                Err(e) => match StoreError::from(e) {
                    StoreError::UniqueViolation(_) | StoreError::Conflict(_) => Ok(false),
                    other => Err(other),
                },
            }
        })
        .await
    }

    async fn advisory_unlock(&self, key: i64, holder: &str) -> Result<(), StoreError> {
        let holder = holder.to_string();
        self.with_conn(move |db| {
            advisory_locks::Entity::delete_many()
                .filter(advisory_locks::Column::Key.eq(key))
                .filter(advisory_locks::Column::Holder.eq(holder))
                .exec(db)?;
            Ok(())
        })
        .await
    }

    async fn find_identity_by_marker(&self, marker: &str) -> Result<Option<Identity>, StoreError> {
        let marker = marker.to_string();
        self.with_conn(move |db| {
            let row = identities::Entity::find()
                .filter(identities::Column::Marker.eq(marker))
                .one(db)?;
            Ok(row.map(Identity::from))
        })
        .await
    }

    async fn create_identity(
        &self,
        name: &str,
        marker: Option<&str>,
    ) -> Result<Identity, StoreError> {
        let name = name.to_string();
        let marker = marker.map(str::to_string);
        self.with_conn(move |db| {
            let record = identities::ActiveModel {
                id: NotSet,
                name: Set(name.clone()),
                marker: Set(marker.clone()),
                created_us: Set(now_us()),
            };
            let result = identities::Entity::insert(record).exec(db)?;
            Ok(Identity {
                id: result.last_insert_id,
                name,
                marker,
            })
        })
        .await
    }
}

type TxJob = Box<dyn FnOnce(&DatabaseTransaction) + Send>;

enum TxCommand {
    Run(TxJob),
    Finish {
        commit: bool,
        done: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// A transaction owned by its own blocking thread. Statements reach it as
/// closures over a channel; the connection never leaves that thread.
pub struct SqliteTx {
    commands: mpsc::Sender<TxCommand>,
    hooks: Vec<CommitHook>,
}

impl SqliteTx {
    async fn start(db_url: String, mode: SqliteTransactionMode) -> Result<Self, StoreError> {
        let (commands, inbox) = mpsc::channel();
        let (ready, opened) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            let begun = Database::connect(&db_url).and_then(|db| {
                let txn = db.begin_with_options(TransactionOptions {
                    sqlite_transaction_mode: Some(mode),
                    ..Default::default()
                })?;
                Ok((db, txn))
            });
            match begun {
                Ok((_db, txn)) => {
                    if ready.send(Ok(())).is_ok() {
                        serve(txn, inbox);
                    }
                }
                Err(e) => {
                    let _ = ready.send(Err(StoreError::from(e)));
                }
            }
        });

        opened.await.map_err(|_| StoreError::Closed)??;
        Ok(Self {
            commands,
            hooks: Vec::new(),
        })
    }

    async fn run<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DatabaseTransaction) -> Result<T, StoreError> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: TxJob = Box::new(move |txn| {
            let _ = reply.send(f(txn));
        });
        self.commands
            .send(TxCommand::Run(job))
            .map_err(|_| StoreError::Closed)?;
        result.await.map_err(|_| StoreError::Closed)?
    }

    async fn finish(&mut self, commit: bool) -> Result<(), StoreError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(TxCommand::Finish { commit, done })
            .map_err(|_| StoreError::Closed)?;
        result.await.map_err(|_| StoreError::Closed)?
    }
}

/// Runs on the transaction's thread until it is finished or its handle is
/// dropped, in which case it rolls back.
fn serve(txn: DatabaseTransaction, inbox: mpsc::Receiver<TxCommand>) {
    while let Ok(command) = inbox.recv() {
        match command {
            TxCommand::Run(job) => job(&txn),
            TxCommand::Finish { commit, done } => {
                let result = if commit {
                    txn.commit()
                } else {
                    txn.rollback()
                };
                let _ = done.send(result.map_err(StoreError::from));
                return;
            }
        }
    }

    debug!("Transaction dropped without commit, rolling back");
    if let Err(e) = txn.rollback() {
        warn!("Rollback of dropped transaction failed: {}", e);
    }
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn settings(&mut self) -> Result<HashMap<String, String>, StoreError> {
        self.run(|txn| {
            let rows = settings::Entity::find().all(txn)?;
            Ok(rows.into_iter().map(|r| (r.key, r.value)).collect())
        })
        .await
    }

    async fn put_setting(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.run(move |txn| {
            match settings::Entity::find_by_id(key.clone()).one(txn)? {
                Some(existing) => {
                    let mut record = existing.into_active_model();
                    record.value = Set(value);
                    record.update(txn)?;
                }
                None => {
                    let record = settings::ActiveModel {
                        key: Set(key),
                        value: Set(value),
                    };
                    settings::Entity::insert(record).exec(txn)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn create_conversation(
        &mut self,
        name: &str,
        kind: ConversationKind,
        members: &[i64],
    ) -> Result<Conversation, StoreError> {
        let name = name.to_string();
        let mut members = members.to_vec();
        members.sort_unstable();
        members.dedup();
        self.run(move |txn| {
            let now = now_us();
            let record = conversations::ActiveModel {
                id: NotSet,
                name: Set(name.clone()),
                kind: Set(kind.as_str().to_string()),
                created_us: Set(now),
                updated_us: Set(now),
            };
            let id = conversations::Entity::insert(record).exec(txn)?.last_insert_id;

            for identity_id in &members {
                let member = conversation_members::ActiveModel {
                    rowid: NotSet,
                    membership: Set(conversation_members::membership_key(id, *identity_id)),
                    conversation_id: Set(id),
                    identity_id: Set(*identity_id),
                    touched_us: Set(now),
                };
                conversation_members::Entity::insert(member).exec(txn)?;
            }

            Ok(Conversation {
                id,
                name,
                kind,
                members,
            })
        })
        .await
    }

    async fn conversation(&mut self, id: i64) -> Result<Option<Conversation>, StoreError> {
        self.run(move |txn| {
            let Some(row) = conversations::Entity::find_by_id(id).one(txn)? else {
                return Ok(None);
            };
            let members = conversation_members::Entity::find()
                .filter(conversation_members::Column::ConversationId.eq(id))
                .order_by_asc(conversation_members::Column::Rowid)
                .all(txn)?
                .into_iter()
                .map(|m| m.identity_id)
                .collect();
            let kind = ConversationKind::parse(&row.kind).ok_or_else(|| {
                StoreError::Database(format!("Unknown conversation kind: {}", row.kind))
            })?;

            Ok(Some(Conversation {
                id: row.id,
                name: row.name,
                kind,
                members,
            }))
        })
        .await
    }

    async fn recent_messages(
        &mut self,
        conversation_id: i64,
        limit: u64,
        exclude: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        self.run(move |txn| {
            let mut query = messages::Entity::find()
                .filter(messages::Column::ConversationId.eq(conversation_id));
            if let Some(excluded) = exclude {
                query = query.filter(messages::Column::Id.ne(excluded));
            }
            let rows = query
                .filter(Expr::cust("TRIM(body) <> ''"))
                .order_by_desc(messages::Column::Id)
                .limit(limit)
                .all(txn)?;

            let mut history: Vec<Message> = rows.into_iter().map(Message::from).collect();
            history.reverse();
            Ok(history)
        })
        .await
    }

    async fn insert_message(&mut self, message: NewMessage) -> Result<Message, StoreError> {
        self.run(move |txn| {
            let now = now_us();
            let record = messages::ActiveModel {
                id: NotSet,
                conversation_id: Set(message.conversation_id),
                author_id: Set(message.author_id),
                body: Set(message.body.clone()),
                created_us: Set(now),
            };
            let id = messages::Entity::insert(record).exec(txn)?.last_insert_id;
            Ok(Message {
                id,
                conversation_id: message.conversation_id,
                author_id: message.author_id,
                body: message.body,
                created_us: now,
            })
        })
        .await
    }

    async fn delete_message(&mut self, id: i64) -> Result<bool, StoreError> {
        self.run(move |txn| {
            let result = messages::Entity::delete_by_id(id).exec(txn)?;
            Ok(result.rows_affected > 0)
        })
        .await
    }

    async fn lock_conversation_rows(&mut self, conversation_id: i64) -> Result<(), StoreError> {
        // SQLite has no SELECT .. FOR UPDATE; touching the rows takes the
        // database write lock for the rest of the transaction.
        self.run(move |txn| {
            let now = now_us();
            conversation_members::Entity::update_many()
                .col_expr(conversation_members::Column::TouchedUs, Expr::value(now))
                .filter(conversation_members::Column::ConversationId.eq(conversation_id))
                .exec(txn)?;
            let touched = conversations::Entity::update_many()
                .col_expr(conversations::Column::UpdatedUs, Expr::value(now))
                .filter(conversations::Column::Id.eq(conversation_id))
                .exec(txn)?;
            if touched.rows_affected == 0 {
                return Err(StoreError::NotFound(format!(
                    "conversation {}",
                    conversation_id
                )));
            }
            Ok(())
        })
        .await
    }

    async fn continuation_token(
        &mut self,
        conversation_id: i64,
        backend: &str,
    ) -> Result<Option<String>, StoreError> {
        let slot = continuation_tokens::slot_key(conversation_id, backend);
        self.run(move |txn| {
            let row = continuation_tokens::Entity::find()
                .filter(continuation_tokens::Column::Slot.eq(slot))
                .one(txn)?;
            Ok(row.map(|r| r.token))
        })
        .await
    }

    async fn insert_continuation_token(
        &mut self,
        conversation_id: i64,
        backend: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let record = continuation_tokens::ActiveModel {
            rowid: NotSet,
            slot: Set(continuation_tokens::slot_key(conversation_id, backend)),
            conversation_id: Set(conversation_id),
            backend: Set(backend.to_string()),
            token: Set(token.to_string()),
            created_us: Set(now_us()),
        };
        self.run(move |txn| {
            continuation_tokens::Entity::insert(record).exec(txn)?;
            Ok(())
        })
        .await
    }

    async fn clear_continuation_tokens(
        &mut self,
        conversation_id: i64,
    ) -> Result<u64, StoreError> {
        self.run(move |txn| {
            let result = continuation_tokens::Entity::delete_many()
                .filter(continuation_tokens::Column::ConversationId.eq(conversation_id))
                .exec(txn)?;
            Ok(result.rows_affected)
        })
        .await
    }

    fn on_commit(&mut self, hook: CommitHook) {
        self.hooks.push(hook);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = *self;
        tx.finish(true).await?;
        for hook in tx.hooks {
            hook();
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = *self;
        tx.finish(false).await
    }
}

impl From<identities::Model> for Identity {
    fn from(r: identities::Model) -> Self {
        Self {
            id: r.id,
            name: r.name,
            marker: r.marker,
        }
    }
}

impl From<messages::Model> for Message {
    fn from(r: messages::Model) -> Self {
        Self {
            id: r.id,
            conversation_id: r.conversation_id,
            author_id: r.author_id,
            body: r.body,
            created_us: r.created_us,
        }
    }
}
