use crate::config::Config;
use crate::discuss::{Discuss, PostOptions};
use crate::generator::{ResponseGenerator, RigAgentRunner, SessionStore};
use crate::identity::BotIdentityResolver;
use crate::scheduler::{ReplyScheduler, Scheduled};
use crate::settings::{KNOWN_KEYS, ReplyMode};
use crate::state::ConversationState;
use crate::store::{ConversationKind, SqliteStore, StoreHandle};
use crate::worker::{CoordinatorSettings, ReplyOutcome, WorkerCoordinator, WorkerPool};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "replyclaw",
    version,
    about = "Post messages to conversations and get AI replies in the background"
)]
pub struct Cli {
    /// Deployment config file
    #[arg(long, short, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage identities
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    /// Manage conversations
    Conversation {
        #[command(subcommand)]
        command: ConversationCommand,
    },
    /// Post a message and wait for any AI reply it triggers
    Post {
        conversation: i64,
        /// Author identity id; omit for an anonymous message
        #[arg(long)]
        author: Option<i64>,
        /// Skip trigger detection
        #[arg(long)]
        skip_ai: bool,
        body: String,
    },
    /// Show the most recent messages of a conversation
    History {
        conversation: i64,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Read or change AI settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Forget the backend context (thread, agent session) of a conversation
    ResetContext { conversation: i64 },
}

#[derive(Debug, Subcommand)]
pub enum IdentityCommand {
    Create { name: String },
}

#[derive(Debug, Subcommand)]
pub enum ConversationCommand {
    /// Create a conversation with the given members
    Create {
        name: String,
        #[arg(long, value_enum, default_value_t = KindArg::Group)]
        kind: KindArg,
        #[arg(long = "member", required = true)]
        members: Vec<i64>,
    },
    /// Open a direct conversation between an identity and the assistant
    Direct { identity: i64 },
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Set { key: String, value: String },
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Group,
    Direct,
}

impl From<KindArg> for ConversationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Group => ConversationKind::Group,
            KindArg::Direct => ConversationKind::Direct,
        }
    }
}

/// Wired application: datastore, resolver, pool and the post entry point.
pub struct App {
    config: Config,
    store: StoreHandle,
    identity: Arc<BotIdentityResolver>,
    sessions: SessionStore,
    pool: Arc<WorkerPool>,
    discuss: Discuss,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let store: StoreHandle = SqliteStore::open(&config.data_dir).await?;
        let identity = Arc::new(BotIdentityResolver::new(store.clone()));
        let sessions = SessionStore::new(&config.data_dir);

        let generator = Arc::new(ResponseGenerator::new(
            identity.clone(),
            Arc::new(RigAgentRunner),
            sessions.clone(),
        ));
        let coordinator = WorkerCoordinator::new(generator, CoordinatorSettings::default());
        let pool = WorkerPool::new(coordinator, config.max_workers);
        let scheduler = ReplyScheduler::new(pool.clone(), store.clone());
        let discuss = Discuss::new(store.clone(), identity.clone(), scheduler);

        Ok(Self {
            config,
            store,
            identity,
            sessions,
            pool,
            discuss,
        })
    }

    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Identity {
                command: IdentityCommand::Create { name },
            } => {
                let identity = self.store.create_identity(&name, None).await?;
                println!("{}", identity.id);
            }
            Command::Conversation { command } => self.conversation(command).await?,
            Command::Post {
                conversation,
                author,
                skip_ai,
                body,
            } => self.post(conversation, author, skip_ai, &body).await?,
            Command::History {
                conversation,
                limit,
            } => self.history(conversation, limit).await?,
            Command::Settings { command } => self.settings(command).await?,
            Command::ResetContext { conversation } => {
                let mut tx = self.store.begin().await?;
                let cleared = ConversationState::clear(tx.as_mut(), conversation).await?;
                tx.commit().await?;
                let removed = self
                    .sessions
                    .remove(&SessionStore::handle_for(conversation))
                    .await?;
                info!(
                    "Reset conversation {}: {} tokens cleared, session file removed: {}",
                    conversation, cleared, removed
                );
            }
        }
        Ok(())
    }

    async fn conversation(&self, command: ConversationCommand) -> Result<()> {
        let (name, kind, members) = match command {
            ConversationCommand::Create {
                name,
                kind,
                members,
            } => (name, kind.into(), members),
            ConversationCommand::Direct { identity } => {
                let bot = self.identity.get_or_create().await?;
                if identity == bot.id {
                    bail!("The assistant cannot open a direct conversation with itself");
                }
                (
                    format!("direct-{}", identity),
                    ConversationKind::Direct,
                    vec![identity, bot.id],
                )
            }
        };

        let mut tx = self.store.begin().await?;
        let conversation = tx.create_conversation(&name, kind, &members).await?;
        tx.commit().await?;
        println!("{}", conversation.id);
        Ok(())
    }

    async fn post(
        &self,
        conversation: i64,
        author: Option<i64>,
        skip_ai: bool,
        body: &str,
    ) -> Result<()> {
        let posted = self
            .discuss
            .post_message(conversation, author, body, PostOptions { skip_ai })
            .await
            .with_context(|| format!("Failed to post to conversation {}", conversation))?;
        println!("posted message {}", posted.message.id);

        if let Some(Scheduled::MissingCredentials) = posted.reply {
            println!("AI reply skipped: no API key configured");
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        for outcome in self.pool.shutdown(grace).await {
            match outcome {
                ReplyOutcome::Posted { message_id, .. } => {
                    let mut tx = self.store.begin_read().await?;
                    let reply = tx
                        .recent_messages(conversation, 50, None)
                        .await?
                        .into_iter()
                        .find(|m| m.id == message_id);
                    if let Some(reply) = reply {
                        println!("{}", reply.body);
                    }
                }
                other => println!("no reply: {:?}", other),
            }
        }
        Ok(())
    }

    async fn history(&self, conversation: i64, limit: u64) -> Result<()> {
        let bot = self.identity.get_or_create().await?;
        let mut tx = self.store.begin_read().await?;
        let messages = tx.recent_messages(conversation, limit, None).await?;
        tx.rollback().await?;

        for message in messages {
            let author = match message.author_id {
                Some(id) if id == bot.id => "assistant".to_string(),
                Some(id) => format!("#{}", id),
                None => "anonymous".to_string(),
            };
            println!("[{}] {}: {}", message.id, author, message.body);
        }
        Ok(())
    }

    async fn settings(&self, command: SettingsCommand) -> Result<()> {
        match command {
            SettingsCommand::Set { key, value } => {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    bail!("Unknown setting '{}', expected one of: {}", key, KNOWN_KEYS.join(", "));
                }
                if key == "mode" {
                    value.parse::<ReplyMode>().map_err(anyhow::Error::msg)?;
                }
                let mut tx = self.store.begin().await?;
                tx.put_setting(&key, &value).await?;
                tx.commit().await?;
                info!("Setting '{}' updated", key);
            }
            SettingsCommand::Show => {
                let mut tx = self.store.begin_read().await?;
                let values = tx.settings().await?;
                tx.rollback().await?;
                for key in KNOWN_KEYS {
                    let shown = match values.get(*key) {
                        Some(_) if *key == "api_key" => "<set>",
                        Some(value) => value.as_str(),
                        None => "<default>",
                    };
                    println!("{} = {}", key, shown);
                }
            }
        }
        Ok(())
    }

    /// Stops intake and waits for in-flight replies.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        self.pool.shutdown(grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            max_workers: 2,
            shutdown_grace_secs: 5,
        }
    }

    #[test]
    fn parses_post_command() {
        let cli = Cli::try_parse_from(["replyclaw", "post", "3", "--author", "7", "/ai hi"]).unwrap();
        match cli.command {
            Command::Post {
                conversation,
                author,
                skip_ai,
                body,
            } => {
                assert_eq!(conversation, 3);
                assert_eq!(author, Some(7));
                assert!(!skip_ai);
                assert_eq!(body, "/ai hi");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn conversation_create_requires_members() {
        assert!(Cli::try_parse_from(["replyclaw", "conversation", "create", "team"]).is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_settings() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(app_config(dir.path())).await.unwrap();

        let unknown = app
            .settings(SettingsCommand::Set {
                key: "colour".into(),
                value: "blue".into(),
            })
            .await;
        assert!(unknown.is_err());

        let bad_mode = app
            .settings(SettingsCommand::Set {
                key: "mode".into(),
                value: "telepathy".into(),
            })
            .await;
        assert!(bad_mode.is_err());
    }

    #[tokio::test]
    async fn reset_context_clears_tokens_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(app_config(dir.path())).await.unwrap();
        let handle = SessionStore::handle_for(5);

        let mut tx = app.store.begin().await.unwrap();
        ConversationState::set(
            tx.as_mut(),
            5,
            crate::state::TokenKind::AgentSession,
            &handle,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        app.sessions
            .append(&handle, &[crate::generator::SessionTurn::user("hi")])
            .await
            .unwrap();

        app.run(Command::ResetContext { conversation: 5 })
            .await
            .unwrap();

        let mut tx = app.store.begin_read().await.unwrap();
        assert_eq!(
            ConversationState::get(tx.as_mut(), 5, crate::state::TokenKind::AgentSession)
                .await
                .unwrap(),
            None
        );
        assert!(app.sessions.load(&handle).await.unwrap().is_empty());
    }
}
