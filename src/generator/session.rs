use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Turns kept per session file; older ones are dropped on append.
pub const MAX_SESSION_TURNS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTurn {
    pub role: TurnRole,
    pub content: String,
}

impl SessionTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    turns: Vec<SessionTurn>,
}

/// Durable agent memory, one JSON file per conversation under
/// `<data_dir>/agent_sessions`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("agent_sessions"),
        }
    }

    pub fn handle_for(conversation_id: i64) -> String {
        format!("conversation-{}", conversation_id)
    }

    fn path_for(&self, handle: &str) -> Result<PathBuf, BackendError> {
        let valid = !handle.is_empty()
            && handle
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BackendError::Session(format!(
                "invalid session handle '{}'",
                handle
            )));
        }
        Ok(self.dir.join(format!("{}.json", handle)))
    }

    pub async fn load(&self, handle: &str) -> Result<Vec<SessionTurn>, BackendError> {
        let path = self.path_for(handle)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::Session(e.to_string())),
        };
        let file: SessionFile = serde_json::from_str(&content)
            .map_err(|e| BackendError::Session(format!("{}: {}", path.display(), e)))?;
        Ok(file.turns)
    }

    pub async fn append(&self, handle: &str, turns: &[SessionTurn]) -> Result<(), BackendError> {
        let path = self.path_for(handle)?;
        let mut all = self.load(handle).await?;
        all.extend_from_slice(turns);
        if all.len() > MAX_SESSION_TURNS {
            all.drain(..all.len() - MAX_SESSION_TURNS);
        }

        let content = serde_json::to_string_pretty(&SessionFile { turns: all })
            .map_err(|e| BackendError::Session(e.to_string()))?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BackendError::Session(e.to_string()))?;

        // Write then rename so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| BackendError::Session(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| BackendError::Session(e.to_string()))?;
        Ok(())
    }

    pub async fn remove(&self, handle: &str) -> Result<bool, BackendError> {
        let path = self.path_for(handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BackendError::Session(e.to_string())),
        }
    }
}
