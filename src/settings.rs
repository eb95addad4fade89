use crate::error::StoreError;
use crate::store::StoreTx;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
pub const DEFAULT_CONTEXT_COUNT: u64 = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer briefly and clearly.";

/// Keys accepted by `settings set`.
pub const KNOWN_KEYS: &[&str] = &[
    "enabled",
    "api_key",
    "organization",
    "base_url",
    "model",
    "temperature",
    "context_count",
    "system_prompt",
    "timeout",
    "mode",
    "assistant_id",
    "agent_instructions",
    "agent_model",
    "vector_store_ids",
    "placeholder",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    #[default]
    Chat,
    Assistants,
    Agents,
}

impl FromStr for ReplyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "chat" => Ok(ReplyMode::Chat),
            "assistants" => Ok(ReplyMode::Assistants),
            "agents" | "agents_sdk" => Ok(ReplyMode::Agents),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

impl fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyMode::Chat => "chat",
            ReplyMode::Assistants => "assistants",
            ReplyMode::Agents => "agents",
        };
        f.write_str(name)
    }
}

/// Read-only copy of the global AI settings, taken once per operation.
#[derive(Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub context_count: u64,
    pub system_prompt: String,
    pub timeout_secs: u64,
    pub mode: ReplyMode,
    pub assistant_id: Option<String>,
    pub agent_instructions: Option<String>,
    pub agent_model: Option<String>,
    pub vector_store_ids: Vec<String>,
    pub placeholder: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::from_settings(&HashMap::new())
    }
}

// Keep the key out of logs.
impl fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSnapshot")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("mode", &self.mode)
            .field("context_count", &self.context_count)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

impl ConfigSnapshot {
    pub async fn load(tx: &mut dyn StoreTx) -> Result<Self, StoreError> {
        Ok(Self::from_settings(&tx.settings().await?))
    }

    pub fn from_settings(values: &HashMap<String, String>) -> Self {
        let text = |key: &str| {
            values
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let mode = match text("mode") {
            None => ReplyMode::Chat,
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("Setting 'mode': {}, falling back to chat", e);
                ReplyMode::Chat
            }),
        };

        Self {
            enabled: parse_or(values, "enabled", false, parse_bool),
            api_key: text("api_key"),
            organization: text("organization"),
            base_url: text("base_url")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: text("model").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: parse_or(values, "temperature", DEFAULT_TEMPERATURE, |v| v.parse().ok()),
            context_count: parse_or(values, "context_count", DEFAULT_CONTEXT_COUNT, |v| {
                v.parse().ok()
            }),
            system_prompt: text("system_prompt")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            timeout_secs: parse_or(values, "timeout", DEFAULT_TIMEOUT_SECS, |v| {
                v.parse::<u64>().ok().filter(|secs| *secs > 0)
            }),
            mode,
            assistant_id: text("assistant_id"),
            agent_instructions: text("agent_instructions"),
            agent_model: text("agent_model"),
            vector_store_ids: text("vector_store_ids")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            placeholder: parse_or(values, "placeholder", false, parse_bool),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_or<T, F>(values: &HashMap<String, String>, key: &str, default: T, parse: F) -> T
where
    F: Fn(&str) -> Option<T>,
{
    let Some(raw) = values.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return default;
    };
    parse(raw).unwrap_or_else(|| {
        warn!("Setting '{}' has invalid value '{}', using default", key, raw);
        default
    })
}
