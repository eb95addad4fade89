use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    workers: WorkersConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageConfig {
    #[serde(default = "default_data_dir")]
    data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WorkersConfig {
    #[serde(default = "default_max_concurrent")]
    max_concurrent: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    shutdown_grace_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_max_concurrent() -> usize {
    8
}

fn default_shutdown_grace_secs() -> u64 {
    90
}

/// Deployment settings. AI behaviour lives in the datastore, see
/// [`crate::settings::ConfigSnapshot`].
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub max_workers: usize,
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config_file: ConfigFile =
            toml::from_str(&content).context("Failed to parse config file")?;

        Ok(Self::from(config_file))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("{} not found, using defaults", path.display());
            return Ok(Self::from(ConfigFile::default()));
        }
        Self::from_file(path)
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        Self {
            data_dir: file.storage.data_dir.into(),
            max_workers: file.workers.max_concurrent.max(1),
            shutdown_grace_secs: file.workers.shutdown_grace_secs,
        }
    }
}
