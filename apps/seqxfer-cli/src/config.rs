//! CLI configuration.
//!
//! Reads JSON at `~/.config/seqxfer/config.json` unless `--config` names
//! another file. Every field is optional. Credentials never live here;
//! they come from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use seqxfer_blob::AzureOptions;
use seqxfer_blob::sas::MAX_TOKEN_TTL;
use seqxfer_orchestrator::{CoordinatorOptions, StrategyOptions};
use seqxfer_task_poller::TaskPoller;
use seqxfer_transfer::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};

/// On-disk configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog base URL; `SEQXFER_API_URL` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    pub progress_interval_secs: u64,
    pub rsync_path: PathBuf,
    pub blob_block_size: usize,
    pub blob_parallelism: usize,
    /// Lifetime of per-request blob tokens, clamped to 1..=200 hours.
    pub transfer_token_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            concurrency: 1,
            poll_interval_secs: 10,
            progress_interval_secs: 10,
            rsync_path: PathBuf::from("rsync"),
            blob_block_size: DEFAULT_CHUNK_SIZE,
            blob_parallelism: 1,
            transfer_token_hours: 1,
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error. Unparseable files are always an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (file_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (config_file_path(), false),
        };

        if !file_path.exists() {
            if explicit {
                anyhow::bail!("config file {} does not exist", file_path.display());
            }
            tracing::debug!(path = %file_path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&file_path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", file_path.display()))?;
        tracing::debug!(path = %file_path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn poller(&self) -> TaskPoller {
        TaskPoller::new(self.poll_interval())
    }

    pub fn strategy_options(&self) -> StrategyOptions {
        StrategyOptions {
            rsync_path: self.rsync_path.clone(),
            copy_poll_interval: self.poll_interval(),
            ..StrategyOptions::default()
        }
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            concurrency: self.concurrency.max(1),
            progress_interval: Duration::from_secs(self.progress_interval_secs),
            progress_sink: None,
        }
    }

    pub fn azure_options(&self) -> AzureOptions {
        AzureOptions {
            block_size: self.blob_block_size.max(1),
            parallelism: self.blob_parallelism.max(1),
            request_ttl: Duration::from_secs(self.transfer_token_hours.saturating_mul(3600))
                .min(MAX_TOKEN_TTL),
        }
    }
}

fn config_file_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("seqxfer")
        .join("config.json")
}
