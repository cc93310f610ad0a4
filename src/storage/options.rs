use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::pager::PagerOptions;
use crate::types::StreeError;

/// When the trailing bytes of a file may be packed into a direct item.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailPolicy {
    /// Tails always stay in unformatted blocks.
    Never,
    /// Any tail that fits a direct item is packed.
    Always,
    /// Only tails small relative to the file and block size are packed.
    #[default]
    Small,
}

/// Tuning knobs for the tree engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeOptions {
    /// Waits on a busy unformatted block before a cut gives up on it.
    pub busy_retry_limit: u32,
    /// Base sleep between busy-block retries once yielding alone did not help.
    pub busy_backoff_us: u64,
    /// Blocks a truncate unit may log before it is checkpointed.
    pub truncate_checkpoint_blocks: usize,
    /// Blocks reserved when a journal unit begins.
    pub journal_reserve_blocks: usize,
    /// Tail packing policy.
    pub tail_policy: TailPolicy,
    /// Restarts a single search may take before it fails with `Busy` on the
    /// node it kept losing.
    pub max_restarts: u32,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            busy_retry_limit: 64,
            busy_backoff_us: 50,
            truncate_checkpoint_blocks: 64,
            journal_reserve_blocks: 16,
            tail_policy: TailPolicy::Small,
            max_restarts: 1024,
        }
    }
}

impl TreeOptions {
    /// Base backoff as a [`Duration`].
    pub fn busy_backoff(&self) -> Duration {
        Duration::from_micros(self.busy_backoff_us)
    }

    /// Sets the busy-block retry cap.
    pub fn busy_retry_limit(mut self, limit: u32) -> Self {
        self.busy_retry_limit = limit;
        self
    }

    /// Sets the truncate checkpoint threshold.
    pub fn truncate_checkpoint_blocks(mut self, blocks: usize) -> Self {
        self.truncate_checkpoint_blocks = blocks;
        self
    }

    /// Sets the tail packing policy.
    pub fn tail_policy(mut self, policy: TailPolicy) -> Self {
        self.tail_policy = policy;
        self
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.truncate_checkpoint_blocks == 0 {
            return Err(ConfigError::Invalid {
                field: "truncate_checkpoint_blocks",
                reason: "must be at least 1",
            });
        }
        if self.max_restarts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_restarts",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Device and engine settings read from one TOML file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Block size in bytes.
    pub block_size: u32,
    /// Device size in blocks.
    pub capacity_blocks: u32,
    /// Engine tuning.
    pub tree: TreeOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let pager = PagerOptions::default();
        Self {
            block_size: pager.block_size,
            capacity_blocks: pager.capacity_blocks,
            tree: TreeOptions::default(),
        }
    }
}

impl StoreConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|source| ConfigError::Parse { path: None, source })?;
        config.tree.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: StoreConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        config.tree.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Pager options derived from this configuration.
    pub fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            block_size: self.block_size,
            capacity_blocks: self.capacity_blocks,
        }
    }
}

/// Errors raised while loading options.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The TOML did not describe a valid configuration.
    #[error("failed to parse config: {source}")]
    Parse {
        /// File that failed, when parsing from disk.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("option '{field}' {reason}")]
    Invalid {
        /// Offending option.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl From<ConfigError> for StreeError {
    fn from(err: ConfigError) -> Self {
        StreeError::Config(err.to_string())
    }
}
