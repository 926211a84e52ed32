//! Configuration for bisspro-core
//!
//! One TOML file, every section optional. Resolution order and the
//! missing-file fallback come from `bisspro_common::config`.

use crate::error::Result;
use crate::fetcher::FeedConfig;
use crate::matcher::MatcherConfig;
use crate::reconcile::CollisionPolicy;
use crate::restart::RestartConfig;
use bisspro_common::config::{
    load_toml_config, write_toml_config, CompiledDefaults, ConfigResolver, LoggingConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Application name used for config file lookup
pub const APP_NAME: &str = "bisspro";

/// File name of the persisted feed cache, next to the store
const FEED_CACHE_FILE: &str = "bisspro_feed_cache.json";

/// Snapshot settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Take a snapshot before every write
    pub enabled: bool,
    /// Snapshots kept; older ones are deleted
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// What a bulk merge does when an identity is already present
    pub collision_policy: CollisionPolicy,
}

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BissConfig {
    /// Key file read by the decoding service
    pub store_path: PathBuf,
    /// Compute outcomes without writing, snapshotting or restarting
    pub dry_run: bool,
    pub logging: LoggingConfig,
    pub backup: BackupConfig,
    pub matcher: MatcherConfig,
    pub merge: MergeConfig,
    pub restart: RestartConfig,
    pub feed: FeedConfig,
}

impl Default for BissConfig {
    fn default() -> Self {
        let defaults = CompiledDefaults::for_current_platform();
        Self {
            store_path: defaults.store_path,
            dry_run: false,
            logging: LoggingConfig {
                level: defaults.log_level,
                file: defaults.log_file,
            },
            backup: BackupConfig::default(),
            matcher: MatcherConfig::default(),
            merge: MergeConfig::default(),
            restart: RestartConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl BissConfig {
    /// Resolve and load the config file (explicit path, env var, user, system)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = ConfigResolver::new(APP_NAME).resolve(explicit);
        Self::load_from(path.as_deref())
    }

    /// Load from a known path; `None` or a missing file gives defaults
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        info!(
            store = %config.store_path.display(),
            dry_run = config.dry_run,
            restart_mode = ?config.restart.mode,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Write back atomically (0600 on unix)
    pub fn save(&self, path: &Path) -> Result<()> {
        write_toml_config(self, path)?;
        Ok(())
    }

    /// Persisted feed cache location
    pub fn feed_cache_path(&self) -> PathBuf {
        match &self.feed.cache_path {
            Some(path) => path.clone(),
            None => self
                .store_path
                .parent()
                .map(|dir| dir.join(FEED_CACHE_FILE))
                .unwrap_or_else(|| PathBuf::from(FEED_CACHE_FILE)),
        }
    }
}
