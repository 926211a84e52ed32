//! Configuration file resolution and TOML persistence
//!
//! Config file lookup follows a fixed priority order:
//! 1. Explicit path supplied by the front end (highest priority)
//! 2. Environment variable (`BISSPRO_CONFIG` by default)
//! 3. Per-user config file (`~/.config/bisspro/bisspro.toml`)
//! 4. System config file (`/etc/bisspro/bisspro.toml`)
//!
//! A missing file is never fatal: callers get compiled defaults and a warning.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "BISSPRO_CONFIG";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Platform defaults used when no config file provides a value
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    /// Key store file read by the decoding service
    pub store_path: PathBuf,
    /// Default log level
    pub log_level: String,
    /// Default log file (None = stderr)
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let store_path = if cfg!(target_os = "linux") {
            // Location read by OSCam/NCam on enigma2 receivers
            PathBuf::from("/etc/tuxbox/config/SoftCam.Key")
        } else {
            dirs::data_local_dir()
                .map(|d| d.join("bisspro").join("SoftCam.Key"))
                .unwrap_or_else(|| PathBuf::from("./SoftCam.Key"))
        };

        Self {
            store_path,
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// Locates the config file for an application
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    app_name: String,
    env_var: String,
}

impl ConfigResolver {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            env_var: CONFIG_ENV_VAR.to_string(),
        }
    }

    /// Override the environment variable consulted at priority 2
    pub fn with_env_var(mut self, env_var: &str) -> Self {
        self.env_var = env_var.to_string();
        self
    }

    /// Resolve the config file path, `None` when no candidate exists
    pub fn resolve(&self, explicit: Option<&Path>) -> Option<PathBuf> {
        // Priority 1: explicit path
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        // Priority 2: environment variable
        if let Ok(path) = std::env::var(&self.env_var) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        // Priority 3/4: user then system config file
        self.candidate_paths().into_iter().find(|p| p.exists())
    }

    /// Per-user and system config paths, in lookup order
    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        let file_name = format!("{}.toml", self.app_name);
        let mut paths = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join(&self.app_name).join(&file_name));
        }
        if cfg!(unix) {
            paths.push(PathBuf::from("/etc").join(&self.app_name).join(&file_name));
        }
        paths
    }
}

/// Load a TOML config, falling back to `T::default()` when the file is absent
///
/// A file that exists but fails to parse is an error.
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(path = %path.display(), "Config file missing, using built-in defaults");
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    info!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Serialize a config and write it atomically with 0600 permissions
pub fn write_toml_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    crate::fs::write_atomic_private(path, content.as_bytes())
}

/// True when a config file is readable by group or others
#[cfg(unix)]
pub fn check_toml_permissions_loose(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();
    Ok(mode & 0o077 != 0)
}
