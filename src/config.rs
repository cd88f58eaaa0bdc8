//! Configuration file
//!
//! `/etc/sysback.json` by default. A missing file means all defaults and any
//! field left out of the file takes its default, so the smallest valid
//! configuration is `{}`:
//!
//! ```json
//! {
//!   "state_dir": "/var/lib/sysback",
//!   "snapshots_dir": "/mnt/backup/snapshots",
//!   "compression": "fast",
//!   "device_timeout_secs": 10
//! }
//! ```
//!
//! Command line flags override whatever is loaded here.

use crate::compression::CompressionMode;
use crate::error::{Result, SysbackError};
use crate::exclusion::ExclusionRules;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sysback.json";

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Tree captured by `backup`
    pub source_root: PathBuf,
    /// Catalog and lock location
    pub state_dir: PathBuf,
    /// Archive location; `<state_dir>/snapshots` when unset
    pub snapshots_dir: Option<PathBuf>,
    /// Exclusion pattern file
    pub excludes_path: PathBuf,
    /// Inclusion pattern file (read but not applied)
    pub includes_path: PathBuf,
    /// Plain-text log file; skipped when not writable
    pub log_file: Option<PathBuf>,
    /// How long to wait for partition nodes to appear
    pub device_timeout_secs: u64,
    /// Archive payload compression
    pub compression: CompressionMode,
    /// Do not descend into other mounted filesystems
    pub one_file_system: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("/"),
            state_dir: PathBuf::from("/var/lib/sysback"),
            snapshots_dir: None,
            excludes_path: PathBuf::from("/etc/sysback.excludes"),
            includes_path: PathBuf::from("/etc/sysback.includes"),
            log_file: Some(PathBuf::from("/var/log/sysback.log")),
            device_timeout_secs: 10,
            compression: CompressionMode::Fast,
            one_file_system: true,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults if it does not exist
    ///
    /// # Errors
    ///
    /// - [`SysbackError::InvalidConfiguration`] if the file is not valid JSON
    ///   for this structure or fails [`Config::validate`]
    pub fn load(path: &Path) -> Result<Self> {
        let config = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<Config>(&bytes).map_err(|e| {
                SysbackError::InvalidConfiguration(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {:?}; using defaults", path);
                Config::default()
            }
            Err(e) => return Err(SysbackError::path_io(path, e)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if !self.state_dir.is_absolute() {
            return Err(SysbackError::InvalidConfiguration(format!(
                "state_dir must be absolute, got {}",
                self.state_dir.display()
            )));
        }
        if let Some(dir) = &self.snapshots_dir {
            if !dir.is_absolute() {
                return Err(SysbackError::InvalidConfiguration(format!(
                    "snapshots_dir must be absolute, got {}",
                    dir.display()
                )));
            }
        }
        if self.device_timeout_secs == 0 {
            return Err(SysbackError::InvalidConfiguration(
                "device_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective snapshots directory
    pub fn snapshots_dir(&self) -> PathBuf {
        self.snapshots_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("snapshots"))
    }

    /// Device node timeout as a [`Duration`]
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    /// Exclusion rules from the configured file, or the built-in defaults
    pub fn exclusion_rules(&self) -> Result<ExclusionRules> {
        ExclusionRules::from_file(&self.excludes_path)
    }

    /// Read the include file only to warn that it has no effect
    pub fn check_includes(&self) -> Result<usize> {
        let count = utils::read_pattern_file(&self.includes_path)?
            .map(|p| p.len())
            .unwrap_or(0);
        if count > 0 {
            warn!(
                "{} include rule(s) in {:?} are ignored; only exclusions are applied",
                count, self.includes_path
            );
        }
        Ok(count)
    }
}
