// crates/core/src/config.rs
//! Daemon configuration loaded from TOML with environment overrides.
//!
//! Resolution order for the file path: `VMBACKUP_CONFIG`, else
//! `/etc/vmbackup/config.toml`. After parsing, `VMBACKUP_BACKUP_DIR`
//! replaces every schedule's backup directory and `VMBACKUP_LOG` replaces
//! the log level.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job::BackupConfig;
use crate::provider::LocalProviderConfig;

pub const CONFIG_ENV: &str = "VMBACKUP_CONFIG";
pub const BACKUP_DIR_ENV: &str = "VMBACKUP_BACKUP_DIR";
pub const LOG_ENV: &str = "VMBACKUP_LOG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmbackup/config.toml";

fn default_level() -> String {
    "info".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence at runtime.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily-rolling log files go here when set; stderr only otherwise.
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub local: LocalProviderConfig,
    #[serde(default)]
    pub schedules: Vec<BackupConfig>,
}

impl DaemonConfig {
    /// Path named by `VMBACKUP_CONFIG`, or the system default.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load from [`default_path`](Self::default_path) and apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&Self::default_path())?;
        config.apply_overrides(
            std::env::var(BACKUP_DIR_ENV).ok().as_deref(),
            std::env::var(LOG_ENV).ok().as_deref(),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::parse(&text, path)
    }

    /// Parse TOML text; `origin` only labels errors.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn apply_overrides(&mut self, backup_dir: Option<&str>, log_level: Option<&str>) {
        if let Some(dir) = backup_dir.filter(|d| !d.is_empty()) {
            for schedule in &mut self.schedules {
                schedule.backup_dir = PathBuf::from(dir);
            }
        }
        if let Some(level) = log_level.filter(|l| !l.is_empty()) {
            self.logging.level = level.to_string();
        }
    }

    /// Cross-field checks. Each schedule is also validated as a backup config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_secs must be positive".into(),
            ));
        }
        let mut seen = HashSet::new();
        for schedule in &self.schedules {
            if !seen.insert(schedule.vm_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "more than one schedule for VM {}",
                    schedule.vm_id
                )));
            }
            schedule
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("schedule {}: {e}", schedule.vm_id)))?;
        }
        let mut vm_ids = HashSet::new();
        for vm in &self.local.vms {
            if !vm_ids.insert(vm.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate local VM id {}", vm.id)));
            }
            if vm.disks.is_empty() {
                return Err(ConfigError::Invalid(format!("local VM {} has no disks", vm.id)));
            }
        }
        Ok(())
    }
}
