// crates/core/src/job/config.rs
//! Configuration value objects for the three job kinds.
//!
//! Configs are immutable once a job is constructed; `validate()` is called by
//! `start()` and its message becomes the job's error.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::scheduler::ScheduleSpec;

/// Upper bound on a single read/write, keeping per-task memory bounded.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound on per-job disk parallelism.
pub const MAX_CONCURRENT_DISKS: usize = 64;

fn default_max_concurrent_disks() -> usize {
    2
}

fn default_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

fn default_compression_level() -> u8 {
    6
}

fn default_max_backups() -> usize {
    7
}

fn default_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    pub vm_id: String,
    /// Root of the artifact tree; backups land in `<backup_dir>/<vm_id>/<backup_id>/`.
    pub backup_dir: PathBuf,
    /// Copy only changed blocks when a tracker is available.
    #[serde(default)]
    pub incremental: bool,
    #[serde(default = "default_true")]
    pub cbt_enabled: bool,
    /// Disk paths (or file names) to skip.
    #[serde(default)]
    pub excluded_disks: Vec<String>,
    #[serde(default = "default_max_concurrent_disks")]
    pub max_concurrent_disks: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Passed through to the provider; 0 disables compression.
    #[serde(default = "default_compression_level")]
    pub compression_level: u8,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub schedule: ScheduleSpec,
}

impl BackupConfig {
    pub fn new(vm_id: impl Into<String>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            vm_id: vm_id.into(),
            backup_dir: backup_dir.into(),
            incremental: false,
            cbt_enabled: true,
            excluded_disks: Vec::new(),
            max_concurrent_disks: default_max_concurrent_disks(),
            chunk_size: default_chunk_size(),
            compression_level: default_compression_level(),
            max_backups: default_max_backups(),
            retention_days: default_retention_days(),
            schedule: ScheduleSpec::default(),
        }
    }

    /// Directory holding every artifact for this VM.
    pub fn vm_backup_dir(&self) -> PathBuf {
        self.backup_dir.join(&self.vm_id)
    }

    pub fn is_excluded(&self, disk_path: &str) -> bool {
        let file_name = std::path::Path::new(disk_path)
            .file_name()
            .and_then(|n| n.to_str());
        self.excluded_disks
            .iter()
            .any(|ex| ex == disk_path || Some(ex.as_str()) == file_name)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        require_non_empty("vm_id", &self.vm_id)?;
        if self.backup_dir.as_os_str().is_empty() {
            return Err(JobError::Config("backup_dir must not be empty".into()));
        }
        check_concurrency(self.max_concurrent_disks)?;
        check_chunk_size(self.chunk_size)?;
        if self.compression_level > 9 {
            return Err(JobError::Config(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.max_backups == 0 {
            return Err(JobError::Config("max_backups must be at least 1".into()));
        }
        if self.retention_days == 0 {
            return Err(JobError::Config("retention_days must be at least 1".into()));
        }
        self.schedule
            .validate()
            .map_err(|msg| JobError::Config(format!("schedule: {msg}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyConfig {
    pub vm_id: String,
    /// Artifact directory produced by a backup job.
    pub backup_path: PathBuf,
    /// Compare artifact data against the live source disks.
    #[serde(default = "default_true")]
    pub compare_source: bool,
    /// Ask the provider to check the artifact's recorded checksum.
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
    /// Mismatched chunks tolerated per disk before failing.
    #[serde(default)]
    pub mismatch_budget: u64,
    #[serde(default = "default_max_concurrent_disks")]
    pub max_concurrent_disks: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl VerifyConfig {
    pub fn new(vm_id: impl Into<String>, backup_path: impl Into<PathBuf>) -> Self {
        Self {
            vm_id: vm_id.into(),
            backup_path: backup_path.into(),
            compare_source: true,
            verify_checksum: true,
            mismatch_budget: 0,
            max_concurrent_disks: default_max_concurrent_disks(),
            chunk_size: default_chunk_size(),
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        require_non_empty("vm_id", &self.vm_id)?;
        if self.backup_path.as_os_str().is_empty() {
            return Err(JobError::Config("backup_path must not be empty".into()));
        }
        if !self.compare_source && !self.verify_checksum {
            return Err(JobError::Config(
                "at least one of compare_source or verify_checksum must be set".into(),
            ));
        }
        check_concurrency(self.max_concurrent_disks)?;
        check_chunk_size(self.chunk_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Artifact directory produced by a backup job.
    pub backup_path: PathBuf,
    /// Name of the VM the provider creates to receive the disks.
    pub target_vm_name: String,
    #[serde(default = "default_max_concurrent_disks")]
    pub max_concurrent_disks: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl RestoreConfig {
    pub fn new(backup_path: impl Into<PathBuf>, target_vm_name: impl Into<String>) -> Self {
        Self {
            backup_path: backup_path.into(),
            target_vm_name: target_vm_name.into(),
            max_concurrent_disks: default_max_concurrent_disks(),
            chunk_size: default_chunk_size(),
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.backup_path.as_os_str().is_empty() {
            return Err(JobError::Config("backup_path must not be empty".into()));
        }
        require_non_empty("target_vm_name", &self.target_vm_name)?;
        check_concurrency(self.max_concurrent_disks)?;
        check_chunk_size(self.chunk_size)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        Err(JobError::Config(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

fn check_concurrency(n: usize) -> Result<(), JobError> {
    if n == 0 || n > MAX_CONCURRENT_DISKS {
        Err(JobError::Config(format!(
            "max_concurrent_disks must be between 1 and {MAX_CONCURRENT_DISKS}, got {n}"
        )))
    } else {
        Ok(())
    }
}

fn check_chunk_size(n: usize) -> Result<(), JobError> {
    if n == 0 || n > MAX_CHUNK_SIZE {
        Err(JobError::Config(format!(
            "chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {n}"
        )))
    } else {
        Ok(())
    }
}
