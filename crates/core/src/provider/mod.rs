// crates/core/src/provider/mod.rs
//! Hypervisor backend interfaces consumed by the jobs.
//!
//! Provides the `BackupProvider` trait (VM inventory, lifecycle hooks, native
//! changed-block tracking, verification) and the `DiskBackend` trait used for
//! raw block I/O, plus `LocalProvider`, a file-backed implementation.

pub mod disk;
pub mod local;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cbt::BlockRange;
use crate::error::ProviderError;
use crate::job::BackupConfig;

pub use disk::{DiskAccess, DiskBackend, DiskHandle, FileDiskBackend};
pub use local::{LocalProvider, LocalProviderConfig, LocalVm};

/// Inventory entry for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub power_state: String,
    pub disk_count: usize,
}

/// One disk the restore target must be created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreDiskSpec {
    pub name: String,
    pub size: u64,
}

/// Trait for hypervisor backends.
///
/// Implementations exist per hypervisor family; the jobs treat them as
/// opaque. Lifecycle hooks default to no-ops and native CBT defaults to
/// unsupported, so a minimal provider only implements inventory, disk I/O,
/// restore provisioning and verification.
pub trait BackupProvider: Send + Sync {
    /// Provider name for logging/display (e.g. "local", "vsphere").
    fn name(&self) -> &str;

    fn connect(&self) -> Result<(), ProviderError>;

    fn disconnect(&self) -> Result<(), ProviderError>;

    fn is_connected(&self) -> bool;

    fn list_vms(&self) -> Result<Vec<VmInfo>, ProviderError>;

    fn vm_info(&self, vm_id: &str) -> Result<VmInfo, ProviderError>;

    fn vm_disk_paths(&self, vm_id: &str) -> Result<Vec<String>, ProviderError>;

    /// Block I/O for the VM's disks.
    fn disk_backend(&self) -> Arc<dyn DiskBackend>;

    /// Called once before any disk of a backup is read (e.g. to quiesce or
    /// snapshot the VM).
    fn start_backup(
        &self,
        _vm_id: &str,
        _backup_id: &str,
        _config: &BackupConfig,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    fn pause_backup(&self, _vm_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn resume_backup(&self, _vm_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    fn cancel_backup(&self, _vm_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Called once the backup's manifest is written. Releases whatever
    /// `start_backup` set up.
    fn finish_backup(&self, _vm_id: &str, _backup_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Backend-side status text for the VM's current backup, if it keeps one.
    fn backup_status(&self, _vm_id: &str) -> Option<String> {
        None
    }

    /// Create a fresh VM named `target_vm_name` with the given disks and
    /// return the paths of its disks, in the same order.
    fn start_restore(
        &self,
        target_vm_name: &str,
        disks: &[RestoreDiskSpec],
    ) -> Result<Vec<String>, ProviderError>;

    fn cancel_restore(&self, _target_vm_name: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Whether the backend tracks changed blocks itself.
    fn supports_native_cbt(&self) -> bool {
        false
    }

    fn enable_cbt(&self, _vm_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported(format!("{}: native CBT", self.name())))
    }

    fn disable_cbt(&self, _vm_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported(format!("{}: native CBT", self.name())))
    }

    fn is_cbt_enabled(&self, _vm_id: &str) -> Result<bool, ProviderError> {
        Ok(false)
    }

    fn changed_blocks(
        &self,
        _vm_id: &str,
        _disk_path: &str,
    ) -> Result<Vec<BlockRange>, ProviderError> {
        Err(ProviderError::Unsupported(format!("{}: native CBT", self.name())))
    }

    /// Move the disk's tracking reference point to now. Backends that key
    /// queries on a change id they hand out per backup can keep the default.
    fn reset_cbt(&self, _vm_id: &str, _disk_path: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Check an artifact's recorded integrity data. `Ok(false)` means the
    /// artifact is readable but does not match.
    fn verify_backup(&self, vm_id: &str, backup_path: &Path) -> Result<bool, ProviderError>;

    /// Last backend error message, if any.
    fn last_error(&self) -> Option<String>;
}
