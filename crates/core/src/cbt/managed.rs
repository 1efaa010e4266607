// crates/core/src/cbt/managed.rs
use std::sync::Arc;

use crate::cbt::{BlockRange, ChangedBlockTracker};
use crate::error::CbtError;
use crate::provider::BackupProvider;

/// Tracker backed by the hypervisor's own CBT feature.
///
/// Enabling is per VM on the backend; queries are per disk.
pub struct ManagedCbt {
    provider: Arc<dyn BackupProvider>,
    vm_id: String,
    disk_path: String,
}

impl ManagedCbt {
    pub fn new(
        provider: Arc<dyn BackupProvider>,
        vm_id: impl Into<String>,
        disk_path: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            vm_id: vm_id.into(),
            disk_path: disk_path.into(),
        }
    }
}

impl ChangedBlockTracker for ManagedCbt {
    fn name(&self) -> &str {
        "managed"
    }

    fn is_enabled(&self) -> Result<bool, CbtError> {
        Ok(self.provider.is_cbt_enabled(&self.vm_id)?)
    }

    fn enable(&self) -> Result<(), CbtError> {
        tracing::info!(vm_id = %self.vm_id, provider = self.provider.name(), "Enabling managed CBT");
        Ok(self.provider.enable_cbt(&self.vm_id)?)
    }

    fn disable(&self) -> Result<(), CbtError> {
        tracing::info!(vm_id = %self.vm_id, provider = self.provider.name(), "Disabling managed CBT");
        Ok(self.provider.disable_cbt(&self.vm_id)?)
    }

    fn changed_blocks(&self) -> Result<Vec<BlockRange>, CbtError> {
        if !self.is_enabled()? {
            return Err(CbtError::NotEnabled(self.disk_path.clone()));
        }
        Ok(self.provider.changed_blocks(&self.vm_id, &self.disk_path)?)
    }

    fn reset(&self) -> Result<(), CbtError> {
        Ok(self.provider.reset_cbt(&self.vm_id, &self.disk_path)?)
    }
}

impl std::fmt::Debug for ManagedCbt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedCbt")
            .field("provider", &self.provider.name())
            .field("vm_id", &self.vm_id)
            .field("disk_path", &self.disk_path)
            .finish()
    }
}
