// crates/core/src/provider/local.rs
//! Provider for VMs whose disks are image files on this host.
//!
//! VMs are declared in configuration; there is no hypervisor API. Restores
//! provision fresh sparse images under `restore_dir/<target_vm_name>/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::disk::{DiskBackend, FileDiskBackend};
use super::{BackupProvider, RestoreDiskSpec, VmInfo};
use crate::error::ProviderError;
use crate::job::BackupConfig;
use crate::manifest::BackupManifest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVm {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub disks: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProviderConfig {
    /// Where restored VMs get their disks.
    #[serde(default = "default_restore_dir")]
    pub restore_dir: PathBuf,
    #[serde(default)]
    pub vms: Vec<LocalVm>,
}

fn default_restore_dir() -> PathBuf {
    PathBuf::from("/var/lib/vmbackup/restore")
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            restore_dir: default_restore_dir(),
            vms: Vec::new(),
        }
    }
}

pub struct LocalProvider {
    config: LocalProviderConfig,
    backend: Arc<FileDiskBackend>,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    /// vm_id -> backend status text for backups in flight.
    active: Mutex<HashMap<String, String>>,
}

impl LocalProvider {
    pub fn new(config: LocalProviderConfig) -> Self {
        Self {
            config,
            backend: Arc::new(FileDiskBackend),
            connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LocalProviderConfig {
        &self.config
    }

    /// Record `err` as the last error and pass it through.
    fn record(&self, err: ProviderError) -> ProviderError {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
        err
    }

    fn ensure_connected(&self) -> Result<(), ProviderError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(self.record(ProviderError::NotConnected))
        }
    }

    fn vm(&self, vm_id: &str) -> Result<&LocalVm, ProviderError> {
        self.ensure_connected()?;
        self.config
            .vms
            .iter()
            .find(|vm| vm.id == vm_id)
            .ok_or_else(|| self.record(ProviderError::VmNotFound(vm_id.to_string())))
    }

    fn info_for(vm: &LocalVm) -> VmInfo {
        let present = vm.disks.iter().all(|d| d.exists());
        VmInfo {
            id: vm.id.clone(),
            name: vm.name.clone().unwrap_or_else(|| vm.id.clone()),
            power_state: if present { "available" } else { "missing-disks" }.to_string(),
            disk_count: vm.disks.len(),
        }
    }

    fn set_active(&self, vm_id: &str, status: Option<&str>) {
        match self.active.lock() {
            Ok(mut active) => match status {
                Some(s) => {
                    active.insert(vm_id.to_string(), s.to_string());
                }
                None => {
                    active.remove(vm_id);
                }
            },
            Err(e) => tracing::error!(error = %e, "LocalProvider active-backup lock poisoned"),
        }
    }
}

impl BackupProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn connect(&self) -> Result<(), ProviderError> {
        std::fs::create_dir_all(&self.config.restore_dir)
            .map_err(|e| self.record(ProviderError::io(&self.config.restore_dir, e)))?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(vms = self.config.vms.len(), restore_dir = %self.config.restore_dir.display(), "Local provider connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ProviderError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn list_vms(&self) -> Result<Vec<VmInfo>, ProviderError> {
        self.ensure_connected()?;
        Ok(self.config.vms.iter().map(Self::info_for).collect())
    }

    fn vm_info(&self, vm_id: &str) -> Result<VmInfo, ProviderError> {
        self.vm(vm_id).map(Self::info_for)
    }

    fn vm_disk_paths(&self, vm_id: &str) -> Result<Vec<String>, ProviderError> {
        let vm = self.vm(vm_id)?;
        vm.disks
            .iter()
            .map(|d| {
                d.to_str().map(str::to_string).ok_or_else(|| {
                    self.record(ProviderError::Backend(format!(
                        "non UTF-8 disk path {}",
                        d.display()
                    )))
                })
            })
            .collect()
    }

    fn disk_backend(&self) -> Arc<dyn DiskBackend> {
        self.backend.clone()
    }

    fn start_backup(
        &self,
        vm_id: &str,
        backup_id: &str,
        _config: &BackupConfig,
    ) -> Result<(), ProviderError> {
        self.vm(vm_id)?;
        self.set_active(vm_id, Some(&format!("backup {backup_id} running")));
        Ok(())
    }

    fn pause_backup(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.set_active(vm_id, Some("backup paused"));
        Ok(())
    }

    fn resume_backup(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.set_active(vm_id, Some("backup running"));
        Ok(())
    }

    fn cancel_backup(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.set_active(vm_id, None);
        Ok(())
    }

    fn finish_backup(&self, vm_id: &str, backup_id: &str) -> Result<(), ProviderError> {
        tracing::debug!(vm_id, backup_id, "Local backup finished");
        self.set_active(vm_id, None);
        Ok(())
    }

    fn backup_status(&self, vm_id: &str) -> Option<String> {
        self.active.lock().ok()?.get(vm_id).cloned()
    }

    fn start_restore(
        &self,
        target_vm_name: &str,
        disks: &[RestoreDiskSpec],
    ) -> Result<Vec<String>, ProviderError> {
        self.ensure_connected()?;
        let vm_dir = self.config.restore_dir.join(target_vm_name);
        if vm_dir.exists() {
            return Err(self.record(ProviderError::Backend(format!(
                "restore target {} already exists",
                vm_dir.display()
            ))));
        }
        std::fs::create_dir_all(&vm_dir).map_err(|e| self.record(ProviderError::io(&vm_dir, e)))?;

        let mut paths = Vec::with_capacity(disks.len());
        for disk in disks {
            let path = vm_dir.join(&disk.name);
            let file = std::fs::File::create(&path)
                .map_err(|e| self.record(ProviderError::io(&path, e)))?;
            file.set_len(disk.size)
                .map_err(|e| self.record(ProviderError::io(&path, e)))?;
            paths.push(path.to_string_lossy().into_owned());
        }
        tracing::info!(target_vm = target_vm_name, disks = paths.len(), "Provisioned restore target");
        Ok(paths)
    }

    fn cancel_restore(&self, target_vm_name: &str) -> Result<(), ProviderError> {
        let vm_dir = self.config.restore_dir.join(target_vm_name);
        match std::fs::remove_dir_all(&vm_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.record(ProviderError::io(&vm_dir, e))),
        }
    }

    fn verify_backup(&self, vm_id: &str, backup_path: &Path) -> Result<bool, ProviderError> {
        let manifest = BackupManifest::load(backup_path)
            .map_err(|e| self.record(ProviderError::Backend(e.to_string())))?;
        if manifest.vm_id != vm_id {
            tracing::warn!(vm_id, manifest_vm = %manifest.vm_id, "Artifact belongs to another VM");
            return Ok(false);
        }
        for disk in &manifest.disks {
            let image = backup_path.join(&disk.file_name);
            match std::fs::metadata(&image) {
                Ok(meta) if meta.len() == disk.size => {}
                Ok(meta) => {
                    tracing::warn!(image = %image.display(), expected = disk.size, actual = meta.len(), "Artifact image size mismatch");
                    return Ok(false);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(image = %image.display(), "Artifact image missing");
                    return Ok(false);
                }
                Err(e) => return Err(self.record(ProviderError::io(&image, e))),
            }
        }
        Ok(true)
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("restore_dir", &self.config.restore_dir)
            .field("vms", &self.config.vms.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}
