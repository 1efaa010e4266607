// crates/core/tests/common/mod.rs
//! In-memory provider and disks shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vmbackup_core::cbt::BlockRange;
use vmbackup_core::error::ProviderError;
use vmbackup_core::job::{BackupConfig, JobStatus};
use vmbackup_core::manifest::BackupManifest;
use vmbackup_core::provider::{
    BackupProvider, DiskAccess, DiskBackend, DiskHandle, RestoreDiskSpec, VmInfo,
};

/// One recorded read: disk path, offset, length.
pub type ReadLog = Vec<(String, u64, usize)>;

#[derive(Default)]
struct MemState {
    disks: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
    reads: Mutex<ReadLog>,
    read_delay: Mutex<Duration>,
}

/// Disks held in memory, keyed by path.
#[derive(Clone, Default)]
pub struct MemBackend {
    state: Arc<MemState>,
}

impl MemBackend {
    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.state
            .disks
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::new(Mutex::new(data)));
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let disks = self.state.disks.lock().unwrap();
        disks.get(path).map(|d| d.lock().unwrap().clone())
    }

    /// Overwrite `data.len()` bytes at `offset` of an existing disk.
    pub fn patch(&self, path: &str, offset: usize, data: &[u8]) {
        let disks = self.state.disks.lock().unwrap();
        let mut disk = disks[path].lock().unwrap();
        disk[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn remove_prefix(&self, prefix: &str) {
        self.state
            .disks
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(prefix));
    }

    pub fn take_reads(&self) -> ReadLog {
        std::mem::take(&mut *self.state.reads.lock().unwrap())
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.state.read_delay.lock().unwrap() = delay;
    }
}

impl DiskBackend for MemBackend {
    fn open_disk(&self, path: &str, access: DiskAccess) -> Result<Box<dyn DiskHandle>, ProviderError> {
        if let DiskAccess::Create { size } = access {
            self.insert(path, vec![0; size as usize]);
        }
        let data = self
            .state
            .disks
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ProviderError::DiskNotFound {
                path: PathBuf::from(path),
            })?;
        Ok(Box::new(MemDisk {
            path: path.to_string(),
            data,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MemDisk {
    path: String,
    data: Arc<Mutex<Vec<u8>>>,
    state: Arc<MemState>,
    closed: bool,
}

impl MemDisk {
    fn check_open(&self) -> Result<(), ProviderError> {
        if self.closed {
            Err(ProviderError::Backend(format!("{} is closed", self.path)))
        } else {
            Ok(())
        }
    }
}

impl DiskHandle for MemDisk {
    fn size(&self) -> Result<u64, ProviderError> {
        self.check_open()?;
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn read_blocks(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, ProviderError> {
        self.check_open()?;
        let delay = *self.state.read_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.state
            .reads
            .lock()
            .unwrap()
            .push((self.path.clone(), offset, len));
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write_blocks(&mut self, offset: u64, bytes: &[u8]) -> Result<(), ProviderError> {
        self.check_open()?;
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        if start + bytes.len() > data.len() {
            return Err(ProviderError::Backend(format!("write past end of {}", self.path)));
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}

/// Scriptable provider over [`MemBackend`] with optional native CBT.
pub struct FakeProvider {
    pub backend: MemBackend,
    vms: Mutex<HashMap<String, Vec<String>>>,
    native_cbt: bool,
    cbt_enabled: Mutex<HashSet<String>>,
    changed: Mutex<HashMap<String, Vec<BlockRange>>>,
    pub fail_changed_blocks: AtomicBool,
    pub verify_result: AtomicBool,
    /// Disks to provision short on restore, to simulate a broken backend.
    pub restore_short: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            backend: MemBackend::default(),
            vms: Mutex::new(HashMap::new()),
            native_cbt: false,
            cbt_enabled: Mutex::new(HashSet::new()),
            changed: Mutex::new(HashMap::new()),
            fail_changed_blocks: AtomicBool::new(false),
            verify_result: AtomicBool::new(true),
            restore_short: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_native_cbt(mut self) -> Self {
        self.native_cbt = true;
        self
    }

    /// Register a VM whose disks are `<vm_id>/disk<N>` with the given data.
    pub fn with_vm(self, vm_id: &str, disks: Vec<Vec<u8>>) -> Self {
        let paths: Vec<String> = disks
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                let path = format!("{vm_id}/disk{i}");
                self.backend.insert(&path, data);
                path
            })
            .collect();
        self.vms.lock().unwrap().insert(vm_id.to_string(), paths);
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_changed(&self, disk_path: &str, ranges: Vec<BlockRange>) {
        self.changed
            .lock()
            .unwrap()
            .insert(disk_path.to_string(), ranges);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BackupProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn connect(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn list_vms(&self) -> Result<Vec<VmInfo>, ProviderError> {
        let vms = self.vms.lock().unwrap();
        Ok(vms
            .iter()
            .map(|(id, disks)| VmInfo {
                id: id.clone(),
                name: id.clone(),
                power_state: "running".into(),
                disk_count: disks.len(),
            })
            .collect())
    }

    fn vm_info(&self, vm_id: &str) -> Result<VmInfo, ProviderError> {
        self.list_vms()?
            .into_iter()
            .find(|vm| vm.id == vm_id)
            .ok_or_else(|| ProviderError::VmNotFound(vm_id.to_string()))
    }

    fn vm_disk_paths(&self, vm_id: &str) -> Result<Vec<String>, ProviderError> {
        self.vms
            .lock()
            .unwrap()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| ProviderError::VmNotFound(vm_id.to_string()))
    }

    fn disk_backend(&self) -> Arc<dyn DiskBackend> {
        Arc::new(self.backend.clone())
    }

    fn start_backup(&self, vm_id: &str, _backup_id: &str, _config: &BackupConfig) -> Result<(), ProviderError> {
        self.record(format!("start_backup {vm_id}"));
        Ok(())
    }

    fn pause_backup(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.record(format!("pause_backup {vm_id}"));
        Ok(())
    }

    fn resume_backup(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.record(format!("resume_backup {vm_id}"));
        Ok(())
    }

    fn cancel_backup(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.record(format!("cancel_backup {vm_id}"));
        Ok(())
    }

    fn finish_backup(&self, vm_id: &str, _backup_id: &str) -> Result<(), ProviderError> {
        self.record(format!("finish_backup {vm_id}"));
        Ok(())
    }

    fn start_restore(&self, target: &str, disks: &[RestoreDiskSpec]) -> Result<Vec<String>, ProviderError> {
        self.record(format!("start_restore {target}"));
        let count = if self.restore_short.load(Ordering::SeqCst) {
            disks.len().saturating_sub(1)
        } else {
            disks.len()
        };
        let paths: Vec<String> = disks
            .iter()
            .take(count)
            .map(|spec| {
                let path = format!("{target}/{}", spec.name);
                self.backend.insert(&path, vec![0; spec.size as usize]);
                path
            })
            .collect();
        self.vms
            .lock()
            .unwrap()
            .insert(target.to_string(), paths.clone());
        Ok(paths)
    }

    fn cancel_restore(&self, target: &str) -> Result<(), ProviderError> {
        self.record(format!("cancel_restore {target}"));
        self.backend.remove_prefix(&format!("{target}/"));
        self.vms.lock().unwrap().remove(target);
        Ok(())
    }

    fn supports_native_cbt(&self) -> bool {
        self.native_cbt
    }

    fn enable_cbt(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.record(format!("enable_cbt {vm_id}"));
        self.cbt_enabled.lock().unwrap().insert(vm_id.to_string());
        Ok(())
    }

    fn disable_cbt(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.cbt_enabled.lock().unwrap().remove(vm_id);
        Ok(())
    }

    fn is_cbt_enabled(&self, vm_id: &str) -> Result<bool, ProviderError> {
        Ok(self.cbt_enabled.lock().unwrap().contains(vm_id))
    }

    fn changed_blocks(&self, _vm_id: &str, disk_path: &str) -> Result<Vec<BlockRange>, ProviderError> {
        if self.fail_changed_blocks.load(Ordering::SeqCst) {
            return Err(ProviderError::Backend("change tracking reset by host".into()));
        }
        Ok(self
            .changed
            .lock()
            .unwrap()
            .get(disk_path)
            .cloned()
            .unwrap_or_default())
    }

    /// Changes reported so far are now captured; start over from nothing.
    fn reset_cbt(&self, _vm_id: &str, disk_path: &str) -> Result<(), ProviderError> {
        self.record(format!("reset_cbt {disk_path}"));
        self.changed.lock().unwrap().remove(disk_path);
        Ok(())
    }

    fn verify_backup(&self, _vm_id: &str, _backup_path: &Path) -> Result<bool, ProviderError> {
        Ok(self.verify_result.load(Ordering::SeqCst))
    }

    fn last_error(&self) -> Option<String> {
        None
    }
}

/// `len` bytes of a repeating pattern seeded by `seed`.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Backup config rooted in `dir` with small chunks so tests exercise splitting.
pub fn backup_config(vm_id: &str, dir: &Path) -> BackupConfig {
    let mut config = BackupConfig::new(vm_id, dir);
    config.chunk_size = 1024;
    config
}

/// Poll `cond` for up to two seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub fn wait_for_status(status: impl Fn() -> JobStatus, want: JobStatus) -> bool {
    wait_until(|| status() == want)
}

/// Artifact directories under `<dir>/<vm_id>/`, oldest first by name.
pub fn artifacts(dir: &Path, vm_id: &str) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir.join(vm_id))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    found.sort();
    found
}

pub fn manifest_of(artifact: &Path) -> BackupManifest {
    BackupManifest::load(artifact).unwrap()
}
