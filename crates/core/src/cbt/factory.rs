// crates/core/src/cbt/factory.rs
//! Tracker selection per disk.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::cbt::lvm::query_volumes;
use crate::cbt::qcow::QCOW_MAGIC;
use crate::cbt::{
    ChangedBlockTracker, CommandRunner, LvmCbt, ManagedCbt, QcowCbt, SystemCommandRunner,
};
use crate::error::CbtError;
use crate::provider::BackupProvider;

/// What a disk path turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    LogicalVolume,
    Unsupported(String),
}

/// Picks the tracker variant for a disk.
///
/// Providers with native CBT always get the managed variant. Otherwise the
/// disk is classified by content (QCOW signature) or by device-mapper
/// naming plus an `lvs` lookup.
#[derive(Clone)]
pub struct CbtFactory {
    runner: Arc<dyn CommandRunner>,
}

impl Default for CbtFactory {
    fn default() -> Self {
        Self::new(Arc::new(SystemCommandRunner))
    }
}

impl CbtFactory {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn classify(&self, path: &Path) -> Result<DiskFormat, CbtError> {
        let classification = |source| CbtError::Classification {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(classification)?;
        let file_type = meta.file_type();

        if file_type.is_file() {
            let mut magic = [0u8; 4];
            let mut file = File::open(path).map_err(classification)?;
            return match file.read_exact(&mut magic) {
                Ok(()) if magic == QCOW_MAGIC => Ok(DiskFormat::Qcow2),
                Ok(()) => Ok(DiskFormat::Unsupported(
                    "regular file without a QCOW signature".into(),
                )),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(
                    DiskFormat::Unsupported("file too short to carry a signature".into()),
                ),
                Err(e) => Err(classification(e)),
            };
        }

        if is_device(&file_type) {
            if !is_device_mapper(path) {
                return Ok(DiskFormat::Unsupported(
                    "block device outside device-mapper".into(),
                ));
            }
            let Some(device) = path.to_str() else {
                return Ok(DiskFormat::Unsupported("non UTF-8 device path".into()));
            };
            return match query_volumes(self.runner.as_ref(), device) {
                Ok(volumes) if !volumes.is_empty() => Ok(DiskFormat::LogicalVolume),
                Ok(_) => Ok(DiskFormat::Unsupported(
                    "device-mapper device is not a logical volume".into(),
                )),
                Err(e) => Ok(DiskFormat::Unsupported(format!(
                    "logical volume lookup failed: {e}"
                ))),
            };
        }

        Ok(DiskFormat::Unsupported(
            "not a regular file or block device".into(),
        ))
    }

    /// Tracker for `disk_path`, or why there is none.
    pub fn select(
        &self,
        provider: &Arc<dyn BackupProvider>,
        vm_id: &str,
        disk_path: &str,
    ) -> Result<Box<dyn ChangedBlockTracker>, CbtError> {
        if provider.supports_native_cbt() {
            return Ok(Box::new(ManagedCbt::new(
                Arc::clone(provider),
                vm_id,
                disk_path,
            )));
        }
        let path = Path::new(disk_path);
        let format = self.classify(path)?;
        tracing::debug!(vm_id, disk = disk_path, ?format, "Classified disk for CBT");
        match format {
            DiskFormat::Qcow2 => Ok(Box::new(QcowCbt::new(path, Arc::clone(&self.runner)))),
            DiskFormat::LogicalVolume => {
                Ok(Box::new(LvmCbt::new(path, Arc::clone(&self.runner))))
            }
            DiskFormat::Unsupported(reason) => Err(CbtError::Unsupported {
                path: path.to_path_buf(),
                reason,
            }),
        }
    }
}

impl std::fmt::Debug for CbtFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbtFactory").finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn is_device(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_block_device() || file_type.is_char_device()
}

#[cfg(not(unix))]
fn is_device(_file_type: &std::fs::FileType) -> bool {
    false
}

/// `/dev/mapper/*` names, or anything resolving to `/dev/dm-*` (which covers
/// the `/dev/<vg>/<lv>` symlinks).
fn is_device_mapper(path: &Path) -> bool {
    if path.starts_with("/dev/mapper") {
        return true;
    }
    std::fs::canonicalize(path)
        .ok()
        .filter(|p| p.parent() == Some(Path::new("/dev")))
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with("dm-")))
        .unwrap_or(false)
}
