// crates/core/src/provider/disk.rs
//! Raw block I/O against disks and artifact images.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::cbt::qcow::QCOW_MAGIC;
use crate::error::ProviderError;

/// How a disk is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskAccess {
    Read,
    ReadWrite,
    /// Create (or truncate) a sparse image of the given size.
    Create { size: u64 },
}

/// Opens disks for block I/O.
pub trait DiskBackend: Send + Sync {
    fn open_disk(&self, path: &str, access: DiskAccess)
        -> Result<Box<dyn DiskHandle>, ProviderError>;
}

/// An open disk. Offsets and lengths are in bytes.
pub trait DiskHandle: Send {
    fn size(&self) -> Result<u64, ProviderError>;

    /// Read up to `len` bytes at `offset`; shorter only at end of disk.
    fn read_blocks(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, ProviderError>;

    fn write_blocks(&mut self, offset: u64, data: &[u8]) -> Result<(), ProviderError>;

    /// Flush and release the disk. Further calls are errors.
    fn close(&mut self) -> Result<(), ProviderError>;

    /// Whether offsets address the guest's view of the disk. `false` when
    /// the handle reads an image container byte for byte, where guest
    /// offsets reported by a tracker do not line up with file offsets.
    fn guest_view(&self) -> bool {
        true
    }
}

/// Disk backend over regular files and block devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDiskBackend;

impl DiskBackend for FileDiskBackend {
    fn open_disk(
        &self,
        path: &str,
        access: DiskAccess,
    ) -> Result<Box<dyn DiskHandle>, ProviderError> {
        Ok(Box::new(FileDisk::open(Path::new(path), access)?))
    }
}

/// A file opened for positional I/O.
#[derive(Debug)]
pub struct FileDisk {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    container: bool,
}

impl FileDisk {
    pub fn open(path: &Path, access: DiskAccess) -> Result<Self, ProviderError> {
        let io = |e| ProviderError::io(path, e);
        let file = match access {
            DiskAccess::Read => File::open(path).map_err(io)?,
            DiskAccess::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(io)?,
            DiskAccess::Create { size } => {
                let f = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(io)?;
                f.set_len(size).map_err(io)?;
                f
            }
        };
        let size = disk_len(&file).map_err(io)?;
        let container = match access {
            DiskAccess::Create { .. } => false,
            _ => has_qcow_magic(&file).map_err(io)?,
        };
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            size,
            container,
        })
    }

    fn file(&mut self) -> Result<&mut File, ProviderError> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| {
            ProviderError::Backend(format!("disk {} is closed", path.display()))
        })
    }
}

/// Length of a regular file or block device. Block devices report a zero
/// metadata length, so fall back to seeking to the end.
fn disk_len(file: &File) -> std::io::Result<u64> {
    let len = file.metadata()?.len();
    if len > 0 {
        return Ok(len);
    }
    let mut f = file;
    let end = f.seek(SeekFrom::End(0))?;
    f.seek(SeekFrom::Start(0))?;
    Ok(end)
}

/// Whether the file starts with a QCOW header. Leaves the cursor at 0.
fn has_qcow_magic(file: &File) -> std::io::Result<bool> {
    let mut f = file;
    let mut magic = [0u8; 4];
    let found = match f.read_exact(&mut magic) {
        Ok(()) => magic == QCOW_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e),
    };
    f.seek(SeekFrom::Start(0))?;
    Ok(found)
}

impl DiskHandle for FileDisk {
    fn size(&self) -> Result<u64, ProviderError> {
        Ok(self.size)
    }

    fn read_blocks(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, ProviderError> {
        let available = self.size.saturating_sub(offset).min(len as u64) as usize;
        let path = self.path.clone();
        let file = self.file()?;
        let mut buf = vec![0u8; available];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| ProviderError::io(&path, e))?;
        tracing::trace!(path = %path.display(), offset, len = available, "read blocks");
        Ok(buf)
    }

    fn write_blocks(&mut self, offset: u64, data: &[u8]) -> Result<(), ProviderError> {
        let path = self.path.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|e| ProviderError::io(&path, e))?;
        self.size = self.size.max(offset + data.len() as u64);
        tracing::trace!(path = %path.display(), offset, len = data.len(), "wrote blocks");
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProviderError> {
        if let Some(mut file) = self.file.take() {
            file.flush().map_err(|e| ProviderError::io(&self.path, e))?;
            file.sync_all().map_err(|e| ProviderError::io(&self.path, e))?;
        }
        Ok(())
    }

    fn guest_view(&self) -> bool {
        !self.container
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk0.img");
        let path_str = path.to_str().unwrap();

        let mut disk = FileDiskBackend
            .open_disk(path_str, DiskAccess::Create { size: 4096 })
            .unwrap();
        assert_eq!(disk.size().unwrap(), 4096);
        disk.write_blocks(512, b"hello").unwrap();
        disk.close().unwrap();

        let mut disk = FileDiskBackend.open_disk(path_str, DiskAccess::Read).unwrap();
        assert_eq!(disk.read_blocks(512, 5).unwrap(), b"hello");
        assert_eq!(disk.read_blocks(0, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn test_read_is_clipped_at_end_of_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.img");
        std::fs::write(&path, [1u8; 100]).unwrap();
        let mut disk = FileDisk::open(&path, DiskAccess::Read).unwrap();
        assert_eq!(disk.read_blocks(90, 64).unwrap().len(), 10);
        assert!(disk.read_blocks(200, 64).unwrap().is_empty());
    }

    #[test]
    fn test_missing_disk_is_not_found() {
        let err = FileDiskBackend
            .open_disk("/nonexistent/vmbackup/disk.img", DiskAccess::Read)
            .err().unwrap();
        assert!(matches!(err, ProviderError::DiskNotFound { .. }));
    }

    #[test]
    fn test_qcow_container_is_not_a_guest_view() {
        let dir = tempfile::tempdir().unwrap();
        let qcow = dir.path().join("web01.qcow2");
        let mut header = QCOW_MAGIC.to_vec();
        header.resize(4096, 0);
        std::fs::write(&qcow, &header).unwrap();
        let mut disk = FileDisk::open(&qcow, DiskAccess::Read).unwrap();
        assert!(!disk.guest_view());
        assert_eq!(disk.read_blocks(0, 4).unwrap(), QCOW_MAGIC);

        let raw = dir.path().join("web01.img");
        std::fs::write(&raw, [0u8; 2]).unwrap();
        assert!(FileDisk::open(&raw, DiskAccess::Read).unwrap().guest_view());
    }

    #[test]
    fn test_closed_disk_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.img");
        let mut disk = FileDisk::open(&path, DiskAccess::Create { size: 10 }).unwrap();
        disk.close().unwrap();
        assert!(disk.read_blocks(0, 1).is_err());
    }
}
