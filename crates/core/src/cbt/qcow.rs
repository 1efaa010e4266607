// crates/core/src/cbt/qcow.rs
//! Tracking for QCOW2 images through a persistent dirty bitmap.
//!
//! Enabling adds a bitmap named [`BITMAP_NAME`] to the image; QEMU then marks
//! every guest write in it. To read it, the image is exported read-only over
//! a private NBD socket with the bitmap attached, and `qemu-img map` reports
//! the bitmap's dirty extents as `"data": false`. Offsets are guest offsets.
//! Resetting clears the bitmap once a backup has captured those extents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::cbt::{normalize_ranges, BlockRange, ChangedBlockTracker, CommandRunner};
use crate::error::CbtError;

/// First four bytes of every QCOW image.
pub const QCOW_MAGIC: [u8; 4] = *b"QFI\xfb";

pub const BITMAP_NAME: &str = "vmbackup";

const QEMU_IMG: &str = "qemu-img";
const QEMU_NBD: &str = "qemu-nbd";

/// One entry of `qemu-img map --output=json`.
#[derive(Debug, Deserialize)]
struct MapExtent {
    start: u64,
    length: u64,
    #[serde(default)]
    data: bool,
}

/// Unix socket the bitmap export of `image` listens on while it is read.
pub fn export_socket(image: &Path) -> PathBuf {
    let name = image
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image");
    std::env::temp_dir().join(format!("vmbackup-{}-{name}.sock", std::process::id()))
}

pub struct QcowCbt {
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl QcowCbt {
    pub fn new(path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            path: path.into(),
            runner,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_str(&self) -> Result<&str, CbtError> {
        self.path
            .to_str()
            .ok_or_else(|| CbtError::Parse(format!("non UTF-8 path {}", self.path.display())))
    }

    /// Bitmap names recorded in the image header.
    fn bitmaps(&self) -> Result<Vec<String>, CbtError> {
        // -U: the image is usually held open by a running guest.
        let out = self
            .runner
            .run(QEMU_IMG, &["info", "-U", "--output=json", self.path_str()?])?;
        let info: serde_json::Value =
            serde_json::from_str(&out).map_err(|e| CbtError::Parse(format!("qemu-img info: {e}")))?;
        let names = info
            .pointer("/format-specific/data/bitmaps")
            .and_then(|b| b.as_array())
            .map(|bitmaps| {
                bitmaps
                    .iter()
                    .filter_map(|b| b.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    /// Dirty extents of the bitmap, read through a one-shot NBD export. The
    /// export serves a single client and exits when it disconnects.
    fn read_bitmap(&self) -> Result<String, CbtError> {
        let socket = export_socket(&self.path);
        let socket_str = socket
            .to_str()
            .ok_or_else(|| CbtError::Parse(format!("non UTF-8 path {}", socket.display())))?;
        remove_socket(&socket);

        self.runner.run(
            QEMU_NBD,
            &[
                "--fork",
                "--read-only",
                "--force-share",
                "--format=qcow2",
                &format!("--bitmap={BITMAP_NAME}"),
                &format!("--socket={socket_str}"),
                self.path_str()?,
            ],
        )?;
        let opts = format!(
            "driver=nbd,server.type=unix,server.path={socket_str},x-dirty-bitmap=qemu:dirty-bitmap:{BITMAP_NAME}"
        );
        let out = self
            .runner
            .run(QEMU_IMG, &["map", "--output=json", "--image-opts", &opts]);
        remove_socket(&socket);
        out
    }
}

fn remove_socket(socket: &Path) {
    if let Err(e) = std::fs::remove_file(socket) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(socket = %socket.display(), error = %e, "Could not remove export socket");
        }
    }
}

impl ChangedBlockTracker for QcowCbt {
    fn name(&self) -> &str {
        "qcow2"
    }

    fn is_enabled(&self) -> Result<bool, CbtError> {
        Ok(self.bitmaps()?.iter().any(|n| n == BITMAP_NAME))
    }

    fn enable(&self) -> Result<(), CbtError> {
        tracing::info!(path = %self.path.display(), "Adding CBT bitmap");
        self.runner
            .run(QEMU_IMG, &["bitmap", "--add", self.path_str()?, BITMAP_NAME])?;
        Ok(())
    }

    fn disable(&self) -> Result<(), CbtError> {
        tracing::info!(path = %self.path.display(), "Removing CBT bitmap");
        self.runner
            .run(QEMU_IMG, &["bitmap", "--remove", self.path_str()?, BITMAP_NAME])?;
        Ok(())
    }

    fn changed_blocks(&self) -> Result<Vec<BlockRange>, CbtError> {
        if !self.is_enabled()? {
            return Err(CbtError::NotEnabled(self.path.display().to_string()));
        }
        let out = self.read_bitmap()?;
        let extents: Vec<MapExtent> =
            serde_json::from_str(&out).map_err(|e| CbtError::Parse(format!("qemu-img map: {e}")))?;
        // x-dirty-bitmap inverts the sense of "data": dirty extents read false.
        let dirty: Vec<BlockRange> = extents
            .into_iter()
            .filter(|e| !e.data)
            .map(|e| BlockRange::new(e.start, e.length))
            .collect();
        let ranges = normalize_ranges(&dirty, u64::MAX);
        tracing::debug!(path = %self.path.display(), ranges = ranges.len(), "QCOW2 dirty extents");
        Ok(ranges)
    }

    fn reset(&self) -> Result<(), CbtError> {
        tracing::debug!(path = %self.path.display(), "Clearing CBT bitmap");
        self.runner
            .run(QEMU_IMG, &["bitmap", "--clear", self.path_str()?, BITMAP_NAME])?;
        Ok(())
    }
}

impl std::fmt::Debug for QcowCbt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QcowCbt").field("path", &self.path).finish()
    }
}
