// crates/core/src/cbt/mod.rs
//! Changed-block tracking behind one capability interface.
//!
//! Three variants:
//! - `ManagedCbt`: delegates to the hypervisor's own tracking via the provider
//! - `QcowCbt`: copy-on-write images, via `qemu-img`
//! - `LvmCbt`: device-mapper logical volumes, via the LVM tools
//!
//! `CbtFactory` picks the variant for a disk. All offsets and lengths are in
//! bytes.

pub mod command;
pub mod factory;
pub mod lvm;
pub mod managed;
pub mod qcow;

use serde::{Deserialize, Serialize};

use crate::error::CbtError;

pub use command::{CommandRunner, SystemCommandRunner};
pub use factory::{CbtFactory, DiskFormat};
pub use lvm::LvmCbt;
pub use managed::ManagedCbt;
pub use qcow::QcowCbt;

/// One contiguous dirty region, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub offset: u64,
    pub length: u64,
}

impl BlockRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Sort, clip to `disk_size`, drop empty ranges, and merge overlapping or
/// touching ranges. Trackers should already report ascending, disjoint
/// ranges; this tolerates the ones that don't.
pub fn normalize_ranges(ranges: &[BlockRange], disk_size: u64) -> Vec<BlockRange> {
    let mut sorted: Vec<BlockRange> = ranges
        .iter()
        .filter(|r| !r.is_empty() && r.offset < disk_size)
        .map(|r| BlockRange::new(r.offset, r.end().min(disk_size) - r.offset))
        .collect();
    sorted.sort_unstable();

    let mut merged: Vec<BlockRange> = Vec::with_capacity(sorted.len());
    for r in sorted {
        match merged.last_mut() {
            Some(last) if r.offset <= last.end() => {
                let end = last.end().max(r.end());
                last.length = end - last.offset;
            }
            _ => merged.push(r),
        }
    }
    merged
}

/// Total bytes covered by already-normalized ranges.
pub fn covered_bytes(ranges: &[BlockRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

/// Dirty-region tracking for a single disk.
pub trait ChangedBlockTracker: Send + Sync {
    /// Short identifier for logs and manifests (e.g. "managed", "qcow2", "lvm").
    fn name(&self) -> &str;

    fn is_enabled(&self) -> Result<bool, CbtError>;

    fn enable(&self) -> Result<(), CbtError>;

    fn disable(&self) -> Result<(), CbtError>;

    /// Regions changed since the tracker's reference point, ascending.
    fn changed_blocks(&self) -> Result<Vec<BlockRange>, CbtError>;

    /// Move the reference point to now. Called after a backup that captured
    /// the current changes has been committed.
    fn reset(&self) -> Result<(), CbtError>;
}
