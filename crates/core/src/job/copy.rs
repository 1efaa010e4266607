// crates/core/src/job/copy.rs
//! Chunked range copy shared by backup and restore, and per-disk progress
//! aggregation shared by all three job kinds.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::cbt::{normalize_ranges, BlockRange};
use crate::error::{JobError, ProviderError};
use crate::provider::DiskHandle;

/// Split ranges into reads of at most `chunk_size` bytes, preserving
/// ascending offset order.
pub fn plan_chunks(ranges: &[BlockRange], chunk_size: usize) -> Vec<BlockRange> {
    let chunk = chunk_size.max(1) as u64;
    let mut chunks = Vec::new();
    for range in ranges {
        let mut offset = range.offset;
        while offset < range.end() {
            let len = chunk.min(range.end() - offset);
            chunks.push(BlockRange::new(offset, len));
            offset += len;
        }
    }
    chunks
}

/// Copy exactly `ranges` from `src` to `dst` at identical offsets.
///
/// Ranges are normalized against the source size first, so overlapping or
/// unordered tracker output is tolerated. `before_chunk` runs ahead of every
/// chunk and may stop the copy (pause/cancel safe point); `after_chunk`
/// receives `(bytes_done, bytes_total)`. Returns the ranges actually copied.
pub fn copy_ranges(
    src: &mut dyn DiskHandle,
    dst: &mut dyn DiskHandle,
    ranges: &[BlockRange],
    chunk_size: usize,
    mut before_chunk: impl FnMut() -> Result<(), JobError>,
    mut after_chunk: impl FnMut(u64, u64),
) -> Result<Vec<BlockRange>, JobError> {
    let ranges = normalize_ranges(ranges, src.size()?);
    let chunks = plan_chunks(&ranges, chunk_size);
    let total: u64 = chunks.iter().map(|c| c.length).sum();
    let mut done = 0u64;

    for chunk in &chunks {
        before_chunk()?;
        let data = src.read_blocks(chunk.offset, chunk.length as usize)?;
        if data.len() as u64 != chunk.length {
            return Err(JobError::Provider(ProviderError::Backend(format!(
                "short read at offset {}: wanted {} bytes, got {}",
                chunk.offset,
                chunk.length,
                data.len()
            ))));
        }
        dst.write_blocks(chunk.offset, &data)?;
        done += chunk.length;
        tracing::trace!(offset = chunk.offset, len = chunk.length, done, total, "Copied chunk");
        after_chunk(done, total);
    }
    if chunks.is_empty() {
        after_chunk(0, 0);
    }
    Ok(ranges)
}

/// Percent of `done` over `total`; an empty workload is complete.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((done.min(total) as u128 * 100) / total as u128) as u8
    }
}

/// Per-disk progress map; the job's progress is the mean.
#[derive(Debug, Default)]
pub struct DiskProgress {
    disks: Mutex<BTreeMap<String, u8>>,
}

impl DiskProgress {
    pub fn new<'a>(disks: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            disks: Mutex::new(disks.into_iter().map(|d| (d.to_string(), 0)).collect()),
        }
    }

    /// Replace the tracked disks, all at 0%.
    pub fn reset<'a>(&self, disks: impl IntoIterator<Item = &'a str>) {
        match self.disks.lock() {
            Ok(mut map) => *map = disks.into_iter().map(|d| (d.to_string(), 0)).collect(),
            Err(e) => tracing::error!(error = %e, "DiskProgress lock poisoned"),
        }
    }

    /// Record one disk's position and return the new mean.
    pub fn update(&self, disk: &str, percent: u8) -> u8 {
        match self.disks.lock() {
            Ok(mut disks) => {
                disks.insert(disk.to_string(), percent.min(100));
                mean(&disks)
            }
            Err(e) => {
                tracing::error!(error = %e, "DiskProgress lock poisoned");
                0
            }
        }
    }

    pub fn mean(&self) -> u8 {
        self.disks.lock().map(|d| mean(&d)).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u8> {
        self.disks.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

fn mean(disks: &BTreeMap<String, u8>) -> u8 {
    if disks.is_empty() {
        return 0;
    }
    let sum: u64 = disks.values().map(|&p| u64::from(p)).sum();
    (sum / disks.len() as u64) as u8
}
