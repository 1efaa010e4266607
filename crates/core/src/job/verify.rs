// crates/core/src/job/verify.rs
//! Backup verification: provider integrity check and block comparison of
//! artifact images against their source disks.

use std::path::PathBuf;
use std::sync::Arc;

use super::copy::{percent, plan_chunks, DiskProgress};
use super::fanout::{run_per_disk, DiskScope};
use super::{Job, JobContext, JobKind, JobWork, VerifyConfig};
use crate::cbt::{normalize_ranges, BlockRange};
use crate::error::JobError;
use crate::manifest::{BackupManifest, DiskEntry};
use crate::provider::disk::FileDisk;
use crate::provider::{BackupProvider, DiskAccess, DiskHandle};

pub type VerifyJob = Job<VerifyWork>;

impl VerifyJob {
    pub fn new(config: VerifyConfig, provider: Arc<dyn BackupProvider>) -> Self {
        let max_disks = config.max_concurrent_disks;
        Job::with_dedicated_engine(VerifyWork::new(config, provider), max_disks)
    }

    pub fn config(&self) -> &VerifyConfig {
        self.work().config()
    }
}

pub struct VerifyWork {
    config: Arc<VerifyConfig>,
    provider: Arc<dyn BackupProvider>,
}

impl VerifyWork {
    pub fn new(config: VerifyConfig, provider: Arc<dyn BackupProvider>) -> Self {
        Self {
            config: Arc::new(config),
            provider,
        }
    }

    pub fn config(&self) -> &VerifyConfig {
        &self.config
    }
}

impl JobWork for VerifyWork {
    const KIND: JobKind = JobKind::Verify;

    fn validate(&self) -> Result<(), JobError> {
        self.config.validate()
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let cfg = &self.config;
        let manifest = BackupManifest::load(&cfg.backup_path)?;
        if manifest.vm_id != cfg.vm_id {
            return Err(JobError::Manifest(format!(
                "artifact {} belongs to VM {}, not {}",
                manifest.backup_id, manifest.vm_id, cfg.vm_id
            )));
        }

        if cfg.verify_checksum {
            ctx.report_status(format!("Checking integrity of backup {}", manifest.backup_id));
            ctx.checkpoint()?;
            if !self.provider.verify_backup(&cfg.vm_id, &cfg.backup_path)? {
                return Err(JobError::Manifest(format!(
                    "integrity check failed for backup {}",
                    manifest.backup_id
                )));
            }
        }

        if cfg.compare_source {
            ctx.report_status(format!(
                "Comparing {} disk(s) of backup {} against source",
                manifest.disks.len(),
                manifest.backup_id
            ));
            let compare = Arc::new(Compare {
                config: Arc::clone(&self.config),
                provider: Arc::clone(&self.provider),
                progress: DiskProgress::new(manifest.disks.iter().map(|d| d.file_name.as_str())),
            });
            run_per_disk(ctx, manifest.disks.clone(), move |disk, scope| {
                compare.verify_disk(disk, scope)
            })?;
        }

        tracing::info!(job_id = %ctx.job_id(), vm_id = %cfg.vm_id, backup_id = %manifest.backup_id, "Backup verified");
        ctx.report_status(format!("Backup {} verified", manifest.backup_id));
        Ok(())
    }
}

struct Compare {
    config: Arc<VerifyConfig>,
    provider: Arc<dyn BackupProvider>,
    progress: DiskProgress,
}

impl Compare {
    /// Compare the whole image with the source chunk by chunk. An
    /// incremental image holds seeded base data outside its recorded ranges,
    /// so every byte is checked. Fails as soon as the mismatched chunk count
    /// exceeds the budget.
    fn verify_disk(&self, disk: DiskEntry, scope: &DiskScope<'_>) -> Result<(), JobError> {
        scope.checkpoint()?;
        let image: PathBuf = self.config.backup_path.join(&disk.file_name);
        let mut artifact = FileDisk::open(&image, DiskAccess::Read)?;
        let mut source = self
            .provider
            .disk_backend()
            .open_disk(&disk.source_path, DiskAccess::Read)?;
        let source_size = source.size()?;
        if source_size != disk.size {
            return Err(JobError::Manifest(format!(
                "source disk {} is {} bytes, backup recorded {}",
                disk.source_path, source_size, disk.size
            )));
        }

        let whole = normalize_ranges(&[BlockRange::new(0, disk.size)], disk.size);
        let chunks = plan_chunks(&whole, self.config.chunk_size);
        let total: u64 = chunks.iter().map(|c| c.length).sum();
        let mut done = 0u64;
        let mut mismatches = 0u64;
        for chunk in &chunks {
            scope.checkpoint()?;
            let expected = source.read_blocks(chunk.offset, chunk.length as usize)?;
            let actual = artifact.read_blocks(chunk.offset, chunk.length as usize)?;
            if expected != actual {
                mismatches += 1;
                tracing::debug!(disk = %disk.file_name, offset = chunk.offset, mismatches, "Chunk mismatch");
                if mismatches > self.config.mismatch_budget {
                    return Err(JobError::Mismatch {
                        disk: disk.file_name,
                        mismatches,
                        budget: self.config.mismatch_budget,
                    });
                }
            }
            done += chunk.length;
            let mean = self.progress.update(&disk.file_name, percent(done, total));
            scope.ctx.report_progress(mean);
        }
        if chunks.is_empty() {
            let mean = self.progress.update(&disk.file_name, 100);
            scope.ctx.report_progress(mean);
        }
        if mismatches > 0 {
            tracing::warn!(disk = %disk.file_name, mismatches, budget = self.config.mismatch_budget, "Mismatches within budget");
        }
        artifact.close()?;
        source.close()?;
        Ok(())
    }
}
