// crates/core/src/job/restore.rs
//! Restore of a backup artifact into a freshly provisioned VM.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::copy::{copy_ranges, percent, DiskProgress};
use super::fanout::{run_per_disk, DiskScope};
use super::{Job, JobContext, JobKind, JobWork, RestoreConfig};
use crate::cbt::BlockRange;
use crate::error::{JobError, ProviderError};
use crate::manifest::{BackupManifest, DiskEntry};
use crate::provider::disk::FileDisk;
use crate::provider::{BackupProvider, DiskAccess, DiskHandle, RestoreDiskSpec};

pub type RestoreJob = Job<RestoreWork>;

impl RestoreJob {
    pub fn new(config: RestoreConfig, provider: Arc<dyn BackupProvider>) -> Self {
        let max_disks = config.max_concurrent_disks;
        Job::with_dedicated_engine(RestoreWork::new(config, provider), max_disks)
    }

    pub fn config(&self) -> &RestoreConfig {
        self.work().config()
    }
}

pub struct RestoreWork {
    config: Arc<RestoreConfig>,
    provider: Arc<dyn BackupProvider>,
    progress: Arc<DiskProgress>,
}

impl RestoreWork {
    pub fn new(config: RestoreConfig, provider: Arc<dyn BackupProvider>) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            progress: Arc::new(DiskProgress::default()),
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    /// Progress of each restored disk, keyed by image name.
    pub fn disk_progress(&self) -> BTreeMap<String, u8> {
        self.progress.snapshot()
    }

    fn run(&self, ctx: &JobContext, manifest: &BackupManifest) -> Result<(), JobError> {
        let cfg = &self.config;
        let specs: Vec<RestoreDiskSpec> = manifest
            .disks
            .iter()
            .map(|d| RestoreDiskSpec {
                name: d.file_name.clone(),
                size: d.size,
            })
            .collect();
        let targets = self.provider.start_restore(&cfg.target_vm_name, &specs)?;
        if targets.len() != specs.len() {
            return Err(JobError::Provider(ProviderError::Backend(format!(
                "provider created {} disk(s) for {} in the backup",
                targets.len(),
                specs.len()
            ))));
        }
        ctx.report_status(format!(
            "Restoring {} disk(s) of backup {} into VM {}",
            specs.len(),
            manifest.backup_id,
            cfg.target_vm_name
        ));

        let items: Vec<(DiskEntry, String)> = manifest.disks.iter().cloned().zip(targets).collect();
        let restore = Arc::new(DiskRestore {
            config: Arc::clone(&self.config),
            provider: Arc::clone(&self.provider),
            progress: Arc::clone(&self.progress),
        });
        run_per_disk(ctx, items, move |(disk, target), scope| {
            restore.restore_disk(&disk, &target, scope)
        })?;
        Ok(())
    }
}

impl JobWork for RestoreWork {
    const KIND: JobKind = JobKind::Restore;

    fn validate(&self) -> Result<(), JobError> {
        self.config.validate()
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let cfg = &self.config;
        let manifest = BackupManifest::load(&cfg.backup_path)?;
        if manifest.disks.is_empty() {
            return Err(JobError::Manifest(format!(
                "backup {} lists no disks",
                manifest.backup_id
            )));
        }
        self.progress
            .reset(manifest.disks.iter().map(|d| d.file_name.as_str()));

        match self.run(ctx, &manifest) {
            Ok(()) => {
                tracing::info!(job_id = %ctx.job_id(), backup_id = %manifest.backup_id, target_vm = %cfg.target_vm_name, "Restore completed");
                ctx.report_status(format!("Restored VM {}", cfg.target_vm_name));
                Ok(())
            }
            Err(e) => {
                // Every disk task has settled; tear down the partial target.
                if let Err(cancel_err) = self.provider.cancel_restore(&cfg.target_vm_name) {
                    tracing::warn!(target_vm = %cfg.target_vm_name, error = %cancel_err, "Provider cancel_restore failed");
                }
                Err(e)
            }
        }
    }
}

struct DiskRestore {
    config: Arc<RestoreConfig>,
    provider: Arc<dyn BackupProvider>,
    progress: Arc<DiskProgress>,
}

impl DiskRestore {
    fn restore_disk(
        &self,
        disk: &DiskEntry,
        target: &str,
        scope: &DiskScope<'_>,
    ) -> Result<(), JobError> {
        scope.checkpoint()?;
        let image = self.config.backup_path.join(&disk.file_name);
        let mut src = FileDisk::open(&image, DiskAccess::Read)?;
        if src.size()? != disk.size {
            return Err(JobError::Manifest(format!(
                "image {} does not match recorded size {}",
                image.display(),
                disk.size
            )));
        }
        let mut dst = self
            .provider
            .disk_backend()
            .open_disk(target, DiskAccess::ReadWrite)?;

        tracing::debug!(image = %image.display(), target, size = disk.size, "Restoring disk");
        copy_ranges(
            &mut src,
            &mut *dst,
            &[BlockRange::new(0, disk.size)],
            self.config.chunk_size,
            || scope.checkpoint(),
            |done, total| {
                let mean = self.progress.update(&disk.file_name, percent(done, total));
                scope.ctx.report_progress(mean);
            },
        )?;
        dst.close()?;
        src.close()?;
        Ok(())
    }
}
