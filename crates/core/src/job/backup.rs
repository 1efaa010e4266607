// crates/core/src/job/backup.rs
//! Full and incremental VM backup.
//!
//! One task per disk copies into `<backup_dir>/<vm_id>/<backup_id>/`. With an
//! enabled tracker and a previous artifact of the same disk, the new image is
//! seeded from that artifact and only the changed ranges are read from the
//! source, so every artifact is a self-contained image.
//!
//! Writing `manifest.json` is the commit point. Once the job has committed it
//! can no longer be cancelled, and each disk's tracker is reset so the next
//! incremental starts from this artifact.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::copy::{copy_ranges, percent, DiskProgress};
use super::fanout::{run_per_disk, DiskScope};
use super::{BackupConfig, Job, JobContext, JobKind, JobWork};
use crate::cbt::{BlockRange, CbtFactory, ChangedBlockTracker};
use crate::error::{CbtError, JobError};
use crate::manifest::{self, BackupManifest, DiskEntry};
use crate::provider::disk::FileDisk;
use crate::provider::{BackupProvider, DiskAccess, DiskHandle};

pub type BackupJob = Job<BackupWork>;

impl BackupJob {
    pub fn new(config: BackupConfig, provider: Arc<dyn BackupProvider>) -> Self {
        let max_disks = config.max_concurrent_disks;
        Job::with_dedicated_engine(BackupWork::new(config, provider), max_disks)
    }

    pub fn config(&self) -> &BackupConfig {
        self.work().config()
    }
}

pub struct BackupWork {
    config: Arc<BackupConfig>,
    provider: Arc<dyn BackupProvider>,
    cbt: CbtFactory,
    artifact: Mutex<Option<PathBuf>>,
}

impl BackupWork {
    pub fn new(config: BackupConfig, provider: Arc<dyn BackupProvider>) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            cbt: CbtFactory::default(),
            artifact: Mutex::new(None),
        }
    }

    pub fn with_cbt_factory(mut self, cbt: CbtFactory) -> Self {
        self.cbt = cbt;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Artifact directory written by a completed run.
    pub fn artifact_dir(&self) -> Option<PathBuf> {
        self.artifact.lock().ok().and_then(|a| a.clone())
    }

    fn run(&self, ctx: &JobContext, artifact_dir: &Path, backup_id: &str) -> Result<(), JobError> {
        let cfg = &self.config;
        let disks: Vec<String> = self
            .provider
            .vm_disk_paths(&cfg.vm_id)?
            .into_iter()
            .filter(|d| !cfg.is_excluded(d))
            .collect();
        if disks.is_empty() {
            return Err(JobError::Config(format!(
                "VM {} has no disks left to back up",
                cfg.vm_id
            )));
        }

        let vm_dir = cfg.vm_backup_dir();
        let base = if cfg.incremental {
            manifest::latest_complete(&vm_dir)
                .map_err(|e| JobError::io(&vm_dir, e))?
                .filter(|a| a.path != artifact_dir)
        } else {
            None
        };

        let plans: Vec<DiskPlan> = disks
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let base = base.as_ref().and_then(|a| {
                    let entry = a.manifest.as_ref()?.disk_by_source(source)?;
                    Some(BaseImage {
                        path: a.path.join(&entry.file_name),
                        size: entry.size,
                    })
                });
                DiskPlan {
                    source: source.clone(),
                    file_name: image_file_name(index, source),
                    base,
                }
            })
            .collect();

        self.provider.start_backup(&cfg.vm_id, backup_id, cfg)?;
        ctx.report_status(format!(
            "Backing up {} disk(s) of VM {} into {}",
            plans.len(),
            cfg.vm_id,
            backup_id
        ));

        let run = Arc::new(DiskRun {
            config: Arc::clone(&self.config),
            provider: Arc::clone(&self.provider),
            cbt: self.cbt.clone(),
            artifact_dir: artifact_dir.to_path_buf(),
            progress: DiskProgress::new(plans.iter().map(|p| p.file_name.as_str())),
        });
        let written = run_per_disk(ctx, plans, move |plan, scope| run.backup_disk(plan, scope))?;
        let (entries, trackers): (Vec<DiskEntry>, Vec<_>) = written
            .into_iter()
            .map(|w| (w.entry, w.tracker))
            .unzip();

        ctx.commit()?;
        let manifest = BackupManifest {
            backup_id: backup_id.to_string(),
            vm_id: cfg.vm_id.clone(),
            created_at: Utc::now(),
            incremental: cfg.incremental,
            base: base.map(|a| a.name()),
            disks: entries,
        };
        manifest.save(artifact_dir)?;

        // The artifact is durable; nothing below may fail the job.
        if let Err(e) = self.provider.finish_backup(&cfg.vm_id, backup_id) {
            tracing::warn!(vm_id = %cfg.vm_id, backup_id, error = %e, "Provider finish_backup failed");
        }
        if let Some(state) = self.provider.backup_status(&cfg.vm_id) {
            tracing::warn!(vm_id = %cfg.vm_id, backup_id, provider_state = %state, "Provider still reports an active backup");
        }
        for (disk, tracker) in manifest.disks.iter().zip(&trackers) {
            let Some(tracker) = tracker else { continue };
            if let Err(e) = tracker.reset() {
                tracing::warn!(disk = %disk.source_path, tracker = tracker.name(), error = %e, "Could not reset change tracking; next incremental may copy extra data");
            }
        }
        tracing::info!(
            job_id = %ctx.job_id(),
            vm_id = %cfg.vm_id,
            backup_id,
            disks = manifest.disks.len(),
            bytes = manifest.total_size(),
            "Backup written"
        );
        Ok(())
    }
}

impl JobWork for BackupWork {
    const KIND: JobKind = JobKind::Backup;

    fn validate(&self) -> Result<(), JobError> {
        self.config.validate()
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let cfg = &self.config;
        let backup_id = manifest::new_backup_id(Utc::now());
        let artifact_dir = cfg.vm_backup_dir().join(&backup_id);
        std::fs::create_dir_all(&artifact_dir).map_err(|e| JobError::io(&artifact_dir, e))?;

        match self.run(ctx, &artifact_dir, &backup_id) {
            Ok(()) => {
                if let Ok(mut slot) = self.artifact.lock() {
                    *slot = Some(artifact_dir);
                }
                ctx.report_status(format!("Backup {backup_id} completed"));
                Ok(())
            }
            Err(e) => {
                if !e.is_cancellation() {
                    if let Err(cancel_err) = self.provider.cancel_backup(&cfg.vm_id) {
                        tracing::warn!(vm_id = %cfg.vm_id, error = %cancel_err, "Provider cancel_backup failed");
                    }
                }
                if let Err(rm_err) = std::fs::remove_dir_all(&artifact_dir) {
                    tracing::warn!(path = %artifact_dir.display(), error = %rm_err, "Failed to remove partial backup");
                }
                Err(e)
            }
        }
    }

    fn on_pause(&self) {
        if let Err(e) = self.provider.pause_backup(&self.config.vm_id) {
            tracing::warn!(vm_id = %self.config.vm_id, error = %e, "Provider pause_backup failed");
        }
    }

    fn on_resume(&self) {
        if let Err(e) = self.provider.resume_backup(&self.config.vm_id) {
            tracing::warn!(vm_id = %self.config.vm_id, error = %e, "Provider resume_backup failed");
        }
    }

    fn on_cancel(&self) {
        if let Err(e) = self.provider.cancel_backup(&self.config.vm_id) {
            tracing::warn!(vm_id = %self.config.vm_id, error = %e, "Provider cancel_backup failed");
        }
    }
}

/// `00-root.qcow2`: index keeps names unique when disks share a file name.
fn image_file_name(index: usize, source: &str) -> String {
    let stem = Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("disk");
    let stem: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
        .collect();
    format!("{index:02}-{stem}")
}

struct BaseImage {
    path: PathBuf,
    size: u64,
}

struct DiskPlan {
    source: String,
    file_name: String,
    base: Option<BaseImage>,
}

enum CopyMode {
    Full,
    Delta { ranges: Vec<BlockRange>, base: PathBuf },
}

/// One written disk and the tracker to reset once the backup has committed.
struct WrittenDisk {
    entry: DiskEntry,
    tracker: Option<Box<dyn ChangedBlockTracker>>,
}

/// State shared by the per-disk tasks of one run.
struct DiskRun {
    config: Arc<BackupConfig>,
    provider: Arc<dyn BackupProvider>,
    cbt: CbtFactory,
    artifact_dir: PathBuf,
    progress: DiskProgress,
}

impl DiskRun {
    fn backup_disk(&self, plan: DiskPlan, scope: &DiskScope<'_>) -> Result<WrittenDisk, JobError> {
        scope.checkpoint()?;
        let mut src = self
            .provider
            .disk_backend()
            .open_disk(&plan.source, DiskAccess::Read)?;
        let size = src.size()?;
        let (mode, tracker) = self.copy_mode(&plan, size, src.guest_view())?;
        let tracker_name = tracker.as_ref().map(|t| t.name().to_string());

        let image = self.artifact_dir.join(&plan.file_name);
        let (mut dst, ranges) = match mode {
            CopyMode::Full => (
                FileDisk::open(&image, DiskAccess::Create { size })?,
                vec![BlockRange::new(0, size)],
            ),
            CopyMode::Delta { ranges, base } => {
                std::fs::copy(&base, &image).map_err(|e| JobError::io(&image, e))?;
                (FileDisk::open(&image, DiskAccess::ReadWrite)?, ranges)
            }
        };

        tracing::debug!(disk = %plan.source, size, ranges = ranges.len(), tracker = ?tracker_name, "Copying disk");
        let copied = copy_ranges(
            &mut *src,
            &mut dst,
            &ranges,
            self.config.chunk_size,
            || scope.checkpoint(),
            |done, total| {
                let mean = self.progress.update(&plan.file_name, percent(done, total));
                scope.ctx.report_progress(mean);
            },
        )?;
        dst.close()?;
        src.close()?;

        Ok(WrittenDisk {
            entry: DiskEntry {
                source_path: plan.source,
                file_name: plan.file_name,
                size,
                ranges: copied,
                tracker: tracker_name,
            },
            tracker,
        })
    }

    /// Full copy unless an enabled tracker and a same-size base image allow
    /// a delta. A tracker that cannot be selected degrades to a full copy; a
    /// tracker that fails once selected fails the disk when incremental.
    /// Tracker ranges are guest offsets, so a source read as a raw image
    /// container is always copied whole.
    fn copy_mode(
        &self,
        plan: &DiskPlan,
        size: u64,
        guest_view: bool,
    ) -> Result<(CopyMode, Option<Box<dyn ChangedBlockTracker>>), JobError> {
        let cfg = &self.config;
        if !cfg.cbt_enabled {
            return Ok((CopyMode::Full, None));
        }
        let tracker = match self.cbt.select(&self.provider, &cfg.vm_id, &plan.source) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(vm_id = %cfg.vm_id, disk = %plan.source, error = %e, "Changed-block tracking unavailable, copying whole disk");
                return Ok((CopyMode::Full, None));
            }
        };
        match self.ensure_tracking(tracker.as_ref(), &plan.source) {
            Ok(true) => {}
            Ok(false) => return Ok((CopyMode::Full, Some(tracker))),
            Err(e) if cfg.incremental => return Err(e.into()),
            Err(e) => {
                tracing::warn!(disk = %plan.source, error = %e, "Could not enable change tracking");
                return Ok((CopyMode::Full, None));
            }
        }

        if !cfg.incremental {
            return Ok((CopyMode::Full, Some(tracker)));
        }
        let Some(base) = plan.base.as_ref().filter(|b| b.size == size) else {
            tracing::info!(disk = %plan.source, "No matching base artifact, copying whole disk");
            return Ok((CopyMode::Full, Some(tracker)));
        };
        if !guest_view {
            tracing::warn!(
                disk = %plan.source,
                tracker = tracker.name(),
                "Source is read as an image container, not guest blocks; copying whole disk"
            );
            return Ok((CopyMode::Full, Some(tracker)));
        }
        let ranges = tracker.changed_blocks()?;
        Ok((
            CopyMode::Delta {
                ranges,
                base: base.path.clone(),
            },
            Some(tracker),
        ))
    }

    /// `Ok(true)` if the tracker already had a reference point; enables it
    /// and returns `Ok(false)` otherwise.
    fn ensure_tracking(&self, tracker: &dyn ChangedBlockTracker, disk: &str) -> Result<bool, CbtError> {
        if tracker.is_enabled()? {
            return Ok(true);
        }
        tracker.enable()?;
        tracing::info!(disk, tracker = tracker.name(), "Enabled change tracking; this run is the baseline");
        Ok(false)
    }
}
