// crates/core/src/manager.rs
//! Factory and registry for backup, verify and restore jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::ManagerError;
use crate::job::{
    BackupConfig, BackupJob, JobId, JobKind, JobSnapshot, JobStatus, RestoreConfig, RestoreJob,
    VerifyConfig, VerifyJob,
};
use crate::provider::BackupProvider;

/// A registered job of any kind.
#[derive(Debug, Clone)]
pub enum AnyJob {
    Backup(Arc<BackupJob>),
    Verify(Arc<VerifyJob>),
    Restore(Arc<RestoreJob>),
}

impl AnyJob {
    pub fn id(&self) -> JobId {
        match self {
            Self::Backup(j) => j.id(),
            Self::Verify(j) => j.id(),
            Self::Restore(j) => j.id(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::Backup(_) => JobKind::Backup,
            Self::Verify(_) => JobKind::Verify,
            Self::Restore(_) => JobKind::Restore,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Backup(j) => j.status(),
            Self::Verify(j) => j.status(),
            Self::Restore(j) => j.status(),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        match self {
            Self::Backup(j) => j.snapshot(),
            Self::Verify(j) => j.snapshot(),
            Self::Restore(j) => j.snapshot(),
        }
    }

    pub fn start(&self) -> bool {
        match self {
            Self::Backup(j) => j.start(),
            Self::Verify(j) => j.start(),
            Self::Restore(j) => j.start(),
        }
    }

    pub fn pause(&self) -> bool {
        match self {
            Self::Backup(j) => j.pause(),
            Self::Verify(j) => j.pause(),
            Self::Restore(j) => j.pause(),
        }
    }

    pub fn resume(&self) -> bool {
        match self {
            Self::Backup(j) => j.resume(),
            Self::Verify(j) => j.resume(),
            Self::Restore(j) => j.resume(),
        }
    }

    pub fn cancel(&self) -> bool {
        match self {
            Self::Backup(j) => j.cancel(),
            Self::Verify(j) => j.cancel(),
            Self::Restore(j) => j.cancel(),
        }
    }

    pub fn wait(&self) {
        match self {
            Self::Backup(j) => j.wait(),
            Self::Verify(j) => j.wait(),
            Self::Restore(j) => j.wait(),
        }
    }
}

impl From<Arc<BackupJob>> for AnyJob {
    fn from(job: Arc<BackupJob>) -> Self {
        Self::Backup(job)
    }
}

impl From<Arc<VerifyJob>> for AnyJob {
    fn from(job: Arc<VerifyJob>) -> Self {
        Self::Verify(job)
    }
}

impl From<Arc<RestoreJob>> for AnyJob {
    fn from(job: Arc<RestoreJob>) -> Self {
        Self::Restore(job)
    }
}

#[derive(Default)]
struct Registries {
    backup: HashMap<JobId, Arc<BackupJob>>,
    verify: HashMap<JobId, Arc<VerifyJob>>,
    restore: HashMap<JobId, Arc<RestoreJob>>,
}

impl Registries {
    fn contains(&self, id: &JobId) -> bool {
        self.backup.contains_key(id) || self.verify.contains_key(id) || self.restore.contains_key(id)
    }

    fn all(&self) -> Vec<AnyJob> {
        self.backup
            .values()
            .cloned()
            .map(AnyJob::from)
            .chain(self.verify.values().cloned().map(AnyJob::from))
            .chain(self.restore.values().cloned().map(AnyJob::from))
            .collect()
    }
}

/// Owns the job registries and the provider new jobs are bound to.
///
/// Every job gets its own task engine. Registry mutations take one
/// manager-wide lock; job control calls are always made after releasing it.
pub struct JobManager {
    provider: RwLock<Option<Arc<dyn BackupProvider>>>,
    jobs: Mutex<Registries>,
    last_error: Mutex<Option<String>>,
}

impl JobManager {
    pub fn new(provider: Option<Arc<dyn BackupProvider>>) -> Self {
        Self {
            provider: RwLock::new(provider),
            jobs: Mutex::new(Registries::default()),
            last_error: Mutex::new(None),
        }
    }

    /// Bind the provider used by jobs created from now on.
    pub fn set_provider(&self, provider: Arc<dyn BackupProvider>) {
        tracing::info!(provider = provider.name(), "Job manager provider bound");
        match self.provider.write() {
            Ok(mut p) => *p = Some(provider),
            Err(e) => tracing::error!("RwLock poisoned writing provider: {e}"),
        }
    }

    pub fn provider(&self) -> Option<Arc<dyn BackupProvider>> {
        match self.provider.read() {
            Ok(p) => p.clone(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading provider: {e}");
                None
            }
        }
    }

    /// Manager-level errors only; job failures stay on the job.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn fail(&self, err: ManagerError) -> ManagerError {
        tracing::warn!(error = %err, "Job manager error");
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
        err
    }

    fn registries(&self) -> MutexGuard<'_, Registries> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Job registry mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn bound_provider(&self) -> Result<Arc<dyn BackupProvider>, ManagerError> {
        self.provider().ok_or_else(|| self.fail(ManagerError::NoProvider))
    }

    pub fn create_backup_job(&self, config: BackupConfig) -> Result<Arc<BackupJob>, ManagerError> {
        let provider = self.bound_provider()?;
        let job = Arc::new(BackupJob::new(config, provider));
        self.add_job(Arc::clone(&job))?;
        tracing::info!(job_id = %job.id(), vm_id = %job.config().vm_id, "Created backup job");
        Ok(job)
    }

    pub fn create_verify_job(&self, config: VerifyConfig) -> Result<Arc<VerifyJob>, ManagerError> {
        let provider = self.bound_provider()?;
        let job = Arc::new(VerifyJob::new(config, provider));
        self.add_job(Arc::clone(&job))?;
        tracing::info!(job_id = %job.id(), vm_id = %job.config().vm_id, "Created verify job");
        Ok(job)
    }

    pub fn create_restore_job(&self, config: RestoreConfig) -> Result<Arc<RestoreJob>, ManagerError> {
        let provider = self.bound_provider()?;
        let job = Arc::new(RestoreJob::new(config, provider));
        self.add_job(Arc::clone(&job))?;
        tracing::info!(job_id = %job.id(), target_vm = %job.config().target_vm_name, "Created restore job");
        Ok(job)
    }

    /// Register an externally built job under its kind.
    pub fn add_job(&self, job: impl Into<AnyJob>) -> Result<JobId, ManagerError> {
        let job = job.into();
        let id = job.id();
        let mut jobs = self.registries();
        if jobs.contains(&id) {
            drop(jobs);
            return Err(self.fail(ManagerError::DuplicateJob(id)));
        }
        match job {
            AnyJob::Backup(j) => jobs.backup.insert(id, j).map(|_| ()),
            AnyJob::Verify(j) => jobs.verify.insert(id, j).map(|_| ()),
            AnyJob::Restore(j) => jobs.restore.insert(id, j).map(|_| ()),
        };
        Ok(id)
    }

    pub fn get_backup_jobs(&self) -> Vec<Arc<BackupJob>> {
        self.registries().backup.values().cloned().collect()
    }

    pub fn get_verify_jobs(&self) -> Vec<Arc<VerifyJob>> {
        self.registries().verify.values().cloned().collect()
    }

    pub fn get_restore_jobs(&self) -> Vec<Arc<RestoreJob>> {
        self.registries().restore.values().cloned().collect()
    }

    pub fn get_job(&self, id: JobId) -> Option<AnyJob> {
        let jobs = self.registries();
        jobs.backup
            .get(&id)
            .cloned()
            .map(AnyJob::from)
            .or_else(|| jobs.verify.get(&id).cloned().map(AnyJob::from))
            .or_else(|| jobs.restore.get(&id).cloned().map(AnyJob::from))
    }

    /// Point-in-time snapshots of every job, grouped by kind.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let all = self.registries().all();
        all.iter().map(AnyJob::snapshot).collect()
    }

    pub fn job_count(&self) -> usize {
        let jobs = self.registries();
        jobs.backup.len() + jobs.verify.len() + jobs.restore.len()
    }

    pub fn remove_job(&self, id: JobId) -> Result<AnyJob, ManagerError> {
        let removed = {
            let mut jobs = self.registries();
            jobs.backup
                .remove(&id)
                .map(AnyJob::from)
                .or_else(|| jobs.verify.remove(&id).map(AnyJob::from))
                .or_else(|| jobs.restore.remove(&id).map(AnyJob::from))
        };
        removed.ok_or(ManagerError::JobNotFound(id))
    }

    /// Evict every job in a terminal state. Returns how many were removed.
    pub fn cleanup_completed_jobs(&self) -> usize {
        let mut jobs = self.registries();
        let before = jobs.backup.len() + jobs.verify.len() + jobs.restore.len();
        jobs.backup.retain(|_, j| !j.status().is_terminal());
        jobs.verify.retain(|_, j| !j.status().is_terminal());
        jobs.restore.retain(|_, j| !j.status().is_terminal());
        let removed = before - (jobs.backup.len() + jobs.verify.len() + jobs.restore.len());
        if removed > 0 {
            tracing::info!(removed, "Cleaned up finished jobs");
        }
        removed
    }

    /// Cancel every registered job and wait for each to settle. Returns how
    /// many were actually cancelled.
    pub fn stop_all_jobs(&self) -> usize {
        let all = self.registries().all();
        let cancelled = all.iter().filter(|job| job.cancel()).count();
        tracing::info!(total = all.len(), cancelled, "Stopped all jobs");
        cancelled
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("provider", &self.provider().map(|p| p.name().to_string()))
            .field("jobs", &self.job_count())
            .finish()
    }
}
