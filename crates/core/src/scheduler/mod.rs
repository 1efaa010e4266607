// crates/core/src/scheduler/mod.rs
//! Per-VM recurring backups and retention enforcement.
//!
//! Provides:
//! - `ScheduleSpec` / `calculate_next_run`: pure next-run computation
//! - `Scheduler`: one schedule per VM, a polling loop that creates backup
//!   jobs through the `JobManager` when due, then prunes old artifacts
//! - `cleanup_old_backups`: count-and-age retention over an artifact directory

mod next_run;
mod retention;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ScheduleError;
use crate::job::{BackupConfig, JobId};
use crate::manager::JobManager;

pub use next_run::{advance_by_interval, calculate_next_run, ScheduleSpec, ScheduleType};
pub use retention::{cleanup_old_backups, select_expired, RetentionReport};

/// Default wake-up period of the background loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// A VM's registered schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub config: BackupConfig,
    /// `None` when the schedule can never fire again.
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn vm_id(&self) -> &str {
        &self.config.vm_id
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|t| t <= now)
    }
}

/// Next run after `now`, with wall-clock fields read in the host timezone.
fn next_after(spec: &ScheduleSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    calculate_next_run(spec, &now.with_timezone(&Local)).map(|t| t.with_timezone(&Utc))
}

/// Next run after a firing. Interval schedules without an anchor advance
/// from the run that just fired so the cadence does not drift with the poll.
fn reschedule(
    spec: &ScheduleSpec,
    fired: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match (spec.schedule_type, spec.start_at, fired) {
        (ScheduleType::Interval, None, Some(prev)) => {
            advance_by_interval(&prev, spec.interval_minutes, &now)
        }
        _ => next_after(spec, now),
    }
}

pub struct Scheduler {
    manager: Arc<JobManager>,
    schedules: Mutex<HashMap<String, Schedule>>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self::with_poll_interval(manager, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(manager: Arc<JobManager>, poll_interval: Duration) -> Self {
        Self {
            manager,
            schedules: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Schedule>> {
        self.schedules.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Schedule registry mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn check(config: &BackupConfig) -> Result<(), ScheduleError> {
        config.validate().map_err(|e| ScheduleError::Invalid {
            vm_id: config.vm_id.clone(),
            message: e.to_string(),
        })
    }

    /// Register (or replace) the schedule for `config.vm_id`. Returns the
    /// first run time.
    pub fn add_schedule(
        &self,
        config: BackupConfig,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        Self::check(&config)?;
        let next_run = next_after(&config.schedule, Utc::now());
        let vm_id = config.vm_id.clone();
        let replaced = self
            .lock()
            .insert(
                vm_id.clone(),
                Schedule {
                    config,
                    next_run,
                    last_run: None,
                },
            )
            .is_some();
        tracing::info!(vm_id = %vm_id, ?next_run, replaced, "Schedule added");
        Ok(next_run)
    }

    /// Replace the config of an existing schedule, keeping its last run.
    pub fn update_schedule(
        &self,
        config: BackupConfig,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        Self::check(&config)?;
        let next_run = next_after(&config.schedule, Utc::now());
        let mut schedules = self.lock();
        let schedule = schedules
            .get_mut(&config.vm_id)
            .ok_or_else(|| ScheduleError::NotFound(config.vm_id.clone()))?;
        tracing::info!(vm_id = %config.vm_id, ?next_run, "Schedule updated");
        schedule.config = config;
        schedule.next_run = next_run;
        Ok(next_run)
    }

    pub fn remove_schedule(&self, vm_id: &str) -> bool {
        let removed = self.lock().remove(vm_id).is_some();
        if removed {
            tracing::info!(vm_id, "Schedule removed");
        }
        removed
    }

    pub fn get_schedule(&self, vm_id: &str) -> Option<Schedule> {
        self.lock().get(vm_id).cloned()
    }

    pub fn get_next_run_time(&self, vm_id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(vm_id).and_then(|s| s.next_run)
    }

    /// Every schedule, ordered by VM id.
    pub fn get_all_schedules(&self) -> Vec<Schedule> {
        let mut all: Vec<Schedule> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.config.vm_id.cmp(&b.config.vm_id));
        all
    }

    /// One scheduling pass: fire every schedule due at `now`, then apply
    /// retention for each VM whose job was started. Returns the started jobs.
    pub fn run_due(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut due: Vec<BackupConfig> = Vec::new();
        {
            let mut schedules = self.lock();
            schedules.retain(|vm_id, schedule| {
                if !schedule.is_due(now) {
                    return true;
                }
                due.push(schedule.config.clone());
                schedule.last_run = Some(now);
                if schedule.config.schedule.schedule_type == ScheduleType::Once {
                    tracing::debug!(vm_id = %vm_id, "One-shot schedule fired; removing");
                    return false;
                }
                schedule.next_run = reschedule(&schedule.config.schedule, schedule.next_run, now);
                tracing::debug!(vm_id = %vm_id, next_run = ?schedule.next_run, "Rescheduled");
                true
            });
        }
        due.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));

        // Job creation and start happen outside the registry lock.
        let mut started = Vec::new();
        for config in due {
            let vm_id = config.vm_id.clone();
            let (max_backups, retention_days) = (config.max_backups, config.retention_days);
            let vm_dir = config.vm_backup_dir();
            let job = match self.manager.create_backup_job(config) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(vm_id = %vm_id, error = %e, "Scheduled backup could not be created");
                    continue;
                }
            };
            if !job.start() {
                tracing::warn!(
                    vm_id = %vm_id,
                    job_id = %job.id(),
                    error = %job.error().unwrap_or_default(),
                    "Scheduled backup failed to start"
                );
                continue;
            }
            tracing::info!(vm_id = %vm_id, job_id = %job.id(), "Scheduled backup started");
            started.push(job.id());

            if let Err(e) = cleanup_old_backups(&vm_dir, max_backups, retention_days, now) {
                tracing::warn!(vm_id = %vm_id, error = %e, "Retention sweep failed");
            }
        }
        started
    }

    /// Prune the artifacts of a scheduled VM using its configured limits.
    pub fn apply_retention_policy(&self, vm_id: &str) -> Result<RetentionReport, ScheduleError> {
        let config = self
            .get_schedule(vm_id)
            .map(|s| s.config)
            .ok_or_else(|| ScheduleError::NotFound(vm_id.to_string()))?;
        cleanup_old_backups(
            &config.vm_backup_dir(),
            config.max_backups,
            config.retention_days,
            Utc::now(),
        )
    }

    /// One loop iteration: drop jobs that settled since the last pass, then
    /// fire what is due.
    fn pass(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let evicted = self.manager.cleanup_completed_jobs();
        if evicted > 0 {
            tracing::debug!(count = evicted, "Evicted finished jobs");
        }
        self.run_due(now)
    }

    /// Poll until `shutdown` is cancelled. Each pass runs on the blocking
    /// pool since job dispatch and retention touch the filesystem.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(poll_secs = self.poll_interval.as_secs_f64(), "Scheduler loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let scheduler = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || scheduler.pass(Utc::now())).await {
                Ok(started) if !started.is_empty() => {
                    tracing::debug!(count = started.len(), "Scheduler pass started jobs");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Scheduler pass panicked"),
            }
        }
        tracing::info!("Scheduler loop stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("schedules", &self.lock().len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
