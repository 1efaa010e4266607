// crates/core/src/lib.rs
pub mod cbt;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod manager;
pub mod manifest;
pub mod provider;
pub mod scheduler;

pub use cbt::{BlockRange, CbtFactory, ChangedBlockTracker};
pub use config::{DaemonConfig, LoggingConfig, SchedulerConfig};
pub use engine::{Priority, TaskEngine, TaskError, TaskHandle, TaskOptions, TaskStats};
pub use error::*;
pub use job::{
    BackupConfig, BackupJob, JobId, JobKind, JobSnapshot, JobStatus, RestoreConfig, RestoreJob,
    VerifyConfig, VerifyJob,
};
pub use manager::{AnyJob, JobManager};
pub use manifest::{Artifact, BackupManifest};
pub use provider::{BackupProvider, LocalProvider, LocalProviderConfig};
pub use scheduler::{Schedule, ScheduleSpec, ScheduleType, Scheduler};
