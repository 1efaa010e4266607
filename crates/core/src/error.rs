// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobId;

/// Errors returned synchronously by the task engine to submitters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Task engine is shutting down; submission rejected")]
    ShuttingDown,

    #[error("Task engine could not spawn any of {requested} worker thread(s)")]
    NoWorkers { requested: usize },
}

/// Errors raised by a hypervisor backend or its disk I/O layer.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider is not connected")]
    NotConnected,

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("Disk not found: {path}")]
    DiskNotFound { path: PathBuf },

    #[error("Permission denied accessing disk: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation not supported by provider: {0}")]
    Unsupported(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl ProviderError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::DiskNotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors from changed-block tracking: classification, queries and toggles.
#[derive(Debug, Error)]
pub enum CbtError {
    #[error("Changed-block tracking unsupported for {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("Cannot classify disk {path}: {source}")]
    Classification {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{program}` failed: {message}")]
    Command { program: String, message: String },

    #[error("Malformed tracker output: {0}")]
    Parse(String),

    #[error("Changed-block tracking is not enabled for {0}")]
    NotEnabled(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Errors that terminate a job's execution.
///
/// `Cancelled` is not reported as a failure; the job moves to
/// `JobStatus::Cancelled` instead.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Changed-block tracking error: {0}")]
    Cbt(#[from] CbtError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Verification of disk {disk} failed: {mismatches} mismatched chunk(s) exceeds budget of {budget}")]
    Mismatch {
        disk: String,
        mismatches: u64,
        budget: u64,
    },

    #[error("Backup manifest error: {0}")]
    Manifest(String),

    #[error("Task engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Disk task panicked: {0}")]
    TaskPanicked(String),

    #[error("Job was cancelled")]
    Cancelled,
}

impl JobError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error represents cooperative cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Manager-level errors. Individual job failures never appear here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("No backup provider configured")]
    NoProvider,

    #[error("Job already registered: {0}")]
    DuplicateJob(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),
}

/// Errors from schedule registration and retention sweeps.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid schedule for VM {vm_id}: {message}")]
    Invalid { vm_id: String, message: String },

    #[error("No schedule registered for VM {0}")]
    NotFound(String),

    #[error("Cannot read backup directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors loading daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_io_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ProviderError::io("/dev/vg0/root", io_err);
        assert!(matches!(err, ProviderError::DiskNotFound { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ProviderError::io("/dev/vg0/root", io_err);
        assert!(matches!(err, ProviderError::PermissionDenied { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = ProviderError::io("/dev/vg0/root", io_err);
        assert!(matches!(err, ProviderError::Io { .. }));
    }

    #[test]
    fn test_job_error_cancellation() {
        assert!(JobError::Cancelled.is_cancellation());
        assert!(!JobError::Engine(EngineError::ShuttingDown).is_cancellation());
        assert!(!JobError::Config("bad".into()).is_cancellation());
    }

    #[test]
    fn test_mismatch_display() {
        let err = JobError::Mismatch {
            disk: "disk0.img".into(),
            mismatches: 3,
            budget: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("disk0.img"));
        assert!(msg.contains("3 mismatched"));
    }

    #[test]
    fn test_config_error_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = ConfigError::io("/etc/vmbackup/config.toml", io_err);
        assert!(err.to_string().contains("not found"));
    }
}
