// crates/daemon/src/main.rs
//! vmbackupd: runs configured backup schedules against local VM images.
//!
//! Loads the TOML config, binds the local provider, registers every
//! `[[schedules]]` entry and polls until ctrl-c. On shutdown the scheduler
//! loop stops first, then every running job is cancelled and awaited.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use vmbackup_core::{BackupProvider, DaemonConfig, JobManager, LocalProvider, Scheduler};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = DaemonConfig::default_path();
    let config = DaemonConfig::load()
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let _log_guard = vmbackup_observability::init_tracing(&config.logging)?;
    tracing::info!(
        config = %config_path.display(),
        vms = config.local.vms.len(),
        schedules = config.schedules.len(),
        "vmbackupd starting"
    );

    let provider = Arc::new(LocalProvider::new(config.local.clone()));
    provider.connect().context("Failed to connect local provider")?;
    let manager = Arc::new(JobManager::new(Some(provider.clone())));
    let scheduler = Arc::new(Scheduler::with_poll_interval(
        Arc::clone(&manager),
        Duration::from_secs(config.scheduler.poll_interval_secs),
    ));

    for schedule in config.schedules {
        let vm_id = schedule.vm_id.clone();
        let next_run = scheduler
            .add_schedule(schedule)
            .with_context(|| format!("Invalid schedule for VM {vm_id}"))?;
        match next_run {
            Some(at) => tracing::info!(vm_id = %vm_id, next_run = %at, "Scheduled"),
            None => tracing::warn!(vm_id = %vm_id, "Schedule will never fire"),
        }
    }

    let shutdown = CancellationToken::new();
    let scheduler_loop = scheduler.spawn(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");

    shutdown.cancel();
    if let Err(e) = scheduler_loop.await {
        tracing::error!(error = %e, "Scheduler loop ended abnormally");
    }

    // cancel() blocks until each job's workers settle.
    let stopped = tokio::task::spawn_blocking({
        let manager = Arc::clone(&manager);
        move || manager.stop_all_jobs()
    })
    .await
    .context("Job shutdown panicked")?;

    if let Err(e) = provider.disconnect() {
        tracing::warn!(error = %e, "Provider disconnect failed");
    }
    tracing::info!(stopped, jobs = manager.job_count(), "vmbackupd stopped");
    Ok(())
}
