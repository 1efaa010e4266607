// crates/core/tests/backup.rs
mod common;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{backup_config, manifest_of, pattern, wait_until, FakeProvider};
use pretty_assertions::assert_eq;
use vmbackup_core::cbt::BlockRange;
use vmbackup_core::job::{BackupJob, JobStatus};

const DISK: usize = 8192;

fn run(job: &BackupJob) {
    assert!(job.start(), "start failed: {:?}", job.error());
    job.wait();
}

#[test]
fn full_backup_writes_images_and_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_vm("web01", vec![pattern(DISK, 1), pattern(DISK / 2, 2)])
        .arc();
    let job = BackupJob::new(backup_config("web01", dir.path()), provider.clone());
    run(&job);

    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.progress(), 100);
    let artifact = job.work().artifact_dir().unwrap();
    assert!(artifact.starts_with(dir.path().join("web01")));

    let manifest = manifest_of(&artifact);
    assert_eq!(manifest.vm_id, "web01");
    assert!(!manifest.incremental);
    assert_eq!(manifest.disks.len(), 2);
    for (i, entry) in manifest.disks.iter().enumerate() {
        let source = provider.backend.contents(&entry.source_path).unwrap();
        assert_eq!(entry.file_name, format!("{i:02}-disk{i}"));
        assert_eq!(entry.size, source.len() as u64);
        assert_eq!(entry.ranges, vec![BlockRange::new(0, entry.size)]);
        assert_eq!(std::fs::read(artifact.join(&entry.file_name)).unwrap(), source);
    }
    assert_eq!(
        provider.calls(),
        vec!["start_backup web01".to_string(), "finish_backup web01".to_string()]
    );
}

#[test]
fn empty_backup_dir_fails_without_running() {
    let provider = FakeProvider::new().with_vm("web01", vec![pattern(DISK, 1)]).arc();
    let job = BackupJob::new(backup_config("web01", Path::new("")), provider.clone());

    let messages = Arc::new(Mutex::new(Vec::new()));
    {
        let messages = Arc::clone(&messages);
        job.on_status(move |m| messages.lock().unwrap().push(m.to_string()));
    }

    assert!(!job.start());
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.error().unwrap().contains("backup_dir"));
    assert!(!messages.lock().unwrap().iter().any(|m| m == "Running"));
    assert_eq!(job.progress(), 0);
    assert!(provider.calls().is_empty());
}

#[test]
fn unknown_vm_fails_and_leaves_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new().arc();
    let job = BackupJob::new(backup_config("ghost", dir.path()), provider);
    run(&job);

    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.error().unwrap().contains("ghost"));
    assert!(common::artifacts(dir.path(), "ghost").is_empty());
}

#[test]
fn excluded_disks_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_vm("web01", vec![pattern(DISK, 1), pattern(DISK, 2), pattern(DISK, 3)])
        .arc();
    let mut config = backup_config("web01", dir.path());
    config.excluded_disks = vec!["disk1".into()];
    let job = BackupJob::new(config, provider);
    run(&job);

    let manifest = manifest_of(&job.work().artifact_dir().unwrap());
    let sources: Vec<&str> = manifest.disks.iter().map(|d| d.source_path.as_str()).collect();
    assert_eq!(sources, vec!["web01/disk0", "web01/disk2"]);
    assert_eq!(manifest.disks[1].file_name, "01-disk2");
}

#[test]
fn incremental_copies_only_changed_ranges_onto_previous_image() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_native_cbt()
        .with_vm("web01", vec![pattern(DISK, 7)])
        .arc();
    let mut config = backup_config("web01", dir.path());
    config.incremental = true;

    // First run enables tracking and takes a full baseline.
    let first = BackupJob::new(config.clone(), provider.clone());
    run(&first);
    assert_eq!(first.status(), JobStatus::Completed);
    assert!(provider.calls().contains(&"enable_cbt web01".to_string()));
    let base = first.work().artifact_dir().unwrap();
    assert_eq!(manifest_of(&base).disks[0].tracker.as_deref(), Some("managed"));

    provider.backend.patch("web01/disk0", 4096, &[0xEE; 100]);
    provider.set_changed("web01/disk0", vec![BlockRange::new(4096, 100)]);
    provider.backend.take_reads();

    let second = BackupJob::new(config, provider.clone());
    run(&second);
    assert_eq!(second.status(), JobStatus::Completed);

    let reads = provider.backend.take_reads();
    assert_eq!(reads, vec![("web01/disk0".to_string(), 4096, 100)]);

    let artifact = second.work().artifact_dir().unwrap();
    let manifest = manifest_of(&artifact);
    assert!(manifest.incremental);
    assert_eq!(manifest.base.as_deref(), base.file_name().and_then(|n| n.to_str()));
    assert_eq!(manifest.disks[0].ranges, vec![BlockRange::new(4096, 100)]);
    assert_eq!(
        std::fs::read(artifact.join(&manifest.disks[0].file_name)).unwrap(),
        provider.backend.contents("web01/disk0").unwrap()
    );
    // The base artifact is untouched.
    assert_eq!(
        std::fs::read(base.join(&manifest.disks[0].file_name)).unwrap(),
        pattern(DISK, 7)
    );
}

#[test]
fn committed_backup_moves_tracking_reference_point() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_native_cbt()
        .with_vm("web01", vec![pattern(DISK, 7)])
        .arc();
    let mut config = backup_config("web01", dir.path());
    config.incremental = true;

    run(&BackupJob::new(config.clone(), provider.clone()));
    let calls = provider.calls();
    let finished = calls.iter().position(|c| c == "finish_backup web01").unwrap();
    let reset = calls.iter().position(|c| c == "reset_cbt web01/disk0").unwrap();
    assert!(finished < reset);

    provider.backend.patch("web01/disk0", 0, &[0xAB; 512]);
    provider.set_changed("web01/disk0", vec![BlockRange::new(0, 512)]);
    let second = BackupJob::new(config.clone(), provider.clone());
    run(&second);
    let manifest = manifest_of(&second.work().artifact_dir().unwrap());
    assert_eq!(manifest.disks[0].ranges, vec![BlockRange::new(0, 512)]);

    // Nothing changed since the second run committed.
    provider.backend.take_reads();
    let third = BackupJob::new(config, provider.clone());
    run(&third);
    assert_eq!(third.status(), JobStatus::Completed);
    assert!(provider.backend.take_reads().is_empty());
    let artifact = third.work().artifact_dir().unwrap();
    let manifest = manifest_of(&artifact);
    assert!(manifest.disks[0].ranges.is_empty());
    assert_eq!(
        std::fs::read(artifact.join(&manifest.disks[0].file_name)).unwrap(),
        provider.backend.contents("web01/disk0").unwrap()
    );
}

#[test]
fn failed_backup_keeps_tracking_reference_point() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_native_cbt()
        .with_vm("web01", vec![pattern(DISK, 7)])
        .arc();
    let mut config = backup_config("web01", dir.path());
    config.incremental = true;
    run(&BackupJob::new(config.clone(), provider.clone()));

    provider.set_changed("web01/disk0", vec![BlockRange::new(0, 512)]);
    provider.fail_changed_blocks.store(true, Ordering::SeqCst);
    let before = provider.calls().len();
    let failed = BackupJob::new(config, provider.clone());
    run(&failed);
    assert_eq!(failed.status(), JobStatus::Failed);
    assert!(!provider.calls()[before..].iter().any(|c| c.starts_with("reset_cbt")));
    assert!(!provider.calls()[before..].iter().any(|c| c.starts_with("finish_backup")));
}

#[test]
fn incremental_fails_when_changed_block_query_fails() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_native_cbt()
        .with_vm("web01", vec![pattern(DISK, 7)])
        .arc();
    let mut config = backup_config("web01", dir.path());
    config.incremental = true;

    let first = BackupJob::new(config.clone(), provider.clone());
    run(&first);
    assert_eq!(first.status(), JobStatus::Completed);

    provider.fail_changed_blocks.store(true, Ordering::SeqCst);
    let second = BackupJob::new(config, provider.clone());
    run(&second);

    assert_eq!(second.status(), JobStatus::Failed);
    assert!(second.error().unwrap().contains("change tracking reset"));
    assert!(provider.calls().contains(&"cancel_backup web01".to_string()));
    // Only the baseline remains; the partial artifact was removed.
    assert_eq!(
        common::artifacts(dir.path(), "web01"),
        vec![first.work().artifact_dir().unwrap()]
    );
}

#[test]
fn pause_freezes_progress_and_resume_completes() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_vm("web01", vec![pattern(64 * 1024, 3)])
        .arc();
    provider.backend.set_read_delay(Duration::from_millis(5));
    let job = BackupJob::new(backup_config("web01", dir.path()), provider.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        job.on_progress(move |p| seen.lock().unwrap().push(p));
    }

    assert!(job.start());
    assert!(wait_until(|| job.progress() > 0));
    assert!(job.pause());
    assert_eq!(job.status(), JobStatus::Paused);

    // Let the chunk in flight at pause time land.
    std::thread::sleep(Duration::from_millis(50));
    let frozen = job.progress();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(job.progress(), frozen);
    assert!(frozen < 100);

    assert!(job.resume());
    job.wait();
    assert_eq!(job.status(), JobStatus::Completed);

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {seen:?}");
    assert_eq!(seen.last(), Some(&100));
    let calls = provider.calls();
    assert!(calls.contains(&"pause_backup web01".to_string()));
    assert!(calls.contains(&"resume_backup web01".to_string()));
}

#[test]
fn cancel_removes_partial_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let provider = FakeProvider::new()
        .with_vm("web01", vec![pattern(64 * 1024, 3), pattern(64 * 1024, 4)])
        .arc();
    provider.backend.set_read_delay(Duration::from_millis(5));
    let job = BackupJob::new(backup_config("web01", dir.path()), provider.clone());

    assert!(job.start());
    assert!(wait_until(|| job.progress() > 0));
    assert!(job.cancel());

    assert_eq!(job.status(), JobStatus::Cancelled);
    assert!(job.error().is_none());
    assert!(job.work().artifact_dir().is_none());
    assert!(common::artifacts(dir.path(), "web01").is_empty());
    assert!(provider.calls().contains(&"cancel_backup web01".to_string()));
}
