// crates/core/src/scheduler/retention.rs
//! Pruning of old backup artifacts by count and age.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::ScheduleError;
use crate::manifest::{list_artifacts, Artifact};

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Artifacts that should have been deleted but could not be.
    pub failed: Vec<PathBuf>,
}

/// Which artifacts to delete. `artifacts` must be sorted newest first.
///
/// The keep set is a union: an artifact survives if it is one of the newest
/// `max_backups` complete artifacts, or if it is younger than
/// `retention_days`. Only artifacts outside both sets are returned, so a
/// count limit never deletes a recent backup and an age limit never drops
/// below `max_backups` complete ones.
///
/// Incomplete artifacts (no manifest, e.g. a backup still being written)
/// never take one of the `max_backups` slots and are deleted only once past
/// the age limit.
pub fn select_expired<'a>(
    artifacts: &'a [Artifact],
    max_backups: usize,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Vec<&'a Artifact> {
    let cutoff = now - Duration::days(i64::from(retention_days));
    let mut complete_seen = 0usize;
    artifacts
        .iter()
        .filter(|a| {
            let in_newest = a.manifest.is_some() && {
                complete_seen += 1;
                complete_seen <= max_backups
            };
            !in_newest && a.created_at < cutoff
        })
        .collect()
}

/// Apply the policy to one VM's artifact directory. Deletion failures are
/// logged and recorded; the sweep continues with the remaining artifacts.
pub fn cleanup_old_backups(
    vm_dir: &Path,
    max_backups: usize,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<RetentionReport, ScheduleError> {
    let artifacts = list_artifacts(vm_dir).map_err(|source| ScheduleError::Io {
        path: vm_dir.to_path_buf(),
        source,
    })?;
    let expired: Vec<PathBuf> = select_expired(&artifacts, max_backups, retention_days, now)
        .into_iter()
        .map(|a| a.path.clone())
        .collect();

    let mut report = RetentionReport::default();
    for artifact in &artifacts {
        if !expired.contains(&artifact.path) {
            report.kept.push(artifact.path.clone());
            continue;
        }
        match std::fs::remove_dir_all(&artifact.path) {
            Ok(()) => {
                tracing::info!(path = %artifact.path.display(), created_at = %artifact.created_at, "Deleted expired backup");
                report.deleted.push(artifact.path.clone());
            }
            Err(e) => {
                tracing::warn!(path = %artifact.path.display(), error = %e, "Failed to delete expired backup");
                report.failed.push(artifact.path.clone());
            }
        }
    }
    tracing::debug!(
        vm_dir = %vm_dir.display(),
        kept = report.kept.len(),
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Retention sweep finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BackupManifest;
    use pretty_assertions::assert_eq;

    fn artifact(name: &str, age: Duration, now: DateTime<Utc>, complete: bool) -> Artifact {
        let created_at = now - age;
        Artifact {
            path: PathBuf::from(format!("/backups/web01/{name}")),
            created_at,
            manifest: complete.then(|| BackupManifest {
                backup_id: name.into(),
                vm_id: "web01".into(),
                created_at,
                incremental: false,
                base: None,
                disks: Vec::new(),
            }),
        }
    }

    fn names(selected: Vec<&Artifact>) -> Vec<String> {
        selected.into_iter().map(Artifact::name).collect()
    }

    #[test]
    fn test_newest_n_are_kept_even_when_old() {
        let now = Utc::now();
        let artifacts = vec![
            artifact("a", Duration::days(8), now, true),
            artifact("b", Duration::days(9), now, true),
            artifact("c", Duration::days(10), now, true),
            artifact("d", Duration::days(11), now, true),
            artifact("e", Duration::days(12), now, true),
        ];
        assert_eq!(names(select_expired(&artifacts, 3, 7, now)), vec!["d", "e"]);
    }

    #[test]
    fn test_recent_artifacts_beyond_n_are_kept() {
        let now = Utc::now();
        let artifacts: Vec<Artifact> = (0..5)
            .map(|i| artifact(&format!("h{i}"), Duration::hours(i + 1), now, true))
            .collect();
        assert!(select_expired(&artifacts, 3, 7, now).is_empty());
    }

    #[test]
    fn test_keep_sets_are_a_union() {
        let now = Utc::now();
        let artifacts = vec![
            artifact("fresh", Duration::hours(1), now, true),
            artifact("week", Duration::days(6), now, true),
            artifact("old", Duration::days(10), now, true),
            artifact("older", Duration::days(20), now, true),
            artifact("oldest", Duration::days(30), now, true),
        ];
        // "old" is 10 days old but among the 3 newest; the two beyond are
        // past the window.
        assert_eq!(
            names(select_expired(&artifacts, 3, 7, now)),
            vec!["older", "oldest"]
        );
    }

    #[test]
    fn test_incomplete_artifacts_do_not_take_slots() {
        let now = Utc::now();
        let artifacts = vec![
            artifact("writing", Duration::minutes(5), now, false),
            artifact("a", Duration::days(10), now, true),
            artifact("crashed", Duration::days(11), now, false),
            artifact("b", Duration::days(12), now, true),
        ];
        assert_eq!(
            names(select_expired(&artifacts, 2, 7, now)),
            vec!["crashed"]
        );
    }

    #[test]
    fn test_cleanup_deletes_from_disk_and_reports() {
        let root = tempfile::tempdir().unwrap();
        let vm_dir = root.path().join("web01");
        let now = Utc::now();
        for (name, days) in [("b1", 1), ("b2", 20), ("b3", 30)] {
            let dir = vm_dir.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("00-disk.img"), b"data").unwrap();
            BackupManifest {
                backup_id: name.into(),
                vm_id: "web01".into(),
                created_at: now - Duration::days(days),
                incremental: false,
                base: None,
                disks: Vec::new(),
            }
            .save(&dir)
            .unwrap();
        }

        let report = cleanup_old_backups(&vm_dir, 1, 7, now).unwrap();
        assert_eq!(report.kept, vec![vm_dir.join("b1")]);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!vm_dir.join("b2").exists());
        assert!(!vm_dir.join("b3").exists());
        assert!(vm_dir.join("b1").exists());
    }

    #[test]
    fn test_cleanup_of_missing_directory_is_empty() {
        let report =
            cleanup_old_backups(Path::new("/nonexistent/vmbackup/web01"), 3, 7, Utc::now()).unwrap();
        assert_eq!(report, RetentionReport::default());
    }
}
