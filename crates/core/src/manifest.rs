// crates/core/src/manifest.rs
//! On-disk description of one backup artifact.
//!
//! Layout: `<backup_dir>/<vm_id>/<backup_id>/` holds one image per disk
//! (data at the same offsets as the source) and `manifest.json`. The
//! manifest is written last, so a directory without one is an incomplete
//! backup.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cbt::BlockRange;
use crate::error::JobError;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskEntry {
    /// Disk path as reported by the provider at backup time.
    pub source_path: String,
    /// Image file name inside the artifact directory.
    pub file_name: String,
    pub size: u64,
    /// Regions read from the source for this artifact. The rest of the image
    /// was seeded from `base` (incremental) or is unallocated.
    pub ranges: Vec<BlockRange>,
    /// Tracker that produced `ranges`, when one was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub backup_id: String,
    pub vm_id: String,
    pub created_at: DateTime<Utc>,
    pub incremental: bool,
    /// Backup this one was seeded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    pub disks: Vec<DiskEntry>,
}

impl BackupManifest {
    pub fn path(artifact_dir: &Path) -> PathBuf {
        artifact_dir.join(MANIFEST_FILE)
    }

    pub fn load(artifact_dir: &Path) -> Result<Self, JobError> {
        let path = Self::path(artifact_dir);
        let raw = fs::read_to_string(&path).map_err(|e| JobError::io(&path, e))?;
        serde_json::from_str(&raw)
            .map_err(|e| JobError::Manifest(format!("{}: {e}", path.display())))
    }

    /// Write atomically: temp file then rename.
    pub fn save(&self, artifact_dir: &Path) -> Result<(), JobError> {
        let path = Self::path(artifact_dir);
        let tmp = artifact_dir.join(format!(".{MANIFEST_FILE}.tmp"));
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| JobError::Manifest(e.to_string()))?;
        fs::write(&tmp, body).map_err(|e| JobError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| JobError::io(&path, e))?;
        Ok(())
    }

    pub fn disk_by_source(&self, source_path: &str) -> Option<&DiskEntry> {
        self.disks.iter().find(|d| d.source_path == source_path)
    }

    /// Sum of the recorded disk sizes.
    pub fn total_size(&self) -> u64 {
        self.disks.iter().map(|d| d.size).sum()
    }
}

/// Sortable, collision-resistant backup identifier: `20261016T020000Z-1a2b3c4d`.
pub fn new_backup_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// One artifact directory under a VM's backup directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub manifest: Option<BackupManifest>,
}

impl Artifact {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Every artifact directory for a VM, newest first.
///
/// Dated by the manifest's `created_at`, falling back to the directory's
/// modification time for incomplete backups. A missing VM directory has no
/// artifacts.
pub fn list_artifacts(vm_dir: &Path) -> std::io::Result<Vec<Artifact>> {
    let entries = match fs::read_dir(vm_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let manifest = match BackupManifest::load(&path) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Artifact without readable manifest");
                None
            }
        };
        let created_at = match &manifest {
            Some(m) => m.created_at,
            None => entry
                .metadata()?
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        };
        artifacts.push(Artifact {
            path,
            created_at,
            manifest,
        });
    }
    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
    Ok(artifacts)
}

/// Newest complete artifact for a VM, if any.
pub fn latest_complete(vm_dir: &Path) -> std::io::Result<Option<Artifact>> {
    Ok(list_artifacts(vm_dir)?
        .into_iter()
        .find(|a| a.manifest.is_some()))
}
