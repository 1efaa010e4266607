// crates/core/src/cbt/lvm.rs
//! Tracking for LVM logical volumes via a companion COW snapshot.
//!
//! Tracking is enabled by creating a snapshot `<lv>_vmbackup` of the origin
//! volume. Classic snapshots expose only how much of their COW space is in
//! use, not where, so any usage reports the whole origin as changed. Each
//! committed backup rotates the snapshot so usage restarts from zero.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::cbt::{BlockRange, ChangedBlockTracker, CommandRunner};
use crate::error::CbtError;

pub const SNAPSHOT_SUFFIX: &str = "_vmbackup";

const LVS_FIELDS: &str = "lv_name,vg_name,lv_size,lv_attr,origin,data_percent";

/// One row of `lvs --reportformat json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogicalVolume {
    pub lv_name: String,
    pub vg_name: String,
    /// Bytes, as printed with `--units b --nosuffix`.
    pub lv_size: String,
    #[serde(default)]
    pub lv_attr: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub data_percent: String,
}

impl LogicalVolume {
    pub fn size_bytes(&self) -> Result<u64, CbtError> {
        self.lv_size
            .trim()
            .parse()
            .map_err(|_| CbtError::Parse(format!("lv_size {:?}", self.lv_size)))
    }

    /// Percentage of snapshot COW space in use; empty means none.
    pub fn usage_percent(&self) -> Result<f64, CbtError> {
        let raw = self.data_percent.trim();
        if raw.is_empty() {
            return Ok(0.0);
        }
        raw.parse()
            .map_err(|_| CbtError::Parse(format!("data_percent {raw:?}")))
    }

    fn full_name(&self) -> String {
        format!("{}/{}", self.vg_name, self.lv_name)
    }
}

#[derive(Debug, Deserialize)]
struct LvsReport {
    report: Vec<LvsSection>,
}

#[derive(Debug, Deserialize)]
struct LvsSection {
    #[serde(default)]
    lv: Vec<LogicalVolume>,
}

/// Run `lvs` for `target` (a device path, VG name or VG/LV) and return its rows.
pub fn query_volumes(
    runner: &dyn CommandRunner,
    target: &str,
) -> Result<Vec<LogicalVolume>, CbtError> {
    let out = runner.run(
        "lvs",
        &[
            "--reportformat",
            "json",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            LVS_FIELDS,
            target,
        ],
    )?;
    let report: LvsReport =
        serde_json::from_str(&out).map_err(|e| CbtError::Parse(format!("lvs: {e}")))?;
    Ok(report.report.into_iter().flat_map(|s| s.lv).collect())
}

pub struct LvmCbt {
    device: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LvmCbt {
    pub fn new(device: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            device: device.into(),
            runner,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// The origin volume behind the device.
    fn volume(&self) -> Result<LogicalVolume, CbtError> {
        let device = self
            .device
            .to_str()
            .ok_or_else(|| CbtError::Parse(format!("non UTF-8 path {}", self.device.display())))?;
        query_volumes(self.runner.as_ref(), device)?
            .into_iter()
            .next()
            .ok_or_else(|| CbtError::Unsupported {
                path: self.device.clone(),
                reason: "lvs reported no logical volume".into(),
            })
    }

    fn create_snapshot(&self, origin: &LogicalVolume) -> Result<(), CbtError> {
        let snap = format!("{}{SNAPSHOT_SUFFIX}", origin.lv_name);
        tracing::info!(volume = %origin.full_name(), snapshot = %snap, "Creating CBT snapshot");
        self.runner.run(
            "lvcreate",
            &["-s", "-n", &snap, "-l", "10%ORIGIN", &origin.full_name()],
        )?;
        Ok(())
    }

    /// The tracking snapshot of `origin`, if present.
    fn snapshot(&self, origin: &LogicalVolume) -> Result<Option<LogicalVolume>, CbtError> {
        let name = format!("{}{SNAPSHOT_SUFFIX}", origin.lv_name);
        Ok(query_volumes(self.runner.as_ref(), &origin.vg_name)?
            .into_iter()
            .find(|lv| lv.lv_name == name && lv.origin == origin.lv_name))
    }
}

impl ChangedBlockTracker for LvmCbt {
    fn name(&self) -> &str {
        "lvm"
    }

    fn is_enabled(&self) -> Result<bool, CbtError> {
        let origin = self.volume()?;
        Ok(self.snapshot(&origin)?.is_some())
    }

    fn enable(&self) -> Result<(), CbtError> {
        let origin = self.volume()?;
        self.create_snapshot(&origin)
    }

    fn disable(&self) -> Result<(), CbtError> {
        let origin = self.volume()?;
        let Some(snap) = self.snapshot(&origin)? else {
            return Ok(());
        };
        tracing::info!(snapshot = %snap.full_name(), "Removing CBT snapshot");
        self.runner.run("lvremove", &["-y", &snap.full_name()])?;
        Ok(())
    }

    fn changed_blocks(&self) -> Result<Vec<BlockRange>, CbtError> {
        let origin = self.volume()?;
        let snap = self
            .snapshot(&origin)?
            .ok_or_else(|| CbtError::NotEnabled(self.device.display().to_string()))?;
        if snap.usage_percent()? > 0.0 {
            Ok(vec![BlockRange::new(0, origin.size_bytes()?)])
        } else {
            Ok(Vec::new())
        }
    }

    fn reset(&self) -> Result<(), CbtError> {
        let origin = self.volume()?;
        if let Some(snap) = self.snapshot(&origin)? {
            tracing::info!(snapshot = %snap.full_name(), "Rotating CBT snapshot");
            self.runner.run("lvremove", &["-y", &snap.full_name()])?;
        }
        self.create_snapshot(&origin)
    }
}

impl std::fmt::Debug for LvmCbt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LvmCbt").field("device", &self.device).finish()
    }
}
