//! JSON documents printed by the CLI in `-j` mode
//!
//! Field names are a contract with the web UI and the status poller, so
//! several fields keep their historical spelling (`osType`, `zfs_clone`).

use crate::types::{Epoch, MountStatus, ResourceKind, VolumeSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fatal error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub success: bool,
    pub error: String,
}

impl ErrorReport {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Aggregate outcome of a batch of snapshot mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn from_counts(ok: usize, total: usize) -> Self {
        if total > 0 && ok == total {
            BatchStatus::Success
        } else if ok > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        }
    }
}

/// Result of one volume mount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMountRecord {
    pub guid: String,
    pub mountpoint: String,
    pub filesystem: String,
    pub status: MountStatus,
    pub mount_path: String,
    pub error: Option<String>,
}

impl VolumeMountRecord {
    pub fn pending(volume: &VolumeSpec, mount_path: impl Into<String>) -> Self {
        Self {
            guid: volume.guid.clone(),
            mountpoint: volume.mountpoint.clone(),
            filesystem: volume.filesystem.clone(),
            status: MountStatus::NotMounted,
            mount_path: mount_path.into(),
            error: None,
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = MountStatus::Failed;
        self.error = Some(error.into());
    }
}

/// Result of mounting one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMountRecord {
    pub snapshot: String,
    pub epoch: Epoch,
    pub date: String,
    pub zfs_clone: String,
    pub temp_mount: String,
    pub final_mount: String,
    pub status: MountStatus,
    pub error: Option<String>,
    pub volumes: Vec<VolumeMountRecord>,
}

impl SnapshotMountRecord {
    /// At least one volume ended up mounted
    pub fn is_mounted(&self) -> bool {
        self.status == MountStatus::Mounted
    }
}

/// Output of `mount`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountReport {
    pub status: BatchStatus,
    pub message: String,
    pub mounts: Vec<SnapshotMountRecord>,
}

impl MountReport {
    pub fn from_records(agent: &str, mounts: Vec<SnapshotMountRecord>) -> Self {
        let ok = mounts.iter().filter(|m| m.is_mounted()).count();
        let status = BatchStatus::from_counts(ok, mounts.len());
        let message = format!(
            "Mounted {} of {} snapshot(s) for agent '{}'",
            ok,
            mounts.len(),
            agent
        );
        Self {
            status,
            message,
            mounts,
        }
    }
}

/// One resource released by a cleanup sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedResource {
    pub kind: ResourceKind,
    pub target: String,
}

impl CleanedResource {
    pub fn new(kind: ResourceKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

/// Output of `mount --cleanup`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub success: bool,
    pub scope: String,
    pub cleaned: Vec<CleanedResource>,
    /// Resources that could not be released (logged, not fatal)
    pub failed: Vec<String>,
}

/// Per-pool outcome of an import or export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolActionRecord {
    pub pool: String,
    pub device: String,
    pub success: bool,
    pub message: String,
}

/// Output of `pool import|export`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoolActionReport {
    /// Auto-detect mode: every matching pool
    Batch {
        success: bool,
        pools: Vec<PoolActionRecord>,
    },
    /// Single-device mode
    Single {
        success: bool,
        pool: String,
        message: String,
    },
}

impl PoolActionReport {
    pub fn success(&self) -> bool {
        match self {
            PoolActionReport::Batch { success, .. } | PoolActionReport::Single { success, .. } => {
                *success
            }
        }
    }
}

/// Physical drive reported by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub model: String,
    pub serial: String,
    pub transport: String,
}

/// Pool entry reported by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub name: String,
    pub health: String,
    pub devices: Vec<String>,
}

/// Output of `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub has_drives: bool,
    pub has_imported_pool: bool,
    pub has_available_pool: bool,
    pub drives: Vec<DriveInfo>,
    pub imported_pools: Vec<PoolSummary>,
    pub available_pools: Vec<PoolSummary>,
}

/// Per-agent entry of the metadata report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub hostname: String,
    #[serde(rename = "osType")]
    pub os_type: String,
    pub dataset: String,
    pub snapshot_count: usize,
    pub latest_snapshot: Option<Epoch>,
    pub volumes: Vec<VolumeSpec>,
}

/// Output of `metadata`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReport {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub pool_name: String,
    pub agent_count: usize,
    pub agents: BTreeMap<String, AgentSummary>,
}

/// How an automount invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomountOutcome {
    Completed,
    AlreadyRunning,
    Disabled,
}

/// Output of `automount`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomountReport {
    pub success: bool,
    pub status: AutomountOutcome,
    pub message: String,
    pub mounts: Vec<SnapshotMountRecord>,
}
