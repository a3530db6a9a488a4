use crate::error::{CoreError, Result};
use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Unix timestamp carried in a snapshot name suffix
pub type Epoch = i64;

/// Suffix of the raw disk image backing each volume
pub const IMAGE_SUFFIX: &str = ".datto";

/// Marker embedded in every ephemeral clone name
pub const CLONE_MARKER: &str = "-snapmount-";

static CLONE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<dataset>.+)-snapmount-(?P<pid>\d+)-(?P<epoch>\d+)$")
        .expect("clone name pattern is valid")
});

/// Pool import state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Imported and usable
    Imported,
    /// Visible to `zpool import` but not imported
    Available,
    /// Neither imported nor importable
    NotAvailable,
}

impl PoolState {
    /// Human label used by the status report
    pub fn label(&self) -> &'static str {
        match self {
            PoolState::Imported => "Imported",
            PoolState::Available => "Available",
            PoolState::NotAvailable => "Not Available",
        }
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolState::Imported => "imported",
            PoolState::Available => "available",
            PoolState::NotAvailable => "not_available",
        };
        write!(f, "{}", s)
    }
}

/// A ZFS storage pool known to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub state: PoolState,
    /// Health column from `zpool list` or `state:` from `zpool import`
    pub health: Option<String>,
    /// Leaf vdevs reported for the pool
    pub devices: Vec<String>,
}

impl PoolInfo {
    pub fn new(name: impl Into<String>, state: PoolState) -> Self {
        Self {
            name: name.into(),
            state,
            health: None,
            devices: Vec::new(),
        }
    }

    /// Whether any vdev of this pool is `device` or one of its partitions
    ///
    /// Matches by path or basename. A partition is the device name followed
    /// by its number (`sdb1`), `p` and the number (`nvme0n1p2`) or
    /// `-part` and the number (`/dev/disk/by-id/ata-X-part1`).
    pub fn uses_device(&self, device: &str) -> bool {
        let wanted = device.rsplit('/').next().unwrap_or(device);
        if wanted.is_empty() {
            return false;
        }
        self.devices.iter().any(|d| {
            let leaf = d.rsplit('/').next().unwrap_or(d);
            d == device
                || leaf == wanted
                || leaf
                    .strip_prefix(wanted)
                    .is_some_and(|rest| is_partition_suffix(wanted, rest))
        })
    }
}

fn is_partition_suffix(disk: &str, rest: &str) -> bool {
    let number = match rest.strip_prefix("-part").or_else(|| rest.strip_prefix('p')) {
        Some(number) => number,
        // `nvme0n1` + `1` would be another namespace, not a partition
        None if disk.ends_with(|c: char| c.is_ascii_digit()) => return false,
        None => rest,
    };
    !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())
}

/// A fully qualified ZFS snapshot `<dataset>@<epoch>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotName {
    pub dataset: String,
    pub epoch: Epoch,
}

impl SnapshotName {
    pub fn new(dataset: impl Into<String>, epoch: Epoch) -> Self {
        Self {
            dataset: dataset.into(),
            epoch,
        }
    }

    /// Parse `pool/home/agents/<id>@<epoch>`
    pub fn parse(name: &str) -> Result<Self> {
        let (dataset, suffix) = name
            .rsplit_once('@')
            .ok_or_else(|| CoreError::invalid_snapshot_name(name))?;
        if dataset.is_empty() {
            return Err(CoreError::invalid_snapshot_name(name));
        }
        let epoch = suffix
            .trim()
            .parse::<Epoch>()
            .map_err(|_| CoreError::invalid_snapshot_name(name))?;
        Ok(Self::new(dataset, epoch))
    }

    /// Leaf name of the snapshotted dataset (the agent ID)
    pub fn dataset_leaf(&self) -> &str {
        self.dataset.rsplit('/').next().unwrap_or(&self.dataset)
    }
}

impl std::fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.dataset, self.epoch)
    }
}

/// Which snapshots of an agent to operate on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotSelector {
    #[default]
    Latest,
    All,
    /// The snapshot closest to this epoch
    Closest(Epoch),
}

impl SnapshotSelector {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "latest" => Ok(SnapshotSelector::Latest),
            "all" => Ok(SnapshotSelector::All),
            other => other
                .parse::<Epoch>()
                .map(SnapshotSelector::Closest)
                .map_err(|_| CoreError::invalid_selector(s)),
        }
    }
}

impl std::fmt::Display for SnapshotSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotSelector::Latest => write!(f, "latest"),
            SnapshotSelector::All => write!(f, "all"),
            SnapshotSelector::Closest(epoch) => write!(f, "{}", epoch),
        }
    }
}

/// One virtual disk inside an agent backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub guid: String,
    /// Intended mountpoint label on the source machine (e.g. `C:\`)
    #[serde(default)]
    pub mountpoint: String,
    /// Filesystem type hint recorded by the backup product
    #[serde(default)]
    pub filesystem: String,
}

impl VolumeSpec {
    pub fn new(
        guid: impl Into<String>,
        mountpoint: impl Into<String>,
        filesystem: impl Into<String>,
    ) -> Self {
        Self {
            guid: guid.into(),
            mountpoint: mountpoint.into(),
            filesystem: filesystem.into(),
        }
    }

    /// File name of the raw image inside the snapshot clone
    pub fn image_file_name(&self) -> String {
        format!("{}{}", self.guid, IMAGE_SUFFIX)
    }

    /// Directory name used under the final mount path
    pub fn label(&self) -> String {
        let label = sanitize_path_component(&self.mountpoint);
        if label.is_empty() {
            sanitize_path_component(&self.guid)
        } else {
            label
        }
    }
}

/// A backed-up source machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Dataset leaf name, typically a UUID
    pub id: String,
    pub hostname: String,
    /// Display name shown in the UI
    pub name: String,
    pub os_type: String,
    /// Full dataset path (`<pool>/home/agents/<id>`)
    pub dataset: String,
    pub volumes: Vec<VolumeSpec>,
    pub snapshot_count: usize,
}

impl Agent {
    /// An agent described only by its dataset
    pub fn bare(id: impl Into<String>, dataset: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            hostname: String::new(),
            name: String::new(),
            os_type: String::new(),
            dataset: dataset.into(),
            volumes: Vec::new(),
            snapshot_count: 0,
            id,
        }
    }

    /// Directory name used under the final mount root
    pub fn dir_name(&self) -> String {
        let host = sanitize_path_component(&self.hostname);
        if host.is_empty() {
            sanitize_path_component(&self.id)
        } else {
            host
        }
    }
}

/// Deterministic name of an ephemeral clone
///
/// Format: `<agent dataset>-snapmount-<pid>-<epoch>`, a sibling of the agent
/// dataset so it stays inside the same pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloneName {
    pub dataset: String,
    pub pid: u32,
    pub epoch: Epoch,
}

impl CloneName {
    pub fn for_snapshot(snapshot: &SnapshotName, pid: u32) -> Self {
        Self {
            dataset: snapshot.dataset.clone(),
            pid,
            epoch: snapshot.epoch,
        }
    }

    /// Recognize a dataset created by this tool
    pub fn parse(name: &str) -> Option<Self> {
        let caps = CLONE_NAME_RE.captures(name)?;
        Some(Self {
            dataset: caps["dataset"].to_string(),
            pid: caps["pid"].parse().ok()?,
            epoch: caps["epoch"].parse().ok()?,
        })
    }

    pub fn is_clone_name(name: &str) -> bool {
        CLONE_NAME_RE.is_match(name)
    }

    /// Last path component of the clone dataset
    pub fn leaf(&self) -> String {
        let full = self.to_string();
        full.rsplit('/').next().unwrap_or(&full).to_string()
    }

    /// Agent ID the clone was created from
    pub fn agent_id(&self) -> &str {
        self.dataset.rsplit('/').next().unwrap_or(&self.dataset)
    }
}

impl std::fmt::Display for CloneName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}-{}",
            self.dataset, CLONE_MARKER, self.pid, self.epoch
        )
    }
}

/// Per-volume mount outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Mounted,
    Failed,
    NotMounted,
}

impl std::fmt::Display for MountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MountStatus::Mounted => "mounted",
            MountStatus::Failed => "failed",
            MountStatus::NotMounted => "not_mounted",
        };
        write!(f, "{}", s)
    }
}

/// Kind of resource released by a cleanup sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Mount,
    Clone,
    LoopDevice,
    Directory,
}

/// Format a snapshot epoch as the date component of mount paths
pub fn format_snapshot_date(epoch: Epoch) -> String {
    DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.format("%Y-%m-%d_%H-%M-%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

/// Reduce a label to something safe as a single path component
fn sanitize_path_component(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '\\' | '/'))
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_name_parse() {
        let snap = SnapshotName::parse("homePool/home/agents/abc@1700000000").unwrap();
        assert_eq!(snap.dataset, "homePool/home/agents/abc");
        assert_eq!(snap.epoch, 1700000000);
        assert_eq!(snap.dataset_leaf(), "abc");
        assert_eq!(snap.to_string(), "homePool/home/agents/abc@1700000000");
    }

    #[test]
    fn test_snapshot_name_rejects_non_numeric_suffix() {
        assert!(SnapshotName::parse("pool/ds@manual").is_err());
        assert!(SnapshotName::parse("pool/ds").is_err());
        assert!(SnapshotName::parse("@100").is_err());
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(SnapshotSelector::parse("").unwrap(), SnapshotSelector::Latest);
        assert_eq!(SnapshotSelector::parse("ALL").unwrap(), SnapshotSelector::All);
        assert_eq!(
            SnapshotSelector::parse("1500").unwrap(),
            SnapshotSelector::Closest(1500)
        );
        assert!(SnapshotSelector::parse("yesterday").is_err());
    }

    #[test]
    fn test_clone_names_differ_by_pid() {
        let snap = SnapshotName::new("homePool/home/agents/abc", 2000);
        let a = CloneName::for_snapshot(&snap, 100);
        let b = CloneName::for_snapshot(&snap, 101);
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "homePool/home/agents/abc-snapmount-100-2000");
    }

    #[test]
    fn test_clone_name_round_trip_recognition() {
        let parsed = CloneName::parse("homePool/home/agents/abc-snapmount-42-2000").unwrap();
        assert_eq!(parsed.dataset, "homePool/home/agents/abc");
        assert_eq!(parsed.pid, 42);
        assert_eq!(parsed.epoch, 2000);
        assert_eq!(parsed.agent_id(), "abc");
        assert_eq!(parsed.leaf(), "abc-snapmount-42-2000");
        assert!(!CloneName::is_clone_name("homePool/home/agents/abc"));
    }

    #[test]
    fn test_volume_label() {
        assert_eq!(VolumeSpec::new("g1", "C:\\", "ntfs").label(), "C");
        assert_eq!(VolumeSpec::new("g1", "", "ntfs").label(), "g1");
        assert_eq!(
            VolumeSpec::new("g1", "D:\\Data Disk", "ntfs").label(),
            "DData_Disk"
        );
        assert_eq!(VolumeSpec::new("g1", "", "ntfs").image_file_name(), "g1.datto");
    }

    #[test]
    fn test_agent_dir_name_prefers_hostname() {
        let mut agent = Agent::bare("abc", "pool/home/agents/abc");
        assert_eq!(agent.dir_name(), "abc");
        agent.hostname = "server1".to_string();
        assert_eq!(agent.dir_name(), "server1");
    }

    #[test]
    fn test_format_snapshot_date() {
        assert_eq!(format_snapshot_date(0), "1970-01-01_00-00-00");
        assert_eq!(format_snapshot_date(1700000000), "2023-11-14_22-13-20");
    }

    #[test]
    fn test_pool_uses_device() {
        let mut pool = PoolInfo::new("homePool", PoolState::Available);
        pool.devices = vec!["sdb1".to_string()];
        assert!(pool.uses_device("/dev/sdb"));
        assert!(pool.uses_device("sdb1"));
        assert!(!pool.uses_device("/dev/sdc"));
        assert!(!pool.uses_device("/dev/sd"));
        assert!(!pool.uses_device("/dev/"));

        pool.devices = vec![
            "/dev/nvme0n1p3".to_string(),
            "/dev/disk/by-id/ata-WDC_WD40-part1".to_string(),
        ];
        assert!(pool.uses_device("/dev/nvme0n1"));
        assert!(!pool.uses_device("/dev/nvme0"));
        assert!(pool.uses_device("/dev/disk/by-id/ata-WDC_WD40"));
        assert!(pool.uses_device("/dev/disk/by-id/ata-WDC_WD40-part1"));
        assert!(!pool.uses_device("/dev/disk/by-id/ata-WDC"));
    }
}
