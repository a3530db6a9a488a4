use crate::error::Result;
use async_trait::async_trait;
use snapmount_core::PoolInfo;
use std::path::{Path, PathBuf};

/// One row of the kernel mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// An attached loop device and its backing file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    pub device: String,
    pub backing_file: PathBuf,
}

/// A block device as reported by lsblk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// `disk`, `part`, `loop`, ...
    pub kind: String,
    pub model: String,
    pub serial: String,
    pub transport: String,
    pub fstype: String,
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Whether this device or any partition carries a ZFS label
    pub fn has_zfs_member(&self) -> bool {
        self.fstype == "zfs_member" || self.children.iter().any(|c| c.has_zfs_member())
    }
}

/// ZFS pool and dataset management (`zpool`, `zfs`)
///
/// Every method is a narrow wrapper around one tool invocation so callers
/// can be tested against `MockSystem`. Callers verify state changes with a
/// follow-up query rather than trusting exit codes.
#[async_trait]
pub trait PoolManager: Send + Sync {
    // --- Pools ---

    /// Pools currently imported, with their leaf vdevs
    async fn imported_pools(&self) -> Result<Vec<PoolInfo>>;

    /// Pools visible to `zpool import`, optionally restricted to one device
    async fn importable_pools(&self, device: Option<&str>) -> Result<Vec<PoolInfo>>;

    /// Import a pool (`zpool import -f`, plus `-F` for forced recovery)
    async fn import_pool(&self, pool: &str, device: Option<&str>, force_recovery: bool)
        -> Result<()>;

    /// Export a pool (`zpool export`, plus `-f` when forced)
    async fn export_pool(&self, pool: &str, force: bool) -> Result<()>;

    // --- Datasets ---

    /// Direct child filesystems of a dataset, excluding the dataset itself
    async fn list_children(&self, dataset: &str) -> Result<Vec<String>>;

    /// Every filesystem in a pool
    async fn list_filesystems(&self, pool: &str) -> Result<Vec<String>>;

    /// Snapshots of one dataset in creation order (full `ds@name` form)
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>>;

    async fn dataset_exists(&self, dataset: &str) -> Result<bool>;

    /// Property value, `None` when unset or the dataset is absent
    async fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>>;

    // --- Clones ---

    /// Clone with `mountpoint` set at creation, so it never mounts elsewhere
    async fn clone_snapshot(&self, snapshot: &str, clone: &str, mountpoint: &Path) -> Result<()>;

    async fn mount_dataset(&self, dataset: &str) -> Result<()>;

    async fn unmount_dataset(&self, dataset: &str, force: bool) -> Result<()>;

    /// Destroy with `-f`; `recursive` escalates to `-R -f` (dependents too)
    async fn destroy_dataset(&self, dataset: &str, recursive: bool) -> Result<()>;
}

/// Read-only inspection of disks and images (`fdisk`, `lsblk`)
#[async_trait]
pub trait BlockDeviceInspector: Send + Sync {
    /// Raw `fdisk -l` listing of an image file
    async fn partition_table(&self, image: &Path) -> Result<String>;

    /// Block device tree
    async fn block_devices(&self) -> Result<Vec<BlockDevice>>;
}

/// Kernel mount table and loop devices (`mount`, `umount`, `losetup`)
#[async_trait]
pub trait MountService: Send + Sync {
    /// Current mount table
    async fn mount_table(&self) -> Result<Vec<MountEntry>>;

    /// Mount an image file (options carry `loop,offset=`)
    async fn mount_image(
        &self,
        image: &Path,
        dest: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()>;

    /// Unmount a path; `force` adds `-f -l`
    async fn unmount(&self, path: &Path, force: bool) -> Result<()>;

    async fn loop_devices(&self) -> Result<Vec<LoopDevice>>;

    async fn detach_loop(&self, device: &str) -> Result<()>;
}
