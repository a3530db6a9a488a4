use crate::error::{Result, RuntimeError};
use crate::traits::{BlockDevice, BlockDeviceInspector, LoopDevice, MountEntry, MountService, PoolManager};
use async_trait::async_trait;
use snapmount_core::{Epoch, PoolInfo, PoolState, SnapshotName};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory dataset
#[derive(Debug, Clone, Default)]
struct MockDataset {
    properties: BTreeMap<String, String>,
    /// Snapshot this dataset was cloned from
    origin: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    pools: Vec<PoolInfo>,
    datasets: BTreeMap<String, MockDataset>,
    /// dataset -> snapshot names in listing order
    snapshots: BTreeMap<String, Vec<String>>,
    /// dataset -> image file names present in every snapshot of it
    images: BTreeMap<String, Vec<String>>,
    mounts: Vec<MountEntry>,
    loops: Vec<LoopDevice>,
    next_loop: u32,
    /// fdisk listing with `{image}` standing in for the image path
    partition_table: Option<String>,
    block_devices: Vec<BlockDevice>,
    silent_clone_mounts: HashSet<Epoch>,
    ignore_read_only: bool,
    failing_volume_mounts: HashSet<String>,
    stuck_mounts: HashSet<PathBuf>,
    failing_fast_imports: HashSet<String>,
    resist_destroy: HashSet<String>,
    undestroyable: HashSet<String>,
    /// Remaining mount table reads that fail
    failing_mount_table_reads: usize,
    commands: Vec<String>,
}

impl MockState {
    fn log(&mut self, command: String) {
        debug!("Mock: {}", command);
        self.commands.push(command);
    }

    fn mounted_entry(&self, dataset: &str) -> Option<usize> {
        self.mounts
            .iter()
            .position(|m| m.fstype == "zfs" && m.source == dataset)
    }

    /// Drop a ZFS mount entry and the image files materialized for it
    fn drop_dataset_mount(&mut self, index: usize) {
        let entry = self.mounts.remove(index);
        let origin_dataset = self
            .datasets
            .get(&entry.source)
            .and_then(|d| d.origin.as_deref())
            .and_then(|o| SnapshotName::parse(o).ok())
            .map(|s| s.dataset);
        if let Some(files) = origin_dataset.and_then(|ds| self.images.get(&ds)) {
            for file in files {
                let _ = std::fs::remove_file(entry.mountpoint.join(file));
            }
        }
    }
}

fn not_found(command: &str, what: &str) -> RuntimeError {
    RuntimeError::command_failed(command, 1, format!("cannot open '{}': does not exist", what))
}

/// In-memory stand-in for `zpool`, `zfs`, `fdisk`, `lsblk`, `mount` and `losetup`
///
/// One shared state backs all three tool traits, so a ZFS mount shows up in
/// the mount table the same way it would on a real host. Image files of a
/// cloned snapshot are created on disk when the clone mounts, which lets
/// tests run the whole pipeline against `tempfile` directories.
#[derive(Clone, Default)]
pub struct MockSystem {
    state: Arc<RwLock<MockState>>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Setup ---

    pub async fn add_pool(&self, name: &str, state: PoolState) {
        let mut st = self.state.write().await;
        st.pools.push(PoolInfo::new(name, state));
        if state == PoolState::Imported {
            st.datasets.entry(name.to_string()).or_default();
        }
    }

    pub async fn set_pool_devices(&self, name: &str, devices: &[&str]) {
        let mut st = self.state.write().await;
        if let Some(pool) = st.pools.iter_mut().find(|p| p.name == name) {
            pool.devices = devices.iter().map(|d| d.to_string()).collect();
        }
    }

    pub async fn add_dataset(&self, name: &str) {
        self.state
            .write()
            .await
            .datasets
            .entry(name.to_string())
            .or_default();
    }

    pub async fn set_dataset_property(&self, name: &str, property: &str, value: &str) {
        self.state
            .write()
            .await
            .datasets
            .entry(name.to_string())
            .or_default()
            .properties
            .insert(property.to_string(), value.to_string());
    }

    /// Register snapshots in the given listing order
    pub async fn add_snapshots(&self, dataset: &str, epochs: &[Epoch]) {
        let mut st = self.state.write().await;
        let list = st.snapshots.entry(dataset.to_string()).or_default();
        list.extend(epochs.iter().map(|e| format!("{}@{}", dataset, e)));
    }

    /// Image files exposed by every clone of `dataset`'s snapshots
    pub async fn set_images(&self, dataset: &str, files: &[&str]) {
        self.state
            .write()
            .await
            .images
            .insert(dataset.to_string(), files.iter().map(|f| f.to_string()).collect());
    }

    pub async fn set_partition_table(&self, template: &str) {
        self.state.write().await.partition_table = Some(template.to_string());
    }

    pub async fn add_block_device(&self, device: BlockDevice) {
        self.state.write().await.block_devices.push(device);
    }

    pub async fn add_mount(&self, entry: MountEntry) {
        self.state.write().await.mounts.push(entry);
    }

    pub async fn add_loop(&self, device: &str, backing_file: &Path) {
        self.state.write().await.loops.push(LoopDevice {
            device: device.to_string(),
            backing_file: backing_file.to_path_buf(),
        });
    }

    // --- Fault injection ---

    /// `zfs mount` of clones made from this epoch exits 0 without mounting
    pub async fn fail_clone_mount_silently(&self, epoch: Epoch) {
        self.state.write().await.silent_clone_mounts.insert(epoch);
    }

    /// Image mounts come up read-write regardless of requested options
    pub async fn ignore_read_only(&self) {
        self.state.write().await.ignore_read_only = true;
    }

    /// Image mounts of files whose name contains `fragment` exit non-zero
    pub async fn fail_volume_mount(&self, fragment: &str) {
        self.state
            .write()
            .await
            .failing_volume_mounts
            .insert(fragment.to_string());
    }

    /// Plain unmounts of this path report busy; forced ones succeed
    pub async fn stick_mount(&self, path: &Path) {
        self.state.write().await.stuck_mounts.insert(path.to_path_buf());
    }

    /// Imports without forced recovery fail for this pool
    pub async fn fail_fast_import(&self, pool: &str) {
        self.state
            .write()
            .await
            .failing_fast_imports
            .insert(pool.to_string());
    }

    /// Non-recursive destroy of this dataset exits 0 but leaves it behind
    pub async fn resist_destroy(&self, dataset: &str) {
        self.state
            .write()
            .await
            .resist_destroy
            .insert(dataset.to_string());
    }

    /// Every destroy of this dataset, recursive or not, exits 0 and leaves it behind
    pub async fn make_undestroyable(&self, dataset: &str) {
        self.state
            .write()
            .await
            .undestroyable
            .insert(dataset.to_string());
    }

    /// The next `reads` mount table queries fail
    pub async fn fail_mount_table_reads(&self, reads: usize) {
        self.state.write().await.failing_mount_table_reads = reads;
    }

    // --- Inspection ---

    pub async fn mounts(&self) -> Vec<MountEntry> {
        self.state.read().await.mounts.clone()
    }

    pub async fn is_mounted(&self, path: &Path) -> bool {
        self.state
            .read()
            .await
            .mounts
            .iter()
            .any(|m| m.mountpoint == path)
    }

    pub async fn has_dataset(&self, name: &str) -> bool {
        self.state.read().await.datasets.contains_key(name)
    }

    pub async fn datasets(&self) -> Vec<String> {
        self.state.read().await.datasets.keys().cloned().collect()
    }

    pub async fn loops(&self) -> Vec<LoopDevice> {
        self.state.read().await.loops.clone()
    }

    pub async fn pool_state(&self, name: &str) -> Option<PoolState> {
        self.state
            .read()
            .await
            .pools
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.state)
    }

    pub async fn commands(&self) -> Vec<String> {
        self.state.read().await.commands.clone()
    }

    /// Whether a write under `path` would be accepted by the covering mount
    pub async fn is_writable(&self, path: &Path) -> bool {
        let st = self.state.read().await;
        st.mounts
            .iter()
            .filter(|m| path.starts_with(&m.mountpoint))
            .max_by_key(|m| m.mountpoint.components().count())
            .map(|m| !m.is_read_only())
            .unwrap_or(true)
    }
}

#[async_trait]
impl PoolManager for MockSystem {
    async fn imported_pools(&self) -> Result<Vec<PoolInfo>> {
        let st = self.state.read().await;
        Ok(st
            .pools
            .iter()
            .filter(|p| p.state == PoolState::Imported)
            .cloned()
            .collect())
    }

    async fn importable_pools(&self, device: Option<&str>) -> Result<Vec<PoolInfo>> {
        let st = self.state.read().await;
        Ok(st
            .pools
            .iter()
            .filter(|p| p.state == PoolState::Available)
            .filter(|p| device.map(|d| p.uses_device(d)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn import_pool(
        &self,
        pool: &str,
        _device: Option<&str>,
        force_recovery: bool,
    ) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!("zpool import {} recovery={}", pool, force_recovery));
        if !force_recovery && st.failing_fast_imports.contains(pool) {
            return Err(RuntimeError::command_failed(
                format!("zpool import -f {}", pool),
                1,
                "one or more devices is currently unavailable",
            ));
        }
        let entry = st
            .pools
            .iter_mut()
            .find(|p| p.name == pool && p.state == PoolState::Available)
            .ok_or_else(|| not_found("zpool import", pool))?;
        entry.state = PoolState::Imported;
        st.datasets.entry(pool.to_string()).or_default();
        Ok(())
    }

    async fn export_pool(&self, pool: &str, force: bool) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!("zpool export {} force={}", pool, force));
        let prefix = format!("{}/", pool);
        let busy = st
            .mounts
            .iter()
            .any(|m| m.fstype == "zfs" && m.source.starts_with(&prefix));
        if busy && !force {
            return Err(RuntimeError::command_failed(
                format!("zpool export {}", pool),
                1,
                "pool is busy",
            ));
        }
        let entry = st
            .pools
            .iter_mut()
            .find(|p| p.name == pool && p.state == PoolState::Imported)
            .ok_or_else(|| not_found("zpool export", pool))?;
        entry.state = PoolState::Available;
        Ok(())
    }

    async fn list_children(&self, dataset: &str) -> Result<Vec<String>> {
        let st = self.state.read().await;
        if !st.datasets.contains_key(dataset) {
            return Err(not_found("zfs list", dataset));
        }
        let prefix = format!("{}/", dataset);
        Ok(st
            .datasets
            .keys()
            .filter(|k| k.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
            .cloned()
            .collect())
    }

    async fn list_filesystems(&self, pool: &str) -> Result<Vec<String>> {
        let st = self.state.read().await;
        let prefix = format!("{}/", pool);
        Ok(st
            .datasets
            .keys()
            .filter(|k| k.as_str() == pool || k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let st = self.state.read().await;
        if !st.datasets.contains_key(dataset) {
            return Err(not_found("zfs list -t snapshot", dataset));
        }
        Ok(st.snapshots.get(dataset).cloned().unwrap_or_default())
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        Ok(self.state.read().await.datasets.contains_key(dataset))
    }

    async fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let st = self.state.read().await;
        let Some(ds) = st.datasets.get(dataset) else {
            return Ok(None);
        };
        Ok(match property {
            "mounted" => Some(
                if st.mounted_entry(dataset).is_some() {
                    "yes"
                } else {
                    "no"
                }
                .to_string(),
            ),
            "origin" => ds.origin.clone(),
            other => ds.properties.get(other).cloned(),
        })
    }

    async fn clone_snapshot(&self, snapshot: &str, clone: &str, mountpoint: &Path) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!(
            "zfs clone -o mountpoint={} {} {}",
            mountpoint.display(),
            snapshot,
            clone
        ));
        let snap = SnapshotName::parse(snapshot)?;
        let exists = st
            .snapshots
            .get(&snap.dataset)
            .is_some_and(|list| list.iter().any(|s| s == snapshot));
        if !exists {
            return Err(not_found("zfs clone", snapshot));
        }
        if st.datasets.contains_key(clone) {
            return Err(RuntimeError::zfs_error(format!(
                "cannot create '{}': dataset already exists",
                clone
            )));
        }
        st.datasets.insert(
            clone.to_string(),
            MockDataset {
                properties: BTreeMap::from([(
                    "mountpoint".to_string(),
                    mountpoint.to_string_lossy().into_owned(),
                )]),
                origin: Some(snapshot.to_string()),
            },
        );
        Ok(())
    }

    async fn mount_dataset(&self, dataset: &str) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!("zfs mount {}", dataset));
        let ds = st
            .datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| not_found("zfs mount", dataset))?;
        if st.mounted_entry(dataset).is_some() {
            return Err(RuntimeError::command_failed(
                format!("zfs mount {}", dataset),
                1,
                "filesystem already mounted",
            ));
        }
        let mountpoint = ds
            .properties
            .get("mountpoint")
            .filter(|m| m.starts_with('/'))
            .map(PathBuf::from)
            .ok_or_else(|| {
                RuntimeError::command_failed(
                    format!("zfs mount {}", dataset),
                    1,
                    "no mountpoint set",
                )
            })?;

        let origin = ds.origin.as_deref().and_then(|o| SnapshotName::parse(o).ok());
        if let Some(origin) = &origin {
            if st.silent_clone_mounts.contains(&origin.epoch) {
                return Ok(());
            }
        }

        if let Some(files) = origin.as_ref().and_then(|o| st.images.get(&o.dataset)) {
            std::fs::create_dir_all(&mountpoint).map_err(|e| RuntimeError::io(&mountpoint, e))?;
            for file in files {
                let path = mountpoint.join(file);
                std::fs::write(&path, b"").map_err(|e| RuntimeError::io(&path, e))?;
            }
        }

        st.mounts.push(MountEntry {
            source: dataset.to_string(),
            mountpoint,
            fstype: "zfs".to_string(),
            options: vec!["rw".to_string()],
        });
        Ok(())
    }

    async fn unmount_dataset(&self, dataset: &str, force: bool) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!("zfs unmount {} force={}", dataset, force));
        let index = st.mounted_entry(dataset).ok_or_else(|| {
            RuntimeError::command_failed(
                format!("zfs unmount {}", dataset),
                1,
                "not currently mounted",
            )
        })?;
        if !force && st.stuck_mounts.contains(&st.mounts[index].mountpoint) {
            return Err(RuntimeError::command_failed(
                format!("zfs unmount {}", dataset),
                1,
                "pool or dataset is busy",
            ));
        }
        st.drop_dataset_mount(index);
        Ok(())
    }

    async fn destroy_dataset(&self, dataset: &str, recursive: bool) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!("zfs destroy {} recursive={}", dataset, recursive));
        if !st.datasets.contains_key(dataset) {
            return Err(not_found("zfs destroy", dataset));
        }
        if st.undestroyable.contains(dataset)
            || (!recursive && st.resist_destroy.contains(dataset))
        {
            return Ok(());
        }
        if let Some(index) = st.mounted_entry(dataset) {
            st.drop_dataset_mount(index);
        }
        st.datasets.remove(dataset);
        Ok(())
    }
}

#[async_trait]
impl BlockDeviceInspector for MockSystem {
    async fn partition_table(&self, image: &Path) -> Result<String> {
        let st = self.state.read().await;
        st.partition_table
            .as_ref()
            .map(|t| t.replace("{image}", &image.to_string_lossy()))
            .ok_or_else(|| {
                RuntimeError::command_failed(
                    format!("fdisk -l {}", image.display()),
                    1,
                    "cannot open",
                )
            })
    }

    async fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        Ok(self.state.read().await.block_devices.clone())
    }
}

#[async_trait]
impl MountService for MockSystem {
    async fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let mut st = self.state.write().await;
        if st.failing_mount_table_reads > 0 {
            st.failing_mount_table_reads -= 1;
            return Err(RuntimeError::io(
                Path::new("/proc/self/mountinfo"),
                std::io::Error::from(std::io::ErrorKind::Interrupted),
            ));
        }
        Ok(st.mounts.clone())
    }

    async fn mount_image(
        &self,
        image: &Path,
        dest: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!(
            "mount -t {} -o {} {} {}",
            fstype,
            options.join(","),
            image.display(),
            dest.display()
        ));
        let image_str = image.to_string_lossy();
        if st
            .failing_volume_mounts
            .iter()
            .any(|f| image_str.contains(f.as_str()))
        {
            return Err(RuntimeError::command_failed(
                format!("mount {}", image.display()),
                32,
                "wrong fs type, bad option, bad superblock",
            ));
        }
        if st.mounts.iter().any(|m| m.mountpoint == dest) {
            return Err(RuntimeError::command_failed(
                format!("mount {}", image.display()),
                32,
                "mount point busy",
            ));
        }

        let mut opts: Vec<String> = options
            .iter()
            .filter(|o| !o.starts_with("offset=") && o.as_str() != "loop")
            .cloned()
            .collect();
        if st.ignore_read_only {
            opts.retain(|o| o != "ro");
            opts.insert(0, "rw".to_string());
        }

        let device = format!("/dev/loop{}", st.next_loop);
        st.next_loop += 1;
        st.loops.push(LoopDevice {
            device: device.clone(),
            backing_file: image.to_path_buf(),
        });
        st.mounts.push(MountEntry {
            source: device,
            mountpoint: dest.to_path_buf(),
            fstype: fstype.to_string(),
            options: opts,
        });
        Ok(())
    }

    async fn unmount(&self, path: &Path, force: bool) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!("umount {} force={}", path.display(), force));
        let index = st
            .mounts
            .iter()
            .rposition(|m| m.mountpoint == path)
            .ok_or_else(|| {
                RuntimeError::command_failed(
                    format!("umount {}", path.display()),
                    32,
                    "not mounted",
                )
            })?;
        if !force && st.stuck_mounts.contains(path) {
            return Err(RuntimeError::command_failed(
                format!("umount {}", path.display()),
                32,
                "target is busy",
            ));
        }
        if st.mounts[index].fstype == "zfs" {
            st.drop_dataset_mount(index);
        } else {
            let entry = st.mounts.remove(index);
            // autoclear loop devices go away with their mount
            st.loops.retain(|l| l.device != entry.source);
        }
        Ok(())
    }

    async fn loop_devices(&self) -> Result<Vec<LoopDevice>> {
        Ok(self.state.read().await.loops.clone())
    }

    async fn detach_loop(&self, device: &str) -> Result<()> {
        let mut st = self.state.write().await;
        st.log(format!("losetup -d {}", device));
        let before = st.loops.len();
        st.loops.retain(|l| l.device != device);
        if st.loops.len() == before {
            return Err(RuntimeError::command_failed(
                format!("losetup -d {}", device),
                1,
                "No such device or address",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_clone_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("homePool", PoolState::Imported).await;
        mock.add_dataset("homePool/home/agents/abc").await;
        mock.add_snapshots("homePool/home/agents/abc", &[100]).await;
        mock.set_images("homePool/home/agents/abc", &["g1.datto"]).await;

        let clone = "homePool/home/agents/abc-snapmount-1-100";
        let mp = tmp.path().join("clone");
        mock.clone_snapshot("homePool/home/agents/abc@100", clone, &mp)
            .await
            .unwrap();
        mock.mount_dataset(clone).await.unwrap();

        assert!(mock.is_mounted(&mp).await);
        assert!(mp.join("g1.datto").exists());
        assert_eq!(
            mock.get_property(clone, "mounted").await.unwrap().as_deref(),
            Some("yes")
        );

        mock.destroy_dataset(clone, false).await.unwrap();
        assert!(!mock.is_mounted(&mp).await);
        assert!(!mp.join("g1.datto").exists());
        assert!(!mock.has_dataset(clone).await);
    }

    #[tokio::test]
    async fn test_mock_silent_clone_mount() {
        let mock = MockSystem::new();
        mock.add_dataset("p/a").await;
        mock.add_snapshots("p/a", &[5]).await;
        mock.fail_clone_mount_silently(5).await;
        mock.clone_snapshot("p/a@5", "p/a-c", Path::new("/tmp/nowhere"))
            .await
            .unwrap();

        assert!(mock.mount_dataset("p/a-c").await.is_ok());
        assert!(mock.mounts().await.is_empty());
    }

    #[tokio::test]
    async fn test_mock_image_mount_attaches_loop() {
        let mock = MockSystem::new();
        let opts = vec!["ro".to_string(), "loop".to_string(), "offset=1048576".to_string()];
        mock.mount_image(Path::new("/s/g1.datto"), Path::new("/m/C"), "ntfs-3g", &opts)
            .await
            .unwrap();

        assert_eq!(mock.loops().await.len(), 1);
        assert!(!mock.is_writable(Path::new("/m/C/Windows")).await);

        mock.unmount(Path::new("/m/C"), false).await.unwrap();
        assert!(mock.loops().await.is_empty());
        assert!(mock.unmount(Path::new("/m/C"), false).await.is_err());
    }
}
