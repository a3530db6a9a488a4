use crate::block::LinuxBlockInspector;
use crate::error::{Result, RuntimeError};
use crate::mock::MockSystem;
use crate::mounts::LinuxMountService;
use crate::traits::{BlockDeviceInspector, MountService, PoolManager};
use crate::zfs::ZfsPoolManager;
use snapmount_core::{Settings, SnapshotMountRecord};
use std::sync::Arc;
use std::time::Duration;

/// How results are presented to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Human progress lines on stdout, warnings on stderr
    #[default]
    Text,
    /// A single JSON document at the end, nothing else on stdout
    Json,
}

/// The external tool backends an operation runs against
#[derive(Clone)]
pub struct SystemTools {
    pub pools: Arc<dyn PoolManager>,
    pub block: Arc<dyn BlockDeviceInspector>,
    pub mounts: Arc<dyn MountService>,
}

impl SystemTools {
    /// Real `zfs`/`zpool`/`fdisk`/`lsblk`/`mount`/`losetup` backends
    pub fn host() -> Self {
        Self {
            pools: Arc::new(ZfsPoolManager::new()),
            block: Arc::new(LinuxBlockInspector::new()),
            mounts: Arc::new(LinuxMountService::new()),
        }
    }

    /// All three backends served by one shared mock
    pub fn mock(mock: &MockSystem) -> Self {
        Self {
            pools: Arc::new(mock.clone()),
            block: Arc::new(mock.clone()),
            mounts: Arc::new(mock.clone()),
        }
    }
}

/// Everything one invocation needs, threaded explicitly through every call
pub struct OperationContext {
    pub settings: Settings,
    pub output: OutputMode,
    /// Namespaces clone names so concurrent invocations never collide
    pub pid: u32,
    pub tools: SystemTools,
    records: Vec<SnapshotMountRecord>,
}

impl OperationContext {
    pub fn new(settings: Settings, output: OutputMode, tools: SystemTools) -> Self {
        Self {
            settings,
            output,
            pid: std::process::id(),
            tools,
            records: Vec::new(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Print a human progress line (text mode only)
    pub fn progress(&self, message: impl AsRef<str>) {
        if self.output == OutputMode::Text {
            println!("{}", message.as_ref());
        }
    }

    pub fn record(&mut self, record: SnapshotMountRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[SnapshotMountRecord] {
        &self.records
    }

    pub fn take_records(&mut self) -> Vec<SnapshotMountRecord> {
        std::mem::take(&mut self.records)
    }

    /// Fixed pause letting kernel-side unmount/destroy complete
    pub async fn settle(&self) {
        if self.settings.settle_delay > Duration::ZERO {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
    }
}

/// Fail unless running with effective UID 0
pub fn require_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(RuntimeError::NotPrivileged);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;

    /// Settings rooted in a temp directory with no settle delay
    pub fn settings_in(root: &Path) -> Settings {
        Settings {
            mount_root: root.join("mnt"),
            staging_root: root.join("staging"),
            settle_delay: Duration::ZERO,
            automount_flag: root.join("automount.enabled"),
            lock_file: root.join("automount.lock"),
            ..Default::default()
        }
    }

    pub fn mock_context(mock: &MockSystem, root: &Path) -> OperationContext {
        OperationContext::new(settings_in(root), OutputMode::Json, SystemTools::mock(mock))
            .with_pid(4242)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::mock_context;
    use super::*;
    use snapmount_core::MountStatus;

    fn record(snapshot: &str) -> SnapshotMountRecord {
        SnapshotMountRecord {
            snapshot: snapshot.to_string(),
            epoch: 0,
            date: String::new(),
            zfs_clone: String::new(),
            temp_mount: String::new(),
            final_mount: String::new(),
            status: MountStatus::Failed,
            error: None,
            volumes: Vec::new(),
        }
    }

    #[test]
    fn test_records_are_drained() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = mock_context(&MockSystem::new(), tmp.path());
        ctx.record(record("p/a@1"));
        ctx.record(record("p/a@2"));
        assert_eq!(ctx.records().len(), 2);

        let taken = ctx.take_records();
        assert_eq!(taken[1].snapshot, "p/a@2");
        assert!(ctx.records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_for_configured_delay() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = mock_context(&MockSystem::new(), tmp.path());
        ctx.settings.settle_delay = Duration::from_millis(1500);

        let start = tokio::time::Instant::now();
        ctx.settle().await;
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }
}
