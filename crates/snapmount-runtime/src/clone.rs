use crate::context::OperationContext;
use crate::error::{Result, RuntimeError};
use snapmount_core::{CloneName, SnapshotName};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Observable state of an ephemeral clone
///
/// Lifecycle: `Absent -> Cloned -> Mounted -> (consumed) -> Cloned -> Absent`.
/// Every transition below checks the current state first, so repeating one
/// is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    Absent,
    Cloned,
    Mounted,
}

/// A clone mounted under the staging root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenClone {
    pub name: CloneName,
    pub snapshot: SnapshotName,
    pub mountpoint: PathBuf,
}

impl OpenClone {
    /// Raw image path of a volume inside the clone
    pub fn image_path(&self, file_name: &str) -> PathBuf {
        self.mountpoint.join(file_name)
    }
}

/// Creates, mounts and tears down snapshot clones
pub struct CloneManager<'a> {
    ctx: &'a OperationContext,
}

impl<'a> CloneManager<'a> {
    pub fn new(ctx: &'a OperationContext) -> Self {
        Self { ctx }
    }

    /// Staging mountpoint of a clone, never under the final mount root
    pub fn staging_path(&self, name: &CloneName) -> PathBuf {
        self.ctx
            .settings
            .agent_staging_dir(name.agent_id())
            .join(name.leaf())
    }

    pub async fn state(&self, clone: &str) -> Result<CloneState> {
        let pools = &self.ctx.tools.pools;
        if !pools.dataset_exists(clone).await? {
            return Ok(CloneState::Absent);
        }
        let mounted = pools.get_property(clone, "mounted").await?;
        Ok(if mounted.as_deref() == Some("yes") {
            CloneState::Mounted
        } else {
            CloneState::Cloned
        })
    }

    /// Mount table is the source of truth, not `zfs mount`'s exit code
    async fn visible_at(&self, path: &Path) -> Result<bool> {
        Ok(self
            .ctx
            .tools
            .mounts
            .mount_table()
            .await?
            .iter()
            .any(|m| m.mountpoint == path))
    }

    /// Clone a snapshot and mount it at a fresh staging directory
    ///
    /// A leftover clone with the same name (from a crashed run with a
    /// recycled PID) is torn down first.
    pub async fn open(&self, snapshot: &SnapshotName) -> Result<OpenClone> {
        let name = CloneName::for_snapshot(snapshot, self.ctx.pid);
        let clone = name.to_string();
        let pools = &self.ctx.tools.pools;

        if self.state(&clone).await? != CloneState::Absent {
            warn!("Stale clone {} found; destroying before reuse", clone);
            if !self.close(&name).await {
                return Err(RuntimeError::clone_mount_failed(
                    &clone,
                    "stale clone could not be removed",
                ));
            }
        }

        let mountpoint = self.staging_path(&name);
        tokio::fs::create_dir_all(&mountpoint)
            .await
            .map_err(|e| RuntimeError::io(&mountpoint, e))?;

        if let Err(e) = pools
            .clone_snapshot(&snapshot.to_string(), &clone, &mountpoint)
            .await
        {
            remove_dir_quietly(&mountpoint).await;
            return Err(RuntimeError::clone_mount_failed(&clone, e.to_string()));
        }

        // From here on the clone exists; any failure tears it down again
        if let Err(e) = self.mount_clone(&clone, &mountpoint).await {
            self.close(&name).await;
            return Err(match e {
                e @ RuntimeError::CloneMountFailed { .. } => e,
                e => RuntimeError::clone_mount_failed(&clone, e.to_string()),
            });
        }

        info!("Clone {} mounted at {}", clone, mountpoint.display());
        Ok(OpenClone {
            name,
            snapshot: snapshot.clone(),
            mountpoint,
        })
    }

    async fn mount_clone(&self, clone: &str, mountpoint: &Path) -> Result<()> {
        // Creating the clone may already have mounted it
        if self.state(clone).await? != CloneState::Mounted {
            if let Err(e) = self.ctx.tools.pools.mount_dataset(clone).await {
                debug!("zfs mount {} reported: {}", clone, e);
            }
        }

        if !self.visible_at(mountpoint).await? {
            return Err(RuntimeError::clone_mount_failed(
                clone,
                format!("{} not present in mount table", mountpoint.display()),
            ));
        }
        Ok(())
    }

    /// Unmount and destroy a clone, best effort
    ///
    /// Returns whether the clone is gone afterwards. Failures are logged,
    /// never raised.
    pub async fn close(&self, name: &CloneName) -> bool {
        let clone = name.to_string();
        let mountpoint = self.staging_path(name);
        let pools = &self.ctx.tools.pools;

        let state = match self.state(&clone).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Cannot query clone {}: {}", clone, e);
                return false;
            }
        };

        if state == CloneState::Absent {
            remove_dir_quietly(&mountpoint).await;
            return true;
        }

        if state == CloneState::Mounted || self.visible_at(&mountpoint).await.unwrap_or(false) {
            if let Err(e) = pools.unmount_dataset(&clone, true).await {
                warn!("Unmount of clone {} failed: {}", clone, e);
            }
            self.ctx.settle().await;
        }

        if let Err(e) = pools.destroy_dataset(&clone, false).await {
            debug!("zfs destroy {} reported: {}", clone, e);
        }
        self.ctx.settle().await;

        if matches!(pools.dataset_exists(&clone).await, Ok(true)) {
            warn!("Clone {} survived destroy; escalating to recursive destroy", clone);
            if let Err(e) = pools.destroy_dataset(&clone, true).await {
                warn!("Recursive destroy of {} failed: {}", clone, e);
            }
            self.ctx.settle().await;
            if !matches!(pools.dataset_exists(&clone).await, Ok(false)) {
                warn!("Clone {} could not be destroyed", clone);
                return false;
            }
        }

        remove_dir_quietly(&mountpoint).await;
        info!("Clone {} destroyed", clone);
        true
    }
}

async fn remove_dir_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Leaving {} in place: {}", path.display(), e);
        }
    }
}
