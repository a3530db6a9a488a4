use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Runtime error type for pool, snapshot and mount operations
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Not running as root
    #[error("This operation requires root privileges")]
    #[diagnostic(
        code(snapmount::runtime::not_privileged),
        help("Re-run with sudo. ZFS clone, mount and loop operations need CAP_SYS_ADMIN")
    )]
    NotPrivileged,

    /// No pool matched the override or pattern
    #[error("No matching ZFS pool found (tried: {tried})")]
    #[diagnostic(
        code(snapmount::runtime::pool_not_found),
        help("Check `zpool list` and `zpool import`. Set POOL_NAME or POOL_PATTERN if the pool uses a non-standard name")
    )]
    PoolNotFound {
        #[allow(unused)]
        tried: String,
    },

    /// Agent reference matched nothing
    #[error("Agent not found: {agent_ref}")]
    #[diagnostic(
        code(snapmount::runtime::agent_not_found),
        help("Agents are matched by hostname, display name, or ID (exact, case-sensitive). Run `snapmount metadata` to list them")
    )]
    AgentNotFound {
        #[allow(unused)]
        agent_ref: String,
    },

    /// Agent has no usable snapshots
    #[error("No snapshots found for agent '{agent}' (dataset {dataset})")]
    #[diagnostic(
        code(snapmount::runtime::no_snapshots_found),
        help("Verify with `zfs list -t snapshot -d 1 {dataset}`")
    )]
    NoSnapshotsFound {
        #[allow(unused)]
        agent: String,
        #[allow(unused)]
        dataset: String,
    },

    /// Agent metadata could not be read
    #[error("Agent metadata unavailable: {message}")]
    #[diagnostic(
        code(snapmount::runtime::metadata_unavailable),
        help("Ensure the pool is imported and AGENTS_PATH points at the dataset holding the agents")
    )]
    MetadataUnavailable {
        #[allow(unused)]
        message: String,
    },

    /// Agent metadata file was malformed
    #[error("Failed to parse agent metadata at {}: {message}", path.display())]
    #[diagnostic(
        code(snapmount::runtime::metadata_parse),
        help("The .agentInfo file must be a JSON object. Inspect it manually")
    )]
    MetadataParse {
        #[allow(unused)]
        path: PathBuf,
        #[allow(unused)]
        message: String,
    },

    /// Snapshot clone did not end up mounted
    #[error("Clone '{clone}' failed to mount: {message}")]
    #[diagnostic(
        code(snapmount::runtime::clone_mount_failed),
        help("Check `zfs get mounted,mountpoint {clone}`. A concurrent run may have raced on the same snapshot; retry")
    )]
    CloneMountFailed {
        #[allow(unused)]
        clone: String,
        #[allow(unused)]
        message: String,
    },

    /// Raw image missing from the clone
    #[error("Volume image not found: {}", path.display())]
    #[diagnostic(
        code(snapmount::runtime::image_missing),
        help("The snapshot may predate this volume. List the clone's *.datto files")
    )]
    ImageMissing {
        #[allow(unused)]
        path: PathBuf,
    },

    /// Partition offset could not be determined
    #[error("Cannot determine partition offset for {}: {message}", image.display())]
    #[diagnostic(
        code(snapmount::runtime::offset_undeterminable),
        help("Run `fdisk -l` on the image. The first partition must be listed as <image>1")
    )]
    OffsetUndeterminable {
        #[allow(unused)]
        image: PathBuf,
        #[allow(unused)]
        message: String,
    },

    /// Final volume mount failed or did not verify
    #[error("Failed to mount volume at {}: {message}", path.display())]
    #[diagnostic(
        code(snapmount::runtime::volume_mount_failed),
        help("Check that ntfs-3g is installed and that the mount appears in /proc/self/mountinfo")
    )]
    VolumeMountFailed {
        #[allow(unused)]
        path: PathBuf,
        #[allow(unused)]
        message: String,
    },

    /// ZFS error
    #[error("ZFS operation failed: {message}")]
    #[diagnostic(
        code(snapmount::runtime::zfs_error),
        help("Verify the dataset exists with `zfs list`. Ensure the pool is imported and healthy")
    )]
    ZfsError {
        #[allow(unused)]
        message: String,
    },

    /// Command execution failed
    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(snapmount::runtime::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        #[allow(unused)]
        command: String,
        #[allow(unused)]
        exit_code: i32,
        #[allow(unused)]
        stderr: String,
    },

    /// Filesystem I/O failed
    #[error("I/O error on {}: {source}", path.display())]
    #[diagnostic(
        code(snapmount::runtime::io_error),
        help("Check permissions and free space on the mount and staging roots")
    )]
    IoError {
        #[allow(unused)]
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Automount lock could not be taken for a reason other than contention
    #[error("Failed to acquire lock {}: {message}", path.display())]
    #[diagnostic(
        code(snapmount::runtime::lock_failed),
        help("Ensure the lock file's directory exists and is writable")
    )]
    LockFailed {
        #[allow(unused)]
        path: PathBuf,
        #[allow(unused)]
        message: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] snapmount_core::CoreError),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn pool_not_found(tried: impl Into<String>) -> Self {
        Self::PoolNotFound {
            tried: tried.into(),
        }
    }

    pub fn agent_not_found(agent_ref: impl Into<String>) -> Self {
        Self::AgentNotFound {
            agent_ref: agent_ref.into(),
        }
    }

    pub fn no_snapshots_found(agent: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self::NoSnapshotsFound {
            agent: agent.into(),
            dataset: dataset.into(),
        }
    }

    pub fn metadata_unavailable(message: impl Into<String>) -> Self {
        Self::MetadataUnavailable {
            message: message.into(),
        }
    }

    pub fn metadata_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MetadataParse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn clone_mount_failed(clone: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CloneMountFailed {
            clone: clone.into(),
            message: message.into(),
        }
    }

    pub fn image_missing(path: impl Into<PathBuf>) -> Self {
        Self::ImageMissing { path: path.into() }
    }

    pub fn offset_undeterminable(image: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::OffsetUndeterminable {
            image: image.into(),
            message: message.into(),
        }
    }

    pub fn volume_mount_failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::VolumeMountFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn zfs_error(message: impl Into<String>) -> Self {
        Self::ZfsError {
            message: message.into(),
        }
    }

    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn lock_failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::LockFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Failures that abort a single snapshot or volume rather than the run
    pub fn is_item_level(&self) -> bool {
        matches!(
            self,
            RuntimeError::CloneMountFailed { .. }
                | RuntimeError::ImageMissing { .. }
                | RuntimeError::OffsetUndeterminable { .. }
                | RuntimeError::VolumeMountFailed { .. }
        )
    }
}
