// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! Snapmount Runtime - pool, snapshot and mount lifecycle over ZFS tooling

pub mod automount;
pub mod block;
pub mod catalog;
pub mod cleanup;
pub mod clone;
pub mod command;
pub mod context;
pub mod error;
pub mod mock;
pub mod mount;
pub mod mounts;
pub mod partition;
pub mod pool;
pub mod snapshot;
pub mod status;
pub mod traits;
pub mod volume;
pub mod zfs;

// Re-export primary types
pub use context::{require_root, OperationContext, OutputMode, SystemTools};
pub use error::{Result, RuntimeError};
pub use mock::MockSystem;
pub use traits::{BlockDeviceInspector, MountService, PoolManager};

// Re-export host tool implementations
pub use block::LinuxBlockInspector;
pub use mounts::LinuxMountService;
pub use zfs::ZfsPoolManager;

// Re-export operations
pub use automount::{run_automount, AutomountLock};
pub use cleanup::{cleanup, CleanupScope};
pub use clone::{CloneManager, CloneState, OpenClone};
pub use mount::{cleanup_agent, mount_agent, resolve_cleanup_scope};
pub use partition::{parse_partition_offset, resolve_offset};
pub use pool::{export_pools, import_pools, locate_pool};
pub use snapshot::{resolve_snapshots, select_snapshots};
pub use status::{collect_metadata, collect_status};
pub use volume::{mount_volume, FilesystemDriver};
