//! Snapmount Core - Domain types for ZFS backup snapshot mounting
//!
//! This crate provides:
//! - Pool, agent, snapshot, volume and clone naming types
//! - Error types with miette diagnostics
//! - Runtime settings assembled from the environment
//! - JSON report shapes shared by every command

pub mod config;
pub mod error;
pub mod report;
pub mod types;

// Re-export commonly used types
pub use config::{Settings, DEFAULT_POOL_PATTERN};
pub use error::{CoreError, Result};
pub use report::{
    AgentSummary, AutomountOutcome, AutomountReport, BatchStatus, CleanedResource, CleanupReport,
    DriveInfo, ErrorReport, MetadataReport, MountReport, PoolActionRecord, PoolActionReport,
    PoolSummary, SnapshotMountRecord, StatusReport, VolumeMountRecord,
};
pub use types::{
    format_snapshot_date, Agent, CloneName, Epoch, MountStatus, PoolInfo, PoolState,
    ResourceKind, SnapshotName, SnapshotSelector, VolumeSpec, CLONE_MARKER, IMAGE_SUFFIX,
};

/// Serialize a report to JSON
pub fn to_json<T: serde::Serialize>(report: &T) -> Result<String> {
    serde_json::to_string(report).map_err(|e| {
        CoreError::serialization_error(format!("Failed to serialize to JSON: {}", e))
    })
}

/// Serialize a report to pretty JSON
pub fn to_json_pretty<T: serde::Serialize>(report: &T) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(|e| {
        CoreError::serialization_error(format!("Failed to serialize to JSON: {}", e))
    })
}
