//! `status` and `metadata` reports

use crate::catalog::load_agents;
use crate::context::OperationContext;
use crate::error::Result;
use crate::pool::{ensure_imported, locate_pool, PoolMatcher};
use crate::snapshot::resolve_snapshots;
use crate::traits::BlockDevice;
use chrono::Utc;
use snapmount_core::{
    AgentSummary, DriveInfo, MetadataReport, PoolInfo, PoolState, PoolSummary, SnapshotSelector,
    StatusReport,
};
use std::collections::BTreeMap;
use tracing::warn;

fn summarize(pool: PoolInfo) -> PoolSummary {
    PoolSummary {
        name: pool.name,
        health: pool.health.unwrap_or_else(|| "UNKNOWN".to_string()),
        devices: pool.devices,
    }
}

/// Whole disks carrying a ZFS label on the disk or one of its partitions
fn backup_drives(devices: &[BlockDevice]) -> Vec<DriveInfo> {
    devices
        .iter()
        .filter(|d| d.kind == "disk" && d.has_zfs_member())
        .map(|d| DriveInfo {
            name: d.name.clone(),
            path: d.path.clone(),
            size: d.size,
            model: d.model.trim().to_string(),
            serial: d.serial.trim().to_string(),
            transport: d.transport.clone(),
        })
        .collect()
}

/// Snapshot of drives and pools for the status poller
///
/// Tool failures degrade to empty sections; the report itself always
/// succeeds.
pub async fn collect_status(ctx: &OperationContext) -> Result<StatusReport> {
    let matcher = PoolMatcher::from_context(ctx)?;

    let drives = match ctx.tools.block.block_devices().await {
        Ok(devices) => backup_drives(&devices),
        Err(e) => {
            warn!("Cannot list block devices: {}", e);
            Vec::new()
        }
    };

    let imported: Vec<PoolSummary> = match ctx.tools.pools.imported_pools().await {
        Ok(pools) => pools
            .into_iter()
            .filter(|p| matcher.matches(&p.name))
            .map(summarize)
            .collect(),
        Err(e) => {
            warn!("Cannot list imported pools: {}", e);
            Vec::new()
        }
    };

    let available: Vec<PoolSummary> = match ctx.tools.pools.importable_pools(None).await {
        Ok(pools) => pools
            .into_iter()
            .filter(|p| matcher.matches(&p.name))
            .map(summarize)
            .collect(),
        Err(e) => {
            warn!("Cannot scan for importable pools: {}", e);
            Vec::new()
        }
    };

    let state = if !imported.is_empty() {
        PoolState::Imported
    } else if !available.is_empty() {
        PoolState::Available
    } else {
        PoolState::NotAvailable
    };

    Ok(StatusReport {
        timestamp: Utc::now(),
        status: state.label().to_string(),
        has_drives: !drives.is_empty(),
        has_imported_pool: !imported.is_empty(),
        has_available_pool: !available.is_empty(),
        drives,
        imported_pools: imported,
        available_pools: available,
    })
}

/// Every agent of the system pool with its snapshot summary
pub async fn collect_metadata(ctx: &OperationContext) -> Result<MetadataReport> {
    let pool = locate_pool(ctx).await?;
    let pool = ensure_imported(ctx, pool).await?;
    let agents = load_agents(ctx, &pool.name).await?;

    let mut summaries = BTreeMap::new();
    for agent in agents {
        let latest = resolve_snapshots(ctx, &agent, SnapshotSelector::Latest)
            .await?
            .first()
            .map(|s| s.epoch);
        summaries.insert(
            agent.id.clone(),
            AgentSummary {
                name: agent.name,
                hostname: agent.hostname,
                os_type: agent.os_type,
                dataset: agent.dataset,
                snapshot_count: agent.snapshot_count,
                latest_snapshot: latest,
                volumes: agent.volumes,
            },
        );
    }

    Ok(MetadataReport {
        success: true,
        timestamp: Utc::now(),
        pool_name: pool.name,
        agent_count: summaries.len(),
        agents: summaries,
    })
}
