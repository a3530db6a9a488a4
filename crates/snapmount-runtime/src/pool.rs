//! Pool discovery plus import/export of backup pools

use crate::cleanup::{cleanup, CleanupScope};
use crate::context::OperationContext;
use crate::error::{Result, RuntimeError};
use regex::Regex;
use snapmount_core::{PoolActionRecord, PoolActionReport, PoolInfo, PoolState};
use tracing::{info, warn};

/// Decides which pools belong to this system
pub struct PoolMatcher {
    exact: Option<String>,
    pattern: Regex,
    match_all: bool,
}

impl PoolMatcher {
    pub fn from_context(ctx: &OperationContext) -> Result<Self> {
        Ok(Self {
            exact: ctx
                .settings
                .pool_name
                .clone()
                .filter(|n| !n.trim().is_empty()),
            pattern: ctx.settings.pool_regex()?,
            match_all: false,
        })
    }

    /// Matcher for import/export, where `EXPORT_ALL` lifts name filtering
    pub fn for_transfer(ctx: &OperationContext) -> Result<Self> {
        let mut matcher = Self::from_context(ctx)?;
        matcher.match_all = ctx.settings.export_all;
        Ok(matcher)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.match_all || self.exact.as_deref() == Some(name) || self.pattern.is_match(name)
    }

    fn describe(&self) -> String {
        match &self.exact {
            Some(name) => format!("POOL_NAME={}, pattern {}", name, self.pattern.as_str()),
            None => format!("pattern {}", self.pattern.as_str()),
        }
    }
}

/// Imported pools first, then importable ones
async fn known_pools(ctx: &OperationContext) -> Result<Vec<PoolInfo>> {
    let mut pools = ctx.tools.pools.imported_pools().await?;
    match ctx.tools.pools.importable_pools(None).await {
        Ok(importable) => {
            let extra: Vec<PoolInfo> = importable
                .into_iter()
                .filter(|p| !pools.iter().any(|known| known.name == p.name))
                .collect();
            pools.extend(extra);
        }
        Err(e) => warn!("Could not scan for importable pools: {}", e),
    }
    Ok(pools)
}

/// Find the single pool this system operates on
///
/// An exact `POOL_NAME` override wins when that pool is known; otherwise the
/// pattern decides and the first matching pool (imported before importable)
/// is returned.
pub async fn locate_pool(ctx: &OperationContext) -> Result<PoolInfo> {
    let matcher = PoolMatcher::from_context(ctx)?;
    let pools = known_pools(ctx).await?;

    if let Some(name) = &matcher.exact {
        if let Some(pool) = pools.iter().find(|p| &p.name == name) {
            info!("Using pool '{}' from POOL_NAME", pool.name);
            return Ok(pool.clone());
        }
        warn!(
            "POOL_NAME '{}' not found among known pools; falling back to pattern search",
            name
        );
    }

    pools
        .into_iter()
        .find(|p| matcher.pattern.is_match(&p.name))
        .inspect(|p| info!("Located pool '{}' ({})", p.name, p.state))
        .ok_or_else(|| RuntimeError::pool_not_found(matcher.describe()))
}

/// Re-query whether a pool is imported
async fn is_imported(ctx: &OperationContext, pool: &str) -> Result<bool> {
    Ok(ctx
        .tools
        .pools
        .imported_pools()
        .await?
        .iter()
        .any(|p| p.name == pool))
}

/// Import a pool, retrying with forced recovery only if the fast path fails
async fn import_one(ctx: &OperationContext, pool: &PoolInfo, device: Option<&str>) -> PoolActionRecord {
    let device_label = device
        .map(str::to_string)
        .or_else(|| pool.devices.first().cloned())
        .unwrap_or_default();
    let mut record = PoolActionRecord {
        pool: pool.name.clone(),
        device: device_label,
        success: false,
        message: String::new(),
    };

    let pools = &ctx.tools.pools;
    let mut attempt = pools.import_pool(&pool.name, device, false).await;
    if let Err(e) = &attempt {
        warn!(
            "Import of '{}' failed ({}); retrying with forced recovery",
            pool.name, e
        );
        attempt = pools.import_pool(&pool.name, device, true).await;
    }

    match (attempt, is_imported(ctx, &pool.name).await) {
        (Ok(()), Ok(true)) => {
            record.success = true;
            record.message = format!("Pool '{}' imported", pool.name);
        }
        (Ok(()), Ok(false)) => {
            record.message = format!("Pool '{}' did not appear after import", pool.name);
        }
        (Err(e), _) | (Ok(()), Err(e)) => {
            record.message = format!("Failed to import '{}': {}", pool.name, e);
        }
    }
    record
}

/// Make sure a located pool is imported before its datasets are used
pub async fn ensure_imported(ctx: &OperationContext, pool: PoolInfo) -> Result<PoolInfo> {
    if pool.state == PoolState::Imported {
        return Ok(pool);
    }
    ctx.progress(format!("Importing pool {}...", pool.name));
    let record = import_one(ctx, &pool, None).await;
    if !record.success {
        return Err(RuntimeError::zfs_error(record.message));
    }
    Ok(PoolInfo {
        state: PoolState::Imported,
        ..pool
    })
}

/// `pool import [device]`
pub async fn import_pools(ctx: &OperationContext, device: Option<&str>) -> Result<PoolActionReport> {
    let matcher = PoolMatcher::for_transfer(ctx)?;
    let candidates: Vec<PoolInfo> = ctx
        .tools
        .pools
        .importable_pools(device)
        .await?
        .into_iter()
        .filter(|p| matcher.matches(&p.name))
        .collect();

    if let Some(dev) = device {
        let Some(pool) = candidates.first() else {
            return Ok(PoolActionReport::Single {
                success: false,
                pool: String::new(),
                message: format!("No importable pool matching {} on {}", matcher.describe(), dev),
            });
        };
        ctx.progress(format!("Importing {} from {}...", pool.name, dev));
        let record = import_one(ctx, pool, Some(dev)).await;
        return Ok(PoolActionReport::Single {
            success: record.success,
            pool: record.pool,
            message: record.message,
        });
    }

    if candidates.is_empty() {
        info!("No importable pools matching {}", matcher.describe());
    }
    let mut records = Vec::new();
    for pool in &candidates {
        ctx.progress(format!("Importing {}...", pool.name));
        let record = import_one(ctx, pool, None).await;
        ctx.progress(&record.message);
        records.push(record);
    }
    Ok(PoolActionReport::Batch {
        success: !records.is_empty() && records.iter().all(|r| r.success),
        pools: records,
    })
}

/// Export a pool, escalating to a forced export if it reports busy
async fn export_one(ctx: &OperationContext, pool: &PoolInfo) -> PoolActionRecord {
    let mut record = PoolActionRecord {
        pool: pool.name.clone(),
        device: pool.devices.first().cloned().unwrap_or_default(),
        success: false,
        message: String::new(),
    };

    let pools = &ctx.tools.pools;
    let mut attempt = pools.export_pool(&pool.name, false).await;
    if let Err(e) = &attempt {
        warn!("Export of '{}' failed ({}); forcing", pool.name, e);
        ctx.settle().await;
        attempt = pools.export_pool(&pool.name, true).await;
    }

    match (attempt, is_imported(ctx, &pool.name).await) {
        (Ok(()), Ok(false)) => {
            record.success = true;
            record.message = format!("Pool '{}' exported", pool.name);
        }
        (Ok(()), Ok(true)) => {
            record.message = format!("Pool '{}' is still imported after export", pool.name);
        }
        (Err(e), _) | (Ok(()), Err(e)) => {
            record.message = format!("Failed to export '{}': {}", pool.name, e);
        }
    }
    record
}

/// `pool export [device]`
///
/// Runs an all-agents cleanup first; a pool with mounted clones cannot be
/// exported.
pub async fn export_pools(ctx: &OperationContext, device: Option<&str>) -> Result<PoolActionReport> {
    let matcher = PoolMatcher::for_transfer(ctx)?;
    let candidates: Vec<PoolInfo> = ctx
        .tools
        .pools
        .imported_pools()
        .await?
        .into_iter()
        .filter(|p| matcher.matches(&p.name))
        .filter(|p| device.map(|d| p.uses_device(d)).unwrap_or(true))
        .collect();

    if !candidates.is_empty() {
        let swept = cleanup(ctx, &CleanupScope::All).await;
        info!("Pre-export cleanup released {} resource(s)", swept.cleaned.len());
    }

    if let Some(dev) = device {
        let Some(pool) = candidates.first() else {
            return Ok(PoolActionReport::Single {
                success: false,
                pool: String::new(),
                message: format!("No imported pool matching {} uses {}", matcher.describe(), dev),
            });
        };
        ctx.progress(format!("Exporting {}...", pool.name));
        let record = export_one(ctx, pool).await;
        return Ok(PoolActionReport::Single {
            success: record.success,
            pool: record.pool,
            message: record.message,
        });
    }

    let mut records = Vec::new();
    for pool in &candidates {
        ctx.progress(format!("Exporting {}...", pool.name));
        let record = export_one(ctx, pool).await;
        ctx.progress(&record.message);
        records.push(record);
    }
    Ok(PoolActionReport::Batch {
        success: !records.is_empty() && records.iter().all(|r| r.success),
        pools: records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::mock_context;
    use crate::mock::MockSystem;

    #[tokio::test]
    async fn test_locate_prefers_imported_match() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("rpool", PoolState::Imported).await;
        mock.add_pool("datto-offsite", PoolState::Available).await;
        mock.add_pool("homePool", PoolState::Imported).await;
        let ctx = mock_context(&mock, tmp.path());

        let pool = locate_pool(&ctx).await.unwrap();
        assert_eq!(pool.name, "homePool");
        assert_eq!(pool.state, PoolState::Imported);
    }

    #[tokio::test]
    async fn test_known_pools_lists_imported_then_importable() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("datto-offsite", PoolState::Available).await;
        mock.add_pool("homePool", PoolState::Imported).await;
        let ctx = mock_context(&mock, tmp.path());

        let names: Vec<String> = known_pools(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["homePool", "datto-offsite"]);
    }

    #[tokio::test]
    async fn test_locate_exact_override() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("homePool", PoolState::Imported).await;
        mock.add_pool("tank", PoolState::Available).await;
        let mut ctx = mock_context(&mock, tmp.path());
        ctx.settings.pool_name = Some("tank".to_string());

        assert_eq!(locate_pool(&ctx).await.unwrap().name, "tank");
    }

    #[tokio::test]
    async fn test_missing_override_falls_back_to_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("homePool", PoolState::Imported).await;
        let mut ctx = mock_context(&mock, tmp.path());
        ctx.settings.pool_name = Some("gone".to_string());

        assert_eq!(locate_pool(&ctx).await.unwrap().name, "homePool");
    }

    #[tokio::test]
    async fn test_no_match_is_pool_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("rpool", PoolState::Imported).await;
        let ctx = mock_context(&mock, tmp.path());

        assert!(matches!(
            locate_pool(&ctx).await.unwrap_err(),
            RuntimeError::PoolNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_import_retries_with_forced_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("datto-1", PoolState::Available).await;
        mock.fail_fast_import("datto-1").await;
        let ctx = mock_context(&mock, tmp.path());

        let report = import_pools(&ctx, None).await.unwrap();
        assert!(report.success());
        assert_eq!(mock.pool_state("datto-1").await, Some(PoolState::Imported));
        assert_eq!(
            mock.commands().await,
            vec![
                "zpool import datto-1 recovery=false".to_string(),
                "zpool import datto-1 recovery=true".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_import_skips_foreign_pools_unless_export_all() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("tank", PoolState::Available).await;
        let mut ctx = mock_context(&mock, tmp.path());

        let report = import_pools(&ctx, None).await.unwrap();
        assert!(!report.success());
        assert_eq!(mock.pool_state("tank").await, Some(PoolState::Available));

        ctx.settings.export_all = true;
        let report = import_pools(&ctx, None).await.unwrap();
        assert!(report.success());
        assert_eq!(mock.pool_state("tank").await, Some(PoolState::Imported));
    }

    #[tokio::test]
    async fn test_single_device_import_and_export() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("datto-a", PoolState::Available).await;
        mock.set_pool_devices("datto-a", &["sdb1"]).await;
        mock.add_pool("datto-b", PoolState::Available).await;
        mock.set_pool_devices("datto-b", &["sdc1"]).await;
        let ctx = mock_context(&mock, tmp.path());

        let report = import_pools(&ctx, Some("/dev/sdc")).await.unwrap();
        match report {
            PoolActionReport::Single { success, pool, .. } => {
                assert!(success);
                assert_eq!(pool, "datto-b");
            }
            other => panic!("unexpected report: {:?}", other),
        }
        assert_eq!(mock.pool_state("datto-a").await, Some(PoolState::Available));

        let report = export_pools(&ctx, Some("/dev/sdc")).await.unwrap();
        assert!(report.success());
        assert_eq!(mock.pool_state("datto-b").await, Some(PoolState::Available));
    }
}
