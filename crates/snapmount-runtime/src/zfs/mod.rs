pub mod parse;

use crate::command::{exec, exec_unchecked};
use crate::error::{Result, RuntimeError};
use crate::traits::PoolManager;
use async_trait::async_trait;
use parse::{parse_name_list, parse_property_value, parse_zpool_import, parse_zpool_list};
use snapmount_core::PoolInfo;
use std::path::Path;
use tracing::{debug, info};

/// `zpool`/`zfs` backed pool manager
pub struct ZfsPoolManager;

impl ZfsPoolManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZfsPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolManager for ZfsPoolManager {
    async fn imported_pools(&self) -> Result<Vec<PoolInfo>> {
        let output = exec("zpool", &["list", "-H", "-v", "-P", "-o", "name,health"]).await?;
        Ok(parse_zpool_list(&output.stdout))
    }

    async fn importable_pools(&self, device: Option<&str>) -> Result<Vec<PoolInfo>> {
        let mut args = vec!["import"];
        if let Some(dev) = device {
            args.extend(["-d", dev]);
        }
        let output = exec_unchecked("zpool", &args).await?;
        let pools = parse_zpool_import(&output.stdout);

        // `zpool import` exits non-zero when there is nothing to import
        if !output.success() && pools.is_empty() {
            if output.message().contains("no pools available") {
                return Ok(Vec::new());
            }
            return Err(RuntimeError::command_failed(
                format!("zpool {}", args.join(" ")),
                output.exit_code,
                output.message(),
            ));
        }
        Ok(pools)
    }

    async fn import_pool(
        &self,
        pool: &str,
        device: Option<&str>,
        force_recovery: bool,
    ) -> Result<()> {
        let mut args = vec!["import", "-f"];
        if force_recovery {
            args.push("-F");
        }
        if let Some(dev) = device {
            args.extend(["-d", dev]);
        }
        args.push(pool);
        info!("Importing pool {} (recovery: {})", pool, force_recovery);
        exec("zpool", &args).await?;
        Ok(())
    }

    async fn export_pool(&self, pool: &str, force: bool) -> Result<()> {
        let mut args = vec!["export"];
        if force {
            args.push("-f");
        }
        args.push(pool);
        info!("Exporting pool {} (force: {})", pool, force);
        exec("zpool", &args).await?;
        Ok(())
    }

    async fn list_children(&self, dataset: &str) -> Result<Vec<String>> {
        let output = exec(
            "zfs",
            &["list", "-H", "-o", "name", "-t", "filesystem", "-d", "1", dataset],
        )
        .await?;
        Ok(parse_name_list(&output.stdout)
            .into_iter()
            .filter(|name| name != dataset)
            .collect())
    }

    async fn list_filesystems(&self, pool: &str) -> Result<Vec<String>> {
        let output = exec(
            "zfs",
            &["list", "-H", "-o", "name", "-t", "filesystem", "-r", pool],
        )
        .await?;
        Ok(parse_name_list(&output.stdout))
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let output = exec(
            "zfs",
            &[
                "list", "-H", "-o", "name", "-t", "snapshot", "-s", "creation", "-d", "1",
                dataset,
            ],
        )
        .await?;
        Ok(parse_name_list(&output.stdout))
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let output = exec_unchecked("zfs", &["list", "-H", "-o", "name", dataset]).await?;
        Ok(output.success())
    }

    async fn get_property(&self, dataset: &str, property: &str) -> Result<Option<String>> {
        let output = exec_unchecked("zfs", &["get", "-H", "-o", "value", property, dataset]).await?;
        if !output.success() {
            debug!("zfs get {} {} failed: {}", property, dataset, output.message());
            return Ok(None);
        }
        Ok(parse_property_value(&output.stdout))
    }

    async fn clone_snapshot(&self, snapshot: &str, clone: &str, mountpoint: &Path) -> Result<()> {
        let property = format!("mountpoint={}", mountpoint.display());
        exec("zfs", &["clone", "-o", &property, snapshot, clone])
            .await
            .map_err(|e| RuntimeError::zfs_error(format!("clone {} -> {}: {}", snapshot, clone, e)))?;
        info!("ZFS clone created: {}", clone);
        Ok(())
    }

    async fn mount_dataset(&self, dataset: &str) -> Result<()> {
        exec("zfs", &["mount", dataset]).await?;
        Ok(())
    }

    async fn unmount_dataset(&self, dataset: &str, force: bool) -> Result<()> {
        let mut args = vec!["unmount"];
        if force {
            args.push("-f");
        }
        args.push(dataset);
        exec("zfs", &args).await?;
        Ok(())
    }

    async fn destroy_dataset(&self, dataset: &str, recursive: bool) -> Result<()> {
        let args: Vec<&str> = if recursive {
            vec!["destroy", "-R", "-f", dataset]
        } else {
            vec!["destroy", "-f", dataset]
        };
        exec("zfs", &args).await?;
        info!("ZFS dataset destroyed: {}", dataset);
        Ok(())
    }
}
