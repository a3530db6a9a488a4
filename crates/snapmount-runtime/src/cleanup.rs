//! Best-effort release of mounts, clones, loop devices and directories

use crate::clone::CloneManager;
use crate::context::OperationContext;
use crate::traits::MountEntry;
use snapmount_core::{Agent, CleanedResource, CleanupReport, CloneName, ResourceKind, IMAGE_SUFFIX};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Which agent's resources a sweep may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupScope {
    All,
    Agent {
        /// Dataset leaf name, used for clones, staging paths and loops
        id: String,
        /// Directory under the final mount root
        dir_name: String,
    },
}

impl CleanupScope {
    pub fn for_agent(agent: &Agent) -> Self {
        CleanupScope::Agent {
            id: agent.id.clone(),
            dir_name: agent.dir_name(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            CleanupScope::All => "all".to_string(),
            CleanupScope::Agent { id, .. } => id.clone(),
        }
    }

    fn final_root(&self, ctx: &OperationContext) -> PathBuf {
        match self {
            CleanupScope::All => ctx.settings.mount_root.clone(),
            CleanupScope::Agent { dir_name, .. } => ctx.settings.agent_mount_dir(dir_name),
        }
    }

    fn staging_root(&self, ctx: &OperationContext) -> PathBuf {
        match self {
            CleanupScope::All => ctx.settings.staging_root.clone(),
            CleanupScope::Agent { id, .. } => ctx.settings.agent_staging_dir(id),
        }
    }

    /// The shared roots themselves survive an all-agents sweep
    fn keeps_root(&self) -> bool {
        matches!(self, CleanupScope::All)
    }

    fn owns_clone(&self, clone: &CloneName) -> bool {
        match self {
            CleanupScope::All => true,
            CleanupScope::Agent { id, .. } => clone.agent_id() == id,
        }
    }

    fn owns_backing_file(&self, path: &Path) -> bool {
        if !path.to_string_lossy().ends_with(IMAGE_SUFFIX) {
            return false;
        }
        match self {
            CleanupScope::All => true,
            CleanupScope::Agent { id, .. } => path.components().any(|c| c.as_os_str() == id.as_str()),
        }
    }
}

/// Release every resource in `scope`
///
/// Steps run in dependency order: final mounts, clones, loop devices,
/// then directories. Nothing here returns an error; resources that could
/// not be released end up in `failed`.
pub async fn cleanup(ctx: &OperationContext, scope: &CleanupScope) -> CleanupReport {
    let mut report = CleanupReport {
        scope: scope.label(),
        ..Default::default()
    };

    unmount_final_mounts(ctx, scope, &mut report).await;
    destroy_clones(ctx, scope, &mut report).await;
    detach_loops(ctx, scope, &mut report).await;
    remove_directories(ctx, scope, &mut report).await;

    report.success = report.failed.is_empty();
    info!(
        "Cleanup of '{}' released {} resource(s), {} failure(s)",
        report.scope,
        report.cleaned.len(),
        report.failed.len()
    );
    report
}

async fn mount_table(ctx: &OperationContext, report: &mut CleanupReport) -> Option<Vec<MountEntry>> {
    match ctx.tools.mounts.mount_table().await {
        Ok(table) => Some(table),
        Err(e) => {
            warn!("Cannot read mount table: {}", e);
            report.failed.push(format!("mount table: {}", e));
            None
        }
    }
}

/// Mountpoints strictly under `root` (or at it, unless kept), deepest first
fn mounts_under(table: &[MountEntry], root: &Path, keep_root: bool) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = table
        .iter()
        .map(|m| m.mountpoint.clone())
        .filter(|p| p.starts_with(root) && !(keep_root && p == root))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    paths.sort_by_key(|p| (Reverse(p.components().count()), p.clone()));
    paths
}

async fn unmount_final_mounts(ctx: &OperationContext, scope: &CleanupScope, report: &mut CleanupReport) {
    let Some(table) = mount_table(ctx, report).await else {
        return;
    };
    let targets: Vec<PathBuf> = mounts_under(&table, &scope.final_root(ctx), scope.keeps_root())
        .into_iter()
        .filter(|p| !ctx.settings.is_staging_path(p))
        .collect();
    if targets.is_empty() {
        return;
    }

    let mounts = &ctx.tools.mounts;
    for path in &targets {
        if let Err(e) = mounts.unmount(path, false).await {
            debug!("umount {} failed ({}); forcing", path.display(), e);
            if let Err(e) = mounts.unmount(path, true).await {
                warn!("Forced unmount of {} failed: {}", path.display(), e);
            }
        }
    }
    ctx.settle().await;

    let Some(after) = mount_table(ctx, report).await else {
        return;
    };
    for path in targets {
        if after.iter().any(|m| m.mountpoint == path) {
            warn!("{} is still mounted", path.display());
            report.failed.push(path.display().to_string());
        } else {
            report
                .cleaned
                .push(CleanedResource::new(ResourceKind::Mount, path.display().to_string()));
        }
    }
}

async fn destroy_clones(ctx: &OperationContext, scope: &CleanupScope, report: &mut CleanupReport) {
    let pools = match ctx.tools.pools.imported_pools().await {
        Ok(pools) => pools,
        Err(e) => {
            warn!("Cannot list imported pools: {}", e);
            report.failed.push(format!("zpool list: {}", e));
            return;
        }
    };

    let manager = CloneManager::new(ctx);
    for pool in pools {
        let filesystems = match ctx.tools.pools.list_filesystems(&pool.name).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Cannot list datasets of {}: {}", pool.name, e);
                report.failed.push(format!("zfs list {}: {}", pool.name, e));
                continue;
            }
        };
        let clones = filesystems
            .iter()
            .filter_map(|name| CloneName::parse(name))
            .filter(|clone| scope.owns_clone(clone));
        for clone in clones {
            if manager.close(&clone).await {
                report
                    .cleaned
                    .push(CleanedResource::new(ResourceKind::Clone, clone.to_string()));
            } else {
                report.failed.push(clone.to_string());
            }
        }
    }
}

async fn detach_loops(ctx: &OperationContext, scope: &CleanupScope, report: &mut CleanupReport) {
    let loops = match ctx.tools.mounts.loop_devices().await {
        Ok(loops) => loops,
        Err(e) => {
            warn!("Cannot list loop devices: {}", e);
            report.failed.push(format!("losetup: {}", e));
            return;
        }
    };
    for device in loops.iter().filter(|l| scope.owns_backing_file(&l.backing_file)) {
        match ctx.tools.mounts.detach_loop(&device.device).await {
            Ok(()) => report
                .cleaned
                .push(CleanedResource::new(ResourceKind::LoopDevice, &device.device)),
            Err(e) => {
                warn!("Cannot detach {}: {}", device.device, e);
                report.failed.push(device.device.clone());
            }
        }
    }
}

async fn remove_directories(ctx: &OperationContext, scope: &CleanupScope, report: &mut CleanupReport) {
    let roots = [scope.final_root(ctx), scope.staging_root(ctx)];

    let Some(table) = mount_table(ctx, report).await else {
        return;
    };
    let mut lingering = false;
    for root in &roots {
        for path in mounts_under(&table, root, scope.keeps_root()) {
            warn!("{} still mounted before directory removal; forcing", path.display());
            lingering = true;
            match ctx.tools.mounts.unmount(&path, true).await {
                Ok(()) => report
                    .cleaned
                    .push(CleanedResource::new(ResourceKind::Mount, path.display().to_string())),
                Err(e) => {
                    warn!("Forced unmount of {} failed: {}", path.display(), e);
                    report.failed.push(path.display().to_string());
                }
            }
        }
    }
    if lingering {
        ctx.settle().await;
    }

    let Some(table) = mount_table(ctx, report).await else {
        return;
    };
    let mounted: HashSet<PathBuf> = table.into_iter().map(|m| m.mountpoint).collect();
    for root in &roots {
        for dir in remove_empty_dirs(root, !scope.keeps_root(), &mounted).await {
            report
                .cleaned
                .push(CleanedResource::new(ResourceKind::Directory, dir.display().to_string()));
        }
    }
}

/// Remove empty directories below `root` bottom-up, never entering mountpoints
async fn remove_empty_dirs(root: &Path, include_root: bool, mounted: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if mounted.contains(&dir) {
            continue;
        }
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                stack.push(entry.path());
            }
        }
        dirs.push(dir);
    }
    if !include_root {
        dirs.retain(|d| d != root);
    }
    dirs.sort_by_key(|d| Reverse(d.components().count()));

    let mut removed = Vec::new();
    for dir in dirs {
        if tokio::fs::remove_dir(&dir).await.is_ok() {
            removed.push(dir);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::mock_context;
    use crate::mock::MockSystem;
    use crate::volume::mount_volume;
    use snapmount_core::{PoolState, SnapshotName};

    const POOL: &str = "homePool";

    /// Mount one snapshot of `id` the way `mount` would
    async fn mount_agent_volume(ctx: &OperationContext, mock: &MockSystem, id: &str, host: &str) -> PathBuf {
        let dataset = format!("{}/home/agents/{}", POOL, id);
        mock.add_dataset(&dataset).await;
        mock.add_snapshots(&dataset, &[1000]).await;
        mock.set_images(&dataset, &["g1.datto"]).await;

        let open = CloneManager::new(ctx)
            .open(&SnapshotName::new(&dataset, 1000))
            .await
            .unwrap();
        let dest = ctx.settings.mount_root.join(host).join("1970-01-01_00-16-40").join("C");
        mount_volume(ctx, &open.image_path("g1.datto"), 1_048_576, "ntfs", &dest)
            .await
            .unwrap();
        dest
    }

    async fn setup() -> (tempfile::TempDir, MockSystem) {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool(POOL, PoolState::Imported).await;
        mock.add_dataset("homePool/home").await;
        mock.add_dataset("homePool/home/agents").await;
        (tmp, mock)
    }

    #[tokio::test]
    async fn test_cleanup_all_releases_everything() {
        let (tmp, mock) = setup().await;
        let ctx = mock_context(&mock, tmp.path());
        let dest = mount_agent_volume(&ctx, &mock, "abc", "server1").await;

        let report = cleanup(&ctx, &CleanupScope::All).await;

        assert!(report.success, "{:?}", report.failed);
        assert_eq!(report.scope, "all");
        assert!(report
            .cleaned
            .contains(&CleanedResource::new(ResourceKind::Mount, dest.display().to_string())));
        assert!(report
            .cleaned
            .iter()
            .any(|c| c.kind == ResourceKind::Clone && c.target.ends_with("abc-snapmount-4242-1000")));
        assert!(mock.mounts().await.is_empty());
        assert!(mock.loops().await.is_empty());
        assert!(!mock.datasets().await.iter().any(|d| CloneName::is_clone_name(d)));
        assert!(!ctx.settings.mount_root.join("server1").exists());
        assert!(ctx.settings.mount_root.exists());
        assert!(!ctx.settings.staging_root.join("abc").exists());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (tmp, mock) = setup().await;
        let ctx = mock_context(&mock, tmp.path());
        mount_agent_volume(&ctx, &mock, "abc", "server1").await;

        let first = cleanup(&ctx, &CleanupScope::All).await;
        assert!(!first.cleaned.is_empty());

        let second = cleanup(&ctx, &CleanupScope::All).await;
        assert!(second.success);
        assert!(second.cleaned.is_empty(), "{:?}", second.cleaned);
    }

    #[tokio::test]
    async fn test_agent_scope_leaves_other_agents_alone() {
        let (tmp, mock) = setup().await;
        let ctx = mock_context(&mock, tmp.path());
        let dest_a = mount_agent_volume(&ctx, &mock, "aaa", "alpha").await;
        let dest_b = mount_agent_volume(&ctx, &mock, "bbb", "beta").await;

        let scope = CleanupScope::Agent {
            id: "aaa".to_string(),
            dir_name: "alpha".to_string(),
        };
        let report = cleanup(&ctx, &scope).await;

        assert!(report.success);
        for cleaned in &report.cleaned {
            assert!(
                cleaned.target.contains("aaa") || cleaned.target.contains("alpha"),
                "{:?} does not belong to agent aaa",
                cleaned
            );
        }
        assert!(!mock.is_mounted(&dest_a).await);
        assert!(mock.is_mounted(&dest_b).await);
        assert!(mock.has_dataset("homePool/home/agents/bbb-snapmount-4242-1000").await);
        assert!(!mock.has_dataset("homePool/home/agents/aaa-snapmount-4242-1000").await);
        assert_eq!(mock.loops().await.len(), 1);
        assert!(dest_b.exists());
    }

    #[tokio::test]
    async fn test_stuck_mount_is_forced() {
        let (tmp, mock) = setup().await;
        let ctx = mock_context(&mock, tmp.path());
        let dest = mount_agent_volume(&ctx, &mock, "abc", "server1").await;
        mock.stick_mount(&dest).await;

        let report = cleanup(&ctx, &CleanupScope::All).await;

        assert!(report.success);
        assert!(!mock.is_mounted(&dest).await);
        assert!(mock
            .commands()
            .await
            .contains(&format!("umount {} force=true", dest.display())));
    }

    #[tokio::test]
    async fn test_unreleasable_clone_is_reported_and_sweep_continues() {
        let (tmp, mock) = setup().await;
        let ctx = mock_context(&mock, tmp.path());
        mount_agent_volume(&ctx, &mock, "aaa", "alpha").await;
        mount_agent_volume(&ctx, &mock, "bbb", "beta").await;
        let stuck = "homePool/home/agents/aaa-snapmount-4242-1000";
        mock.make_undestroyable(stuck).await;
        mock.add_loop("/dev/loop7", Path::new("/var/tmp/snapmount-staging/bbb/x/g1.datto"))
            .await;

        let report = cleanup(&ctx, &CleanupScope::All).await;

        assert!(!report.success);
        assert_eq!(report.failed, vec![stuck.to_string()]);
        assert!(mock.has_dataset(stuck).await);
        // later steps still ran for everything else
        assert!(!mock.has_dataset("homePool/home/agents/bbb-snapmount-4242-1000").await);
        assert!(report
            .cleaned
            .contains(&CleanedResource::new(ResourceKind::LoopDevice, "/dev/loop7")));
        assert!(mock.loops().await.is_empty());
        assert!(mock.mounts().await.is_empty());
        assert!(!ctx.settings.mount_root.join("alpha").exists());
        assert!(!ctx.settings.mount_root.join("beta").exists());
        assert!(!ctx.settings.staging_root.join("bbb").exists());
    }

    #[tokio::test]
    async fn test_lingering_staging_mount_is_forced_before_removal() {
        let (tmp, mock) = setup().await;
        let ctx = mock_context(&mock, tmp.path());
        let leftover = ctx.settings.staging_root.join("abc").join("leftover");
        std::fs::create_dir_all(&leftover).unwrap();
        mock.add_mount(MountEntry {
            source: "tmpfs".to_string(),
            mountpoint: leftover.clone(),
            fstype: "tmpfs".to_string(),
            options: vec!["rw".to_string()],
        })
        .await;
        mock.stick_mount(&leftover).await;

        let report = cleanup(&ctx, &CleanupScope::All).await;

        assert!(report.success, "{:?}", report.failed);
        assert!(report
            .cleaned
            .contains(&CleanedResource::new(ResourceKind::Mount, leftover.display().to_string())));
        assert!(!mock.is_mounted(&leftover).await);
        let commands = mock.commands().await;
        assert!(commands.contains(&format!("umount {} force=true", leftover.display())));
        assert!(!commands.contains(&format!("umount {} force=false", leftover.display())));
        assert!(!leftover.exists());
        assert!(!ctx.settings.staging_root.join("abc").exists());
        assert!(ctx.settings.staging_root.exists());
    }

    #[tokio::test]
    async fn test_orphaned_loop_is_detached() {
        let (tmp, mock) = setup().await;
        let ctx = mock_context(&mock, tmp.path());
        mock.add_loop("/dev/loop7", Path::new("/var/tmp/snapmount-staging/abc/x/g1.datto"))
            .await;
        mock.add_loop("/dev/loop8", Path::new("/srv/vm/disk.img")).await;

        let report = cleanup(&ctx, &CleanupScope::All).await;

        assert!(report
            .cleaned
            .contains(&CleanedResource::new(ResourceKind::LoopDevice, "/dev/loop7")));
        let loops = mock.loops().await;
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].device, "/dev/loop8");
    }
}
