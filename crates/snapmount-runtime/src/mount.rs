//! `mount`: resolve an agent's snapshots and expose their volumes read-only

use crate::catalog::{find_agent, load_agents};
use crate::cleanup::{cleanup, CleanupScope};
use crate::clone::{CloneManager, OpenClone};
use crate::context::OperationContext;
use crate::error::{Result, RuntimeError};
use crate::partition::resolve_offset;
use crate::pool::{ensure_imported, locate_pool};
use crate::snapshot::resolve_snapshots;
use crate::volume::mount_volume;
use snapmount_core::{
    format_snapshot_date, Agent, CleanupReport, MountReport, MountStatus, SnapshotMountRecord,
    SnapshotName, SnapshotSelector, VolumeMountRecord, VolumeSpec, IMAGE_SUFFIX,
};
use std::collections::HashSet;
use std::path::Path;
use tracing::{error, info, warn};

/// Hint given to volumes found on disk rather than in metadata
const DISCOVERED_FS_HINT: &str = "ntfs";

async fn locate_agent(ctx: &OperationContext, agent_ref: &str) -> Result<Agent> {
    let pool = locate_pool(ctx).await?;
    let pool = ensure_imported(ctx, pool).await?;
    let agents = load_agents(ctx, &pool.name).await?;
    find_agent(&agents, agent_ref).cloned()
}

/// Mount the selected snapshots of one agent
///
/// Pool, agent and snapshot resolution failures abort the whole run.
/// Once snapshots are known, every failure is recorded per snapshot or
/// per volume and the batch always completes.
pub async fn mount_agent(
    ctx: &mut OperationContext,
    agent_ref: &str,
    selector: SnapshotSelector,
) -> Result<MountReport> {
    let agent = locate_agent(ctx, agent_ref).await?;
    info!("Agent '{}' resolved to dataset {}", agent_ref, agent.dataset);

    let snapshots = resolve_snapshots(ctx, &agent, selector).await?;
    if snapshots.is_empty() {
        return Err(RuntimeError::no_snapshots_found(agent_ref, &agent.dataset));
    }

    ctx.progress(format!("Cleaning up previous mounts of {}...", agent_ref));
    let swept = cleanup(ctx, &CleanupScope::for_agent(&agent)).await;
    if !swept.failed.is_empty() {
        warn!("Pre-mount cleanup left {} resource(s) behind", swept.failed.len());
    }

    for snapshot in &snapshots {
        ctx.progress(format!("Mounting {}...", snapshot));
        let record = mount_snapshot(ctx, &agent, snapshot).await;
        match &record.error {
            None => ctx.progress(format!("  mounted at {}", record.final_mount)),
            Some(e) => ctx.progress(format!("  failed: {}", e)),
        }
        ctx.record(record);
    }

    Ok(MountReport::from_records(agent_ref, ctx.take_records()))
}

/// Clone one snapshot and mount each of its volumes
pub async fn mount_snapshot(
    ctx: &OperationContext,
    agent: &Agent,
    snapshot: &SnapshotName,
) -> SnapshotMountRecord {
    let date = format_snapshot_date(snapshot.epoch);
    let final_mount = ctx.settings.agent_mount_dir(&agent.dir_name()).join(&date);
    let mut record = SnapshotMountRecord {
        snapshot: snapshot.to_string(),
        epoch: snapshot.epoch,
        date,
        zfs_clone: String::new(),
        temp_mount: String::new(),
        final_mount: final_mount.display().to_string(),
        status: MountStatus::Failed,
        error: None,
        volumes: Vec::new(),
    };

    let manager = CloneManager::new(ctx);
    let clone = match manager.open(snapshot).await {
        Ok(clone) => clone,
        Err(e) => {
            warn!("Skipping {}: {}", snapshot, e);
            record.error = Some(e.to_string());
            return record;
        }
    };
    record.zfs_clone = clone.name.to_string();
    record.temp_mount = clone.mountpoint.display().to_string();

    let volumes = match volumes_for(agent, &clone).await {
        Ok(volumes) if !volumes.is_empty() => volumes,
        Ok(_) => {
            record.error = Some(format!("no {} images found in {}", IMAGE_SUFFIX, snapshot));
            manager.close(&clone.name).await;
            return record;
        }
        Err(e) => {
            record.error = Some(e.to_string());
            manager.close(&clone.name).await;
            return record;
        }
    };

    let mut labels = HashSet::new();
    for volume in &volumes {
        let dest = final_mount.join(unique_label(volume.label(), &mut labels));
        let mut volume_record = VolumeMountRecord::pending(volume, dest.display().to_string());
        match mount_one(ctx, &clone, volume, &dest).await {
            Ok(()) => volume_record.status = MountStatus::Mounted,
            Err(e) => {
                if e.is_item_level() {
                    warn!("Volume {} of {} failed: {}", volume.guid, snapshot, e);
                } else {
                    error!("Volume {} of {} hit a system error: {}", volume.guid, snapshot, e);
                }
                volume_record.fail(e.to_string());
                let _ = tokio::fs::remove_dir(&dest).await;
            }
        }
        record.volumes.push(volume_record);
    }

    if record.volumes.iter().any(|v| v.status == MountStatus::Mounted) {
        record.status = MountStatus::Mounted;
    } else {
        record.error = Some("no volume could be mounted".to_string());
        manager.close(&clone.name).await;
        let _ = tokio::fs::remove_dir(&final_mount).await;
    }
    record
}

async fn mount_one(
    ctx: &OperationContext,
    clone: &OpenClone,
    volume: &VolumeSpec,
    dest: &Path,
) -> Result<()> {
    let image = clone.image_path(&volume.image_file_name());
    if !tokio::fs::try_exists(&image).await.unwrap_or(false) {
        return Err(RuntimeError::image_missing(image));
    }
    let offset = resolve_offset(ctx, &image).await?;
    mount_volume(ctx, &image, offset, &volume.filesystem, dest).await
}

/// Volumes from metadata, or the `.datto` files present in the clone
async fn volumes_for(agent: &Agent, clone: &OpenClone) -> Result<Vec<VolumeSpec>> {
    if !agent.volumes.is_empty() {
        return Ok(agent.volumes.clone());
    }

    let mut entries = tokio::fs::read_dir(&clone.mountpoint)
        .await
        .map_err(|e| RuntimeError::io(&clone.mountpoint, e))?;
    let mut guids = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| RuntimeError::io(&clone.mountpoint, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(guid) = name.strip_suffix(IMAGE_SUFFIX).filter(|g| !g.is_empty()) {
            guids.push(guid.to_string());
        }
    }
    guids.sort();
    info!("Discovered {} volume image(s) in {}", guids.len(), clone.mountpoint.display());
    Ok(guids
        .into_iter()
        .map(|guid| VolumeSpec::new(guid, "", DISCOVERED_FS_HINT))
        .collect())
}

/// Suffix repeated labels so two volumes never share a mount path
fn unique_label(label: String, used: &mut HashSet<String>) -> String {
    let mut candidate = label.clone();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}_{}", label, n);
        n += 1;
    }
    candidate
}

/// Scope for `mount --cleanup[=AGENT]`; `all` or no reference sweeps everything
pub async fn resolve_cleanup_scope(
    ctx: &OperationContext,
    agent_ref: Option<&str>,
) -> Result<CleanupScope> {
    match agent_ref {
        None | Some("all") => Ok(CleanupScope::All),
        Some(agent_ref) => Ok(CleanupScope::for_agent(&locate_agent(ctx, agent_ref).await?)),
    }
}

/// `mount --cleanup[=AGENT]`
pub async fn cleanup_agent(ctx: &OperationContext, agent_ref: Option<&str>) -> Result<CleanupReport> {
    let scope = resolve_cleanup_scope(ctx, agent_ref).await?;
    ctx.progress(format!("Cleaning up {}...", scope.label()));
    Ok(cleanup(ctx, &scope).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::mock_context;
    use crate::mock::MockSystem;
    use snapmount_core::{to_json, BatchStatus, CloneName, PoolState};
    use std::path::PathBuf;

    const AGENT: &str = "homePool/home/agents/abc";
    const GPT: &str = "\
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 512 bytes
Disklabel type: gpt

Device     Start      End  Sectors Size Type
{image}1    2048 83884031 83881984  40G Microsoft basic data
";

    /// Pool with agent `abc` (hostname `server1`) backed up at `epochs`
    async fn setup(epochs: &[i64], info: Option<&str>) -> (tempfile::TempDir, MockSystem) {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.add_pool("homePool", PoolState::Imported).await;
        mock.add_dataset("homePool/home").await;
        mock.add_dataset("homePool/home/agents").await;
        mock.add_dataset(AGENT).await;
        mock.add_snapshots(AGENT, epochs).await;
        mock.set_images(AGENT, &["g1.datto"]).await;
        mock.set_partition_table(GPT).await;

        if let Some(info) = info {
            let live = tmp.path().join("live/abc");
            std::fs::create_dir_all(&live).unwrap();
            std::fs::write(live.join("abc.agentInfo"), info).unwrap();
            mock.set_dataset_property(AGENT, "mountpoint", &live.to_string_lossy())
                .await;
        }
        (tmp, mock)
    }

    const SERVER1: &str = r#"{
        "hostname": "server1",
        "displayName": "Server One",
        "osType": "windows",
        "volumes": [{"guid": "g1", "mountpoint": "C:\\", "filesystem": "ntfs"}]
    }"#;

    fn date_dir(root: &Path, epoch: i64) -> PathBuf {
        root.join("mnt/server1").join(format_snapshot_date(epoch))
    }

    #[tokio::test]
    async fn test_mount_closest_snapshot_end_to_end() {
        let (tmp, mock) = setup(&[1000, 2000], Some(SERVER1)).await;
        let mut ctx = mock_context(&mock, tmp.path());

        let report = mount_agent(&mut ctx, "server1", SnapshotSelector::Closest(1500))
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&to_json(&report).unwrap()).unwrap();

        // equidistant: the earlier snapshot wins
        assert_eq!(json["status"], "success");
        assert_eq!(json["mounts"].as_array().unwrap().len(), 1);
        assert!(json["mounts"][0]["snapshot"].as_str().unwrap().ends_with("@1000"));
        assert_eq!(json["mounts"][0]["date"], "1970-01-01_00-16-40");

        let dest = date_dir(tmp.path(), 1000).join("C");
        assert_eq!(json["mounts"][0]["volumes"][0]["status"], "mounted");
        assert_eq!(
            json["mounts"][0]["volumes"][0]["mount_path"],
            dest.display().to_string()
        );
        assert!(mock.is_mounted(&dest).await);
        assert!(!mock.is_writable(&dest.join("new-file.txt")).await);
        assert!(mock
            .commands()
            .await
            .iter()
            .any(|c| c.contains("offset=1048576")));
    }

    #[tokio::test]
    async fn test_mount_picks_nearer_snapshot() {
        let (tmp, mock) = setup(&[1000, 2000], Some(SERVER1)).await;
        let mut ctx = mock_context(&mock, tmp.path());

        let report = mount_agent(&mut ctx, "server1", SnapshotSelector::Closest(1600))
            .await
            .unwrap();
        assert_eq!(report.mounts.len(), 1);
        assert_eq!(report.mounts[0].snapshot, format!("{}@2000", AGENT));
    }

    #[tokio::test]
    async fn test_partial_batch() {
        let (tmp, mock) = setup(&[3000, 1000, 2000], Some(SERVER1)).await;
        mock.fail_clone_mount_silently(2000).await;
        let mut ctx = mock_context(&mock, tmp.path());

        let report = mount_agent(&mut ctx, "abc", SnapshotSelector::All).await.unwrap();

        assert_eq!(report.status, BatchStatus::Partial);
        assert_eq!(report.mounts.len(), 3);
        let epochs: Vec<i64> = report.mounts.iter().map(|m| m.epoch).collect();
        assert_eq!(epochs, vec![1000, 2000, 3000]);

        let failed = &report.mounts[1];
        assert_eq!(failed.status, MountStatus::Failed);
        assert!(failed.error.is_some());
        assert!(failed.volumes.is_empty());
        assert_eq!(
            report.mounts.iter().filter(|m| !m.volumes.is_empty()).count(),
            2
        );
        assert!(mock.is_mounted(&date_dir(tmp.path(), 3000).join("C")).await);
    }

    #[tokio::test]
    async fn test_volumes_discovered_without_metadata() {
        let (tmp, mock) = setup(&[1000], None).await;
        mock.set_images(AGENT, &["g1.datto", "g2.datto", "notes.txt"]).await;
        mock.fail_volume_mount("g2.datto").await;
        let mut ctx = mock_context(&mock, tmp.path());

        let report = mount_agent(&mut ctx, "abc", SnapshotSelector::Latest).await.unwrap();

        let snapshot = &report.mounts[0];
        assert_eq!(snapshot.status, MountStatus::Mounted);
        assert_eq!(report.status, BatchStatus::Success);
        let statuses: Vec<(&str, MountStatus)> = snapshot
            .volumes
            .iter()
            .map(|v| (v.guid.as_str(), v.status))
            .collect();
        assert_eq!(
            statuses,
            vec![("g1", MountStatus::Mounted), ("g2", MountStatus::Failed)]
        );
        // no hostname: the agent ID names the directory
        assert!(snapshot.final_mount.contains("/mnt/abc/"));
    }

    #[tokio::test]
    async fn test_missing_image_fails_snapshot_and_drops_clone() {
        let info = r#"{"hostname": "server1", "volumes": {"g9": {"mountpoint": "D:\\"}}}"#;
        let (tmp, mock) = setup(&[1000], Some(info)).await;
        let mut ctx = mock_context(&mock, tmp.path());

        let report = mount_agent(&mut ctx, "server1", SnapshotSelector::Latest)
            .await
            .unwrap();

        assert_eq!(report.status, BatchStatus::Failed);
        let volume = &report.mounts[0].volumes[0];
        assert_eq!(volume.status, MountStatus::Failed);
        assert!(volume.error.as_deref().unwrap().contains("g9.datto"));
        assert!(!mock.datasets().await.iter().any(|d| CloneName::is_clone_name(d)));
        assert!(!date_dir(tmp.path(), 1000).exists());
    }

    #[tokio::test]
    async fn test_remount_replaces_previous_mount() {
        let (tmp, mock) = setup(&[1000], Some(SERVER1)).await;
        let mut ctx = mock_context(&mock, tmp.path());
        mount_agent(&mut ctx, "server1", SnapshotSelector::Latest).await.unwrap();

        let mut again = mock_context(&mock, tmp.path()).with_pid(777);
        let report = mount_agent(&mut again, "server1", SnapshotSelector::Latest)
            .await
            .unwrap();

        assert_eq!(report.status, BatchStatus::Success);
        let clones: Vec<String> = mock
            .datasets()
            .await
            .into_iter()
            .filter(|d| CloneName::is_clone_name(d))
            .collect();
        assert_eq!(clones, vec![format!("{}-snapmount-777-1000", AGENT)]);
        let dest = date_dir(tmp.path(), 1000).join("C");
        let mounts = mock.mounts().await;
        assert_eq!(mounts.iter().filter(|m| m.mountpoint == dest).count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_errors() {
        let (tmp, mock) = setup(&[], Some(SERVER1)).await;
        let mut ctx = mock_context(&mock, tmp.path());

        let err = mount_agent(&mut ctx, "server1", SnapshotSelector::Latest)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NoSnapshotsFound { .. }));

        let err = mount_agent(&mut ctx, "nobody", SnapshotSelector::Latest)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_by_hostname() {
        let (tmp, mock) = setup(&[1000], Some(SERVER1)).await;
        let mut ctx = mock_context(&mock, tmp.path());
        mount_agent(&mut ctx, "server1", SnapshotSelector::Latest).await.unwrap();

        assert_eq!(
            resolve_cleanup_scope(&ctx, Some("server1")).await.unwrap(),
            CleanupScope::Agent {
                id: "abc".to_string(),
                dir_name: "server1".to_string()
            }
        );
        let report = cleanup_agent(&ctx, Some("server1")).await.unwrap();
        assert!(report.success);
        assert_eq!(report.scope, "abc");
        assert!(mock.mounts().await.is_empty());

        let report = cleanup_agent(&ctx, None).await.unwrap();
        assert!(report.cleaned.is_empty());
    }
}
