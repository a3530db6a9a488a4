//! Final read-only mount of a volume image at its partition offset

use crate::context::OperationContext;
use crate::error::{Result, RuntimeError};
use std::path::Path;
use tracing::{debug, info, warn};

/// Mount driver for one filesystem family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemDriver {
    pub fstype: &'static str,
    /// Extra options that keep the driver from replaying journals
    pub options: &'static [&'static str],
}

const NTFS: FilesystemDriver = FilesystemDriver {
    fstype: "ntfs-3g",
    options: &[],
};

const DRIVERS: &[(&[&str], FilesystemDriver)] = &[
    (&["ntfs"], NTFS),
    (
        &["ext2", "ext3", "ext4"],
        FilesystemDriver {
            fstype: "ext4",
            options: &["noload"],
        },
    ),
    (
        &["xfs"],
        FilesystemDriver {
            fstype: "xfs",
            options: &["norecovery"],
        },
    ),
    (
        &["vfat", "fat", "fat32"],
        FilesystemDriver {
            fstype: "vfat",
            options: &[],
        },
    ),
    (
        &["exfat"],
        FilesystemDriver {
            fstype: "exfat",
            options: &[],
        },
    ),
];

impl FilesystemDriver {
    /// Pick the driver for a metadata filesystem hint
    ///
    /// Without `honor_hint` every volume is treated as NTFS, as are hints
    /// with no table entry.
    pub fn for_hint(hint: &str, honor_hint: bool) -> Self {
        if !honor_hint {
            return NTFS;
        }
        let hint = hint.trim().to_ascii_lowercase();
        DRIVERS
            .iter()
            .find(|(names, _)| names.contains(&hint.as_str()))
            .map(|(_, driver)| *driver)
            .unwrap_or(NTFS)
    }

    /// `-o` list for an offset loop mount
    pub fn mount_options(&self, offset: u64) -> Vec<String> {
        let mut options = vec![
            "ro".to_string(),
            "loop".to_string(),
            format!("offset={}", offset),
        ];
        options.extend(self.options.iter().map(|o| o.to_string()));
        options
    }
}

/// Mount `image` read-only at `dest`, reading the partition at `offset`
///
/// The mount table is consulted afterwards: a mount that is missing, or
/// present without `ro`, is a failure even when `mount` exited 0.
pub async fn mount_volume(
    ctx: &OperationContext,
    image: &Path,
    offset: u64,
    fs_hint: &str,
    dest: &Path,
) -> Result<()> {
    let mounts = &ctx.tools.mounts;

    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| RuntimeError::io(dest, e))?;

    // Leftover from an interrupted run
    if let Err(e) = mounts.unmount(dest, true).await {
        debug!("Pre-mount unmount of {}: {}", dest.display(), e);
    }

    let driver = FilesystemDriver::for_hint(fs_hint, ctx.settings.honor_fs_hint);
    let options = driver.mount_options(offset);
    mounts
        .mount_image(image, dest, driver.fstype, &options)
        .await
        .map_err(|e| RuntimeError::volume_mount_failed(dest, e.to_string()))?;

    let table = mounts.mount_table().await?;
    let Some(entry) = table.iter().rev().find(|m| m.mountpoint == dest) else {
        return Err(RuntimeError::volume_mount_failed(
            dest,
            "mount exited successfully but is not in the mount table",
        ));
    };

    if !entry.is_read_only() {
        warn!("{} came up writable; unmounting", dest.display());
        if let Err(e) = mounts.unmount(dest, true).await {
            warn!("Could not unmount writable mount {}: {}", dest.display(), e);
        }
        return Err(RuntimeError::volume_mount_failed(
            dest,
            "filesystem was mounted read-write",
        ));
    }

    info!(
        "Mounted {} ({}) at {}",
        image.display(),
        driver.fstype,
        dest.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::mock_context;
    use crate::mock::MockSystem;
    use crate::traits::MountEntry;

    #[test]
    fn test_baseline_ignores_hint() {
        assert_eq!(FilesystemDriver::for_hint("ext4", false).fstype, "ntfs-3g");
        assert_eq!(FilesystemDriver::for_hint("", false).fstype, "ntfs-3g");
    }

    #[test]
    fn test_dispatch_table() {
        let ext = FilesystemDriver::for_hint("EXT3", true);
        assert_eq!(ext.fstype, "ext4");
        assert_eq!(
            ext.mount_options(512),
            vec!["ro", "loop", "offset=512", "noload"]
        );
        assert_eq!(FilesystemDriver::for_hint("fat32", true).fstype, "vfat");
        assert_eq!(FilesystemDriver::for_hint("xfs", true).options, &["norecovery"]);
        assert_eq!(FilesystemDriver::for_hint("refs", true).fstype, "ntfs-3g");
    }

    #[tokio::test]
    async fn test_mount_is_read_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        let ctx = mock_context(&mock, tmp.path());
        let dest = tmp.path().join("mnt/server1/C");

        mount_volume(&ctx, Path::new("/s/g1.datto"), 1_048_576, "ntfs", &dest)
            .await
            .unwrap();

        assert!(dest.is_dir());
        assert!(mock.is_mounted(&dest).await);
        assert!(!mock.is_writable(&dest.join("new.txt")).await);
        assert!(mock
            .commands()
            .await
            .iter()
            .any(|c| c.contains("-t ntfs-3g -o ro,loop,offset=1048576")));
    }

    #[tokio::test]
    async fn test_writable_mount_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.ignore_read_only().await;
        let ctx = mock_context(&mock, tmp.path());
        let dest = tmp.path().join("mnt/server1/C");

        let err = mount_volume(&ctx, Path::new("/s/g1.datto"), 0, "ntfs", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::VolumeMountFailed { .. }));
        assert!(!mock.is_mounted(&dest).await);
    }

    #[tokio::test]
    async fn test_stale_mount_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        let ctx = mock_context(&mock, tmp.path());
        let dest = tmp.path().join("mnt/server1/C");
        mock.add_mount(MountEntry {
            source: "/dev/loop9".to_string(),
            mountpoint: dest.clone(),
            fstype: "fuseblk".to_string(),
            options: vec!["ro".to_string()],
        })
        .await;

        mount_volume(&ctx, Path::new("/s/g1.datto"), 0, "ntfs", &dest)
            .await
            .unwrap();

        let mounts = mock.mounts().await;
        let at_dest: Vec<_> = mounts.iter().filter(|m| m.mountpoint == dest).collect();
        assert_eq!(at_dest.len(), 1);
        assert_eq!(at_dest[0].fstype, "ntfs-3g");
    }

    #[tokio::test]
    async fn test_failed_mount_reports_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = MockSystem::new();
        mock.fail_volume_mount("bad").await;
        let ctx = mock_context(&mock, tmp.path());

        let err = mount_volume(
            &ctx,
            Path::new("/s/bad.datto"),
            0,
            "ntfs",
            &tmp.path().join("mnt/x"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::VolumeMountFailed { .. }));
    }
}
