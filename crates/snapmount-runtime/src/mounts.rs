use crate::command::exec;
use crate::error::{Result, RuntimeError};
use crate::traits::{LoopDevice, MountEntry, MountService};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// `mount`/`umount`/`losetup` backed mount service
pub struct LinuxMountService;

impl LinuxMountService {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxMountService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MountService for LinuxMountService {
    async fn mount_table(&self) -> Result<Vec<MountEntry>> {
        let contents = tokio::fs::read_to_string(MOUNTINFO_PATH)
            .await
            .map_err(|e| RuntimeError::io(Path::new(MOUNTINFO_PATH), e))?;
        Ok(parse_mountinfo(&contents))
    }

    async fn mount_image(
        &self,
        image: &Path,
        dest: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        let image = image.to_string_lossy();
        let dest = dest.to_string_lossy();
        let opts = options.join(",");
        info!("Mounting {} at {} ({}, {})", image, dest, fstype, opts);
        exec("mount", &["-t", fstype, "-o", &opts, &image, &dest]).await?;
        Ok(())
    }

    async fn unmount(&self, path: &Path, force: bool) -> Result<()> {
        let path = path.to_string_lossy();
        let mut args: Vec<&str> = Vec::new();
        if force {
            args.extend(["-f", "-l"]);
        }
        args.push(path.as_ref());
        exec("umount", &args).await?;
        debug!("Unmounted {}", path);
        Ok(())
    }

    async fn loop_devices(&self) -> Result<Vec<LoopDevice>> {
        let output = exec("losetup", &["-l", "-n", "-O", "NAME,BACK-FILE"]).await?;
        Ok(parse_losetup(&output.stdout))
    }

    async fn detach_loop(&self, device: &str) -> Result<()> {
        exec("losetup", &["-d", device]).await?;
        debug!("Detached loop device {}", device);
        Ok(())
    }
}

/// Decode the octal escapes (`\040` for space) used in mountinfo paths
fn decode_mount_escape(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Parse `/proc/self/mountinfo`
///
/// Format: `id parent major:minor root mountpoint options [optional...] - fstype source superopts`
pub fn parse_mountinfo(contents: &str) -> Vec<MountEntry> {
    let mut mounts = Vec::new();
    for line in contents.lines() {
        let Some((left, right)) = line.split_once(" - ") else {
            continue;
        };
        let left_parts: Vec<&str> = left.split_whitespace().collect();
        let right_parts: Vec<&str> = right.split_whitespace().collect();
        if left_parts.len() < 6 || right_parts.len() < 2 {
            continue;
        }

        // Per-mount options carry ro/rw; superblock options add fs specifics
        let mut options: Vec<String> = left_parts[5].split(',').map(str::to_string).collect();
        if let Some(super_opts) = right_parts.get(2) {
            options.extend(
                super_opts
                    .split(',')
                    .filter(|o| *o != "ro" && *o != "rw")
                    .map(str::to_string),
            );
        }

        mounts.push(MountEntry {
            source: decode_mount_escape(right_parts[1]),
            mountpoint: PathBuf::from(decode_mount_escape(left_parts[4])),
            fstype: right_parts[0].to_string(),
            options,
        });
    }
    mounts
}

/// Parse `losetup -l -n -O NAME,BACK-FILE`
pub fn parse_losetup(output: &str) -> Vec<LoopDevice> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (device, backing) = line.split_once(char::is_whitespace)?;
            let backing = backing.trim();
            let backing = backing.strip_suffix("(deleted)").unwrap_or(backing).trim();
            if backing.is_empty() {
                return None;
            }
            Some(LoopDevice {
                device: device.to_string(),
                backing_file: PathBuf::from(backing),
            })
        })
        .collect()
}
