use crate::command::exec;
use crate::error::{Result, RuntimeError};
use crate::traits::{BlockDevice, BlockDeviceInspector};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;

/// `fdisk`/`lsblk` backed inspector
pub struct LinuxBlockInspector;

impl LinuxBlockInspector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxBlockInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockDeviceInspector for LinuxBlockInspector {
    async fn partition_table(&self, image: &Path) -> Result<String> {
        let image = image.to_string_lossy();
        let output = exec("fdisk", &["-l", &image]).await?;
        Ok(output.stdout)
    }

    async fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let output = exec(
            "lsblk",
            &[
                "-J",
                "-b",
                "-o",
                "NAME,PATH,SIZE,TYPE,MODEL,SERIAL,TRAN,FSTYPE",
            ],
        )
        .await?;
        parse_lsblk_json(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// lsblk prints sizes as numbers in newer releases and strings in older ones
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkSize {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    path: Option<String>,
    size: Option<LsblkSize>,
    #[serde(rename = "type")]
    kind: Option<String>,
    model: Option<String>,
    serial: Option<String>,
    tran: Option<String>,
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl From<LsblkDevice> for BlockDevice {
    fn from(dev: LsblkDevice) -> Self {
        let size = match dev.size {
            Some(LsblkSize::Number(n)) => n,
            Some(LsblkSize::Text(s)) => s.trim().parse().unwrap_or(0),
            None => 0,
        };
        let text = |v: Option<String>| v.map(|s| s.trim().to_string()).unwrap_or_default();
        BlockDevice {
            path: dev.path.unwrap_or_else(|| format!("/dev/{}", dev.name)),
            name: dev.name,
            size,
            kind: text(dev.kind),
            model: text(dev.model),
            serial: text(dev.serial),
            transport: text(dev.tran),
            fstype: text(dev.fstype),
            children: dev.children.into_iter().map(BlockDevice::from).collect(),
        }
    }
}

/// Parse `lsblk -J` output into a device tree
pub fn parse_lsblk_json(output: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(output)
        .map_err(|e| RuntimeError::command_failed("lsblk -J", 0, format!("unparseable output: {}", e)))?;
    Ok(parsed
        .blockdevices
        .into_iter()
        .map(BlockDevice::from)
        .collect())
}
