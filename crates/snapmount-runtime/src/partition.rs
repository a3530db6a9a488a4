//! Byte offset of the data partition inside a raw `.datto` image

use crate::context::OperationContext;
use crate::error::{Result, RuntimeError};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

static SECTOR_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Sector size \(logical/physical\):\s*(\d+)\s*bytes").expect("valid regex")
});

static UNITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Units:.*=\s*(\d+)\s*bytes").expect("valid regex"));

/// Logical sector size reported by `fdisk -l`
pub fn parse_sector_size(output: &str) -> Option<u64> {
    SECTOR_SIZE_RE
        .captures(output)
        .or_else(|| UNITS_RE.captures(output))
        .and_then(|caps| caps[1].parse().ok())
        .filter(|size| *size > 0)
}

/// Start sector of `<image>1` in an `fdisk -l` partition listing
///
/// Handles both layouts: GPT rows (`Device Start End ...`) and MBR rows,
/// which may carry a `*` boot flag before the start column.
pub fn parse_first_partition_start(output: &str, image: &Path) -> Option<u64> {
    let device = format!("{}1", image.display());
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != device {
            return None;
        }
        let mut start = fields.next()?;
        if start == "*" {
            start = fields.next()?;
        }
        start.parse().ok()
    })
}

/// Compute `start_sector * sector_size` from captured `fdisk -l` output
pub fn parse_partition_offset(output: &str, image: &Path) -> Result<u64> {
    let sector_size = parse_sector_size(output).ok_or_else(|| {
        RuntimeError::offset_undeterminable(image, "sector size not found in partition table")
    })?;
    let start = parse_first_partition_start(output, image).ok_or_else(|| {
        RuntimeError::offset_undeterminable(
            image,
            format!("no start sector for partition {}1", image.display()),
        )
    })?;
    start.checked_mul(sector_size).ok_or_else(|| {
        RuntimeError::offset_undeterminable(image, "partition offset overflows")
    })
}

/// Inspect an image's partition table and return the data partition offset
pub async fn resolve_offset(ctx: &OperationContext, image: &Path) -> Result<u64> {
    let listing = ctx
        .tools
        .block
        .partition_table(image)
        .await
        .map_err(|e| RuntimeError::offset_undeterminable(image, e.to_string()))?;
    let offset = parse_partition_offset(&listing, image)?;
    debug!("Partition offset for {}: {}", image.display(), offset);
    Ok(offset)
}
