use snapmount_core::{PoolInfo, PoolState};

const VDEV_STATES: &[&str] = &[
    "ONLINE", "DEGRADED", "FAULTED", "OFFLINE", "UNAVAIL", "REMOVED", "AVAIL", "INUSE",
];

/// Grouping rows in vdev listings that are not devices
fn is_vdev_group(token: &str) -> bool {
    ["mirror", "raidz", "draid", "spare", "replacing"]
        .iter()
        .any(|p| token.starts_with(p))
        || matches!(token, "logs" | "cache" | "spares" | "special" | "dedup")
}

/// Parse `zpool list -H -v -P -o name,health`
///
/// Pool rows start in column 0; vdev rows are tab-indented.
pub fn parse_zpool_list(output: &str) -> Vec<PoolInfo> {
    let mut pools: Vec<PoolInfo> = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(char::is_whitespace);
        let mut fields = line.split_whitespace();
        let Some(name) = fields.next() else {
            continue;
        };

        if !indented {
            let mut pool = PoolInfo::new(name, PoolState::Imported);
            pool.health = fields.next().map(str::to_string);
            pools.push(pool);
        } else if let Some(pool) = pools.last_mut() {
            if !is_vdev_group(name) {
                pool.devices.push(name.to_string());
            }
        }
    }

    pools
}

/// Parse the human-readable listing printed by `zpool import`
///
/// Example block:
/// ```text
///    pool: homePool
///      id: 1234567890
///   state: ONLINE
///  config:
///
///         homePool    ONLINE
///           sdb1      ONLINE
/// ```
pub fn parse_zpool_import(output: &str) -> Vec<PoolInfo> {
    let mut pools: Vec<PoolInfo> = Vec::new();
    let mut in_config = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("pool:") {
            pools.push(PoolInfo::new(name.trim(), PoolState::Available));
            in_config = false;
            continue;
        }
        let Some(pool) = pools.last_mut() else {
            continue;
        };
        if let Some(state) = trimmed.strip_prefix("state:") {
            pool.health = Some(state.trim().to_string());
        } else if trimmed.starts_with("config:") {
            in_config = true;
        } else if in_config {
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 2
                && fields[0] != pool.name
                && VDEV_STATES.contains(&fields[1])
                && !is_vdev_group(fields[0])
            {
                pool.devices.push(fields[0].to_string());
            }
        }
    }

    pools
}

/// Names from `zfs list -H -o name`, skipping blanks
pub fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Value from `zfs get -H -o value`, `None` for unset (`-`)
pub fn parse_property_value(output: &str) -> Option<String> {
    let value = output.lines().next()?.trim();
    if value.is_empty() || value == "-" {
        None
    } else {
        Some(value.to_string())
    }
}
