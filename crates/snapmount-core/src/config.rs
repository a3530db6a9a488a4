use crate::error::{CoreError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Matches the two pool naming families used by backup appliances:
/// the on-box `homePool` and removable `datto*` offsite drives
pub const DEFAULT_POOL_PATTERN: &str = r"(?i)^(homepool[\w.-]*|datto[\w.-]*)$";

/// Runtime settings for every snapmount command
///
/// Populated by the CLI from flags and environment variables (`POOL_NAME`,
/// `POOL_PATTERN`, `AGENTS_PATH`, `EXPORT_ALL`, `SNAPMOUNT_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Exact pool name override
    pub pool_name: Option<String>,
    /// Regex override for pool discovery
    pub pool_pattern: Option<String>,
    /// Dataset subpath holding one child dataset per agent
    pub agents_path: String,
    /// Bypass pool-name filtering for import/export
    pub export_all: bool,
    /// Root of the final, user-facing mount tree
    pub mount_root: PathBuf,
    /// Root under which clones are mounted
    pub staging_root: PathBuf,
    /// Fixed delay after unmount/destroy before re-checking state
    pub settle_delay: Duration,
    /// Dispatch the final mount by filesystem hint instead of always using ntfs-3g
    pub honor_fs_hint: bool,
    /// Flag file enabling the automount sweep
    pub automount_flag: PathBuf,
    /// Lock file serializing automount sweeps
    pub lock_file: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool_name: None,
            pool_pattern: None,
            agents_path: "home/agents".to_string(),
            export_all: false,
            mount_root: PathBuf::from("/mnt/snapmount"),
            staging_root: PathBuf::from("/var/tmp/snapmount-staging"),
            settle_delay: Duration::from_millis(1000),
            honor_fs_hint: false,
            automount_flag: PathBuf::from("/var/lib/snapmount/automount.enabled"),
            lock_file: PathBuf::from("/run/snapmount-automount.lock"),
        }
    }
}

impl Settings {
    /// Compile the active pool pattern (override or built-in default)
    pub fn pool_regex(&self) -> Result<Regex> {
        let pattern = self
            .pool_pattern
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_POOL_PATTERN);
        Regex::new(pattern).map_err(|e| {
            CoreError::invalid_config(
                format!("POOL_PATTERN '{}' is not a valid regex: {}", pattern, e),
                "Fix or unset POOL_PATTERN to fall back to the built-in pattern",
            )
        })
    }

    /// Reject mount roots that would expose clones in the user-facing tree
    ///
    /// Both roots must be absolute (`zfs set mountpoint=` and the mount table
    /// only deal in absolute paths) and neither may contain the other.
    pub fn validate(&self) -> Result<()> {
        for (var, root) in [
            ("SNAPMOUNT_MOUNT_ROOT", &self.mount_root),
            ("SNAPMOUNT_STAGING_ROOT", &self.staging_root),
        ] {
            if !root.is_absolute() {
                return Err(CoreError::invalid_config(
                    format!("{} '{}' is not an absolute path", var, root.display()),
                    format!("Set {} to an absolute directory", var),
                ));
            }
        }
        if self.staging_root.starts_with(&self.mount_root)
            || self.mount_root.starts_with(&self.staging_root)
        {
            return Err(CoreError::invalid_config(
                format!(
                    "staging root {} and mount root {} overlap",
                    self.staging_root.display(),
                    self.mount_root.display()
                ),
                "Point SNAPMOUNT_STAGING_ROOT and SNAPMOUNT_MOUNT_ROOT at disjoint directories",
            ));
        }
        Ok(())
    }

    /// Dataset holding all agents of `pool`
    pub fn agents_dataset(&self, pool: &str) -> String {
        let sub = self.agents_path.trim_matches('/');
        if sub.is_empty() {
            pool.to_string()
        } else {
            format!("{}/{}", pool, sub)
        }
    }

    /// Staging directory holding an agent's clone mountpoints
    pub fn agent_staging_dir(&self, agent_id: &str) -> PathBuf {
        self.staging_root.join(agent_id)
    }

    /// Final mount directory of an agent
    pub fn agent_mount_dir(&self, agent_dir: &str) -> PathBuf {
        self.mount_root.join(agent_dir)
    }

    /// Whether `path` sits inside the staging tree
    pub fn is_staging_path(&self, path: &Path) -> bool {
        path.starts_with(&self.staging_root)
    }
}
