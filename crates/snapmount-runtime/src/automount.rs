//! `automount`: mount the latest snapshot of every agent, one run at a time

use crate::catalog::load_agents;
use crate::cleanup::{cleanup, CleanupScope};
use crate::context::OperationContext;
use crate::error::{Result, RuntimeError};
use crate::mount::mount_snapshot;
use crate::pool::{ensure_imported, locate_pool};
use crate::snapshot::resolve_snapshots;
use snapmount_core::{AutomountOutcome, AutomountReport, SnapshotSelector};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{info, warn};

/// Exclusive, non-blocking lock held for the duration of a run
///
/// Released when dropped (the descriptor closes).
#[derive(Debug)]
pub struct AutomountLock {
    _file: File,
}

impl AutomountLock {
    /// Take the lock, or `None` if another process holds it
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RuntimeError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| RuntimeError::io(path, e))?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(RuntimeError::lock_failed(path, err.to_string()));
        }
        Ok(Some(Self { _file: file }))
    }
}

/// Whether the flag file holds a truthy value
pub async fn automount_enabled(flag: &Path) -> Result<bool> {
    match tokio::fs::read_to_string(flag).await {
        Ok(contents) => Ok(matches!(
            contents.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RuntimeError::io(flag, e)),
    }
}

fn finished(status: AutomountOutcome, message: impl Into<String>) -> AutomountReport {
    AutomountReport {
        success: true,
        status,
        message: message.into(),
        mounts: Vec::new(),
    }
}

/// Sweep everything, then mount each agent's latest snapshot
///
/// A disabled flag or a concurrent run is a normal outcome, not an error.
pub async fn run_automount(ctx: &mut OperationContext) -> Result<AutomountReport> {
    if !automount_enabled(&ctx.settings.automount_flag).await? {
        info!("Automount disabled by {}", ctx.settings.automount_flag.display());
        return Ok(finished(AutomountOutcome::Disabled, "Automount is disabled"));
    }

    let Some(_lock) = AutomountLock::try_acquire(&ctx.settings.lock_file)? else {
        info!("Another automount holds {}", ctx.settings.lock_file.display());
        return Ok(finished(
            AutomountOutcome::AlreadyRunning,
            "Automount is already running",
        ));
    };

    let pool = locate_pool(ctx).await?;
    let pool = ensure_imported(ctx, pool).await?;
    let agents = load_agents(ctx, &pool.name).await?;

    ctx.progress("Cleaning up existing mounts...");
    cleanup(ctx, &CleanupScope::All).await;

    for agent in &agents {
        let snapshots = resolve_snapshots(ctx, agent, SnapshotSelector::Latest).await?;
        let Some(latest) = snapshots.first() else {
            warn!("Agent {} has no snapshots; skipping", agent.id);
            continue;
        };
        ctx.progress(format!("Mounting {}...", latest));
        let record = mount_snapshot(ctx, agent, latest).await;
        ctx.record(record);
    }

    let mounts = ctx.take_records();
    let ok = mounts.iter().filter(|m| m.is_mounted()).count();
    Ok(AutomountReport {
        success: ok == mounts.len(),
        status: AutomountOutcome::Completed,
        message: format!("Mounted latest snapshot of {} of {} agent(s)", ok, mounts.len()),
        mounts,
    })
}
