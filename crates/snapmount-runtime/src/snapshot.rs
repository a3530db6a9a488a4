use crate::catalog::snapshot_names;
use crate::context::OperationContext;
use crate::error::Result;
use snapmount_core::{Agent, SnapshotName, SnapshotSelector};
use tracing::{debug, warn};

/// Pick snapshots from a listing
///
/// - `Latest` takes the numerically greatest epoch, whatever the list order.
/// - `All` returns every snapshot in ascending epoch order.
/// - `Closest` takes the smallest absolute distance; ties go to the earlier epoch.
pub fn select_snapshots(snapshots: &[SnapshotName], selector: SnapshotSelector) -> Vec<SnapshotName> {
    match selector {
        SnapshotSelector::Latest => snapshots
            .iter()
            .max_by_key(|s| s.epoch)
            .cloned()
            .into_iter()
            .collect(),
        SnapshotSelector::All => {
            let mut all = snapshots.to_vec();
            all.sort_by_key(|s| s.epoch);
            all
        }
        SnapshotSelector::Closest(target) => snapshots
            .iter()
            .min_by_key(|s| (s.epoch.abs_diff(target), s.epoch))
            .cloned()
            .into_iter()
            .collect(),
    }
}

/// Dataset whose snapshots belong to `agent`
///
/// Only the ID dataset counts: clones, staging paths and agent-scoped
/// sweeps are all keyed by the agent ID.
pub async fn snapshot_dataset(ctx: &OperationContext, agent: &Agent) -> Result<Option<String>> {
    if ctx.tools.pools.dataset_exists(&agent.dataset).await? {
        Ok(Some(agent.dataset.clone()))
    } else {
        Ok(None)
    }
}

/// Resolve an agent's snapshots for a selector
///
/// An unlistable dataset yields an empty list; the caller decides whether
/// that is fatal.
pub async fn resolve_snapshots(
    ctx: &OperationContext,
    agent: &Agent,
    selector: SnapshotSelector,
) -> Result<Vec<SnapshotName>> {
    let Some(dataset) = snapshot_dataset(ctx, agent).await? else {
        warn!("No dataset found for agent {}", agent.id);
        return Ok(Vec::new());
    };

    let names = match ctx.tools.pools.list_snapshots(&dataset).await {
        Ok(names) => names,
        Err(e) => {
            warn!("Cannot list snapshots of {}: {}", dataset, e);
            return Ok(Vec::new());
        }
    };

    let selected = select_snapshots(&snapshot_names(&names), selector);
    debug!(
        "Selector {} on {} picked {} snapshot(s)",
        selector,
        dataset,
        selected.len()
    );
    Ok(selected)
}
