//! Agent discovery and `.agentInfo` metadata

use crate::context::OperationContext;
use crate::error::{Result, RuntimeError};
use serde::Deserialize;
use snapmount_core::{Agent, CloneName, Epoch, SnapshotName, VolumeSpec};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const AGENT_INFO_SUFFIX: &str = ".agentInfo";

/// Volume entry as written by the backup product
#[derive(Debug, Deserialize)]
struct RawVolume {
    #[serde(default)]
    guid: Option<String>,
    #[serde(default, alias = "mountPoint")]
    mountpoint: String,
    #[serde(default, alias = "fs", alias = "filesystemType")]
    filesystem: String,
}

/// Volumes may be recorded as a list or as a map keyed by GUID
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawVolumes {
    List(Vec<RawVolume>),
    Map(BTreeMap<String, RawVolume>),
}

impl Default for RawVolumes {
    fn default() -> Self {
        RawVolumes::List(Vec::new())
    }
}

impl RawVolumes {
    fn into_specs(self) -> Vec<VolumeSpec> {
        let pairs: Vec<(Option<String>, RawVolume)> = match self {
            RawVolumes::List(list) => list.into_iter().map(|v| (None, v)).collect(),
            RawVolumes::Map(map) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
        };
        pairs
            .into_iter()
            .filter_map(|(key, raw)| {
                let guid = raw.guid.filter(|g| !g.is_empty()).or(key)?;
                Some(VolumeSpec::new(guid, raw.mountpoint, raw.filesystem))
            })
            .collect()
    }
}

/// Contents of `<agentId>.agentInfo`
#[derive(Debug, Default, Deserialize)]
struct AgentInfoFile {
    #[serde(default)]
    hostname: String,
    #[serde(default, alias = "displayName")]
    name: String,
    #[serde(default, alias = "osType", alias = "os_type")]
    os: String,
    #[serde(default)]
    volumes: RawVolumes,
}

/// Parse an `.agentInfo` document
fn parse_agent_info(path: &Path, contents: &str) -> Result<AgentInfoFile> {
    serde_json::from_str(contents).map_err(|e| RuntimeError::metadata_parse(path, e.to_string()))
}

/// Parse snapshot names, dropping ones without a numeric epoch suffix
pub fn snapshot_names(names: &[String]) -> Vec<SnapshotName> {
    names
        .iter()
        .filter_map(|n| match SnapshotName::parse(n) {
            Ok(s) => Some(s),
            Err(_) => {
                debug!("Ignoring non-epoch snapshot {}", n);
                None
            }
        })
        .collect()
}

/// Candidate locations of an agent's info file, live dataset first
fn agent_info_paths(mountpoint: &Path, agent_id: &str, latest: Option<Epoch>) -> Vec<PathBuf> {
    let file = format!("{}{}", agent_id, AGENT_INFO_SUFFIX);
    let mut paths = vec![mountpoint.join(&file)];
    if let Some(epoch) = latest {
        paths.push(
            mountpoint
                .join(".zfs")
                .join("snapshot")
                .join(epoch.to_string())
                .join(&file),
        );
    }
    paths
}

async fn read_agent_info(
    ctx: &OperationContext,
    dataset: &str,
    agent_id: &str,
    latest: Option<Epoch>,
) -> Result<Option<AgentInfoFile>> {
    let mountpoint = ctx
        .tools
        .pools
        .get_property(dataset, "mountpoint")
        .await?
        .filter(|m| m.starts_with('/'));
    let Some(mountpoint) = mountpoint else {
        debug!("Dataset {} has no usable mountpoint", dataset);
        return Ok(None);
    };

    for path in agent_info_paths(Path::new(&mountpoint), agent_id, latest) {
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => return parse_agent_info(&path, &contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(RuntimeError::io(&path, e)),
        }
    }
    Ok(None)
}

/// Load every agent stored under the pool's agents dataset
pub async fn load_agents(ctx: &OperationContext, pool: &str) -> Result<Vec<Agent>> {
    let parent = ctx.settings.agents_dataset(pool);
    let pools = &ctx.tools.pools;

    if !pools.dataset_exists(&parent).await? {
        return Err(RuntimeError::metadata_unavailable(format!(
            "dataset {} does not exist",
            parent
        )));
    }
    let children = pools
        .list_children(&parent)
        .await
        .map_err(|e| RuntimeError::metadata_unavailable(format!("cannot list {}: {}", parent, e)))?;

    let mut agents = Vec::new();
    for dataset in children.into_iter().filter(|d| !CloneName::is_clone_name(d)) {
        let id = dataset.rsplit('/').next().unwrap_or(&dataset).to_string();
        let snapshots = match pools.list_snapshots(&dataset).await {
            Ok(names) => snapshot_names(&names),
            Err(e) => {
                warn!("Cannot list snapshots of {}: {}", dataset, e);
                Vec::new()
            }
        };
        let latest = snapshots.iter().map(|s| s.epoch).max();

        let mut agent = Agent::bare(&id, &dataset);
        agent.snapshot_count = snapshots.len();
        if let Some(info) = read_agent_info(ctx, &dataset, &id, latest).await? {
            agent.hostname = info.hostname;
            agent.name = info.name;
            agent.os_type = info.os;
            agent.volumes = info.volumes.into_specs();
        }
        agents.push(agent);
    }
    Ok(agents)
}

/// Match an agent reference by hostname, then display name, then ID
///
/// Each pass is exact and case-sensitive; the first hit wins.
pub fn find_agent<'a>(agents: &'a [Agent], agent_ref: &str) -> Result<&'a Agent> {
    agents
        .iter()
        .find(|a| !a.hostname.is_empty() && a.hostname == agent_ref)
        .or_else(|| {
            agents
                .iter()
                .find(|a| !a.name.is_empty() && a.name == agent_ref)
        })
        .or_else(|| agents.iter().find(|a| a.id == agent_ref))
        .ok_or_else(|| RuntimeError::agent_not_found(agent_ref))
}
