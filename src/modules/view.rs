use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::modules::ore::{NodeId, OreKind};
use crate::modules::qi::Qi;
use crate::modules::store::{self, StateDir, StoreError};
use crate::modules::structure::{StructureId, StructureKind};
use crate::modules::world::{AgentId, AgentStatus, DEFAULT_MAX_AGENT_AGE, Position, WorldState};

pub const SNAPSHOT_VERSION: u32 = 2;

fn default_version() -> u32 {
    1
}

fn default_max_age() -> u64 {
    DEFAULT_MAX_AGENT_AGE
}

fn default_status() -> AgentStatus {
    AgentStatus::Active
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub position: Position,
    pub qi: Qi,
    pub age: u64,
    pub alive: bool,
    #[serde(default = "default_max_age")]
    pub max_age: u64,
    #[serde(default = "default_status")]
    pub status: AgentStatus,
    #[serde(default)]
    pub transistors: Qi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OreNodeSnapshot {
    pub id: NodeId,
    pub position: Position,
    pub ore: OreKind,
    pub remaining: Qi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeNodeSnapshot {
    pub id: NodeId,
    pub position: Position,
    pub charge: Qi,
    pub capacity: Qi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureView {
    pub id: StructureId,
    pub position: Position,
    pub kind: StructureKind,
    pub owner: AgentId,
}

/// Document consumed by external viewers. Fields added after the first
/// version are defaulted so older files still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub tick: u64,
    pub agents: Vec<AgentSnapshot>,
    pub ore_nodes: Vec<OreNodeSnapshot>,
    #[serde(default)]
    pub recharge_nodes: Vec<RechargeNodeSnapshot>,
    pub structures: Vec<StructureView>,
}

impl WorldSnapshot {
    pub fn from_world(world: &WorldState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            tick: world.tick(),
            agents: world
                .agents()
                .map(|a| AgentSnapshot {
                    id: a.id,
                    position: a.position,
                    qi: a.qi,
                    age: a.age,
                    alive: a.is_alive(),
                    max_age: a.max_age,
                    status: a.status,
                    transistors: a.transistors,
                })
                .collect(),
            ore_nodes: world
                .ore_nodes()
                .map(|n| OreNodeSnapshot {
                    id: n.id,
                    position: n.position,
                    ore: n.ore,
                    remaining: n.remaining,
                })
                .collect(),
            recharge_nodes: world
                .recharge_nodes()
                .map(|n| RechargeNodeSnapshot {
                    id: n.id,
                    position: n.position,
                    charge: n.charge,
                    capacity: n.capacity,
                })
                .collect(),
            structures: world
                .structures()
                .map(|s| StructureView {
                    id: s.id,
                    position: s.position,
                    kind: s.kind,
                    owner: s.owner,
                })
                .collect(),
        }
    }
}

pub fn tick_file_name(tick: u64) -> String {
    format!("tick_{:06}.json", tick)
}

/// Latest published snapshot, falling back to the newest history file.
pub fn load_world_snapshot(dir: &StateDir) -> Result<Option<WorldSnapshot>, StoreError> {
    if let Some(snapshot) = store::read_json(&dir.snapshot())? {
        return Ok(Some(snapshot));
    }
    let latest = fs::read_dir(dir.snapshot_history())
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().and_then(|s| s.to_str()) == Some("json"))
        .max();
    match latest {
        Some(path) => store::read_json(&path),
        None => Ok(None),
    }
}

fn write_snapshot(
    latest: &Path,
    history: Option<&Path>,
    snapshot: &WorldSnapshot,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Encode {
        path: latest.to_path_buf(),
        source,
    })?;
    if let Some(dir) = history {
        store::write_bytes_atomic(&dir.join(tick_file_name(snapshot.tick)), &json)?;
    }
    store::write_bytes_atomic(latest, &json)
}

/// Publishes snapshots from a background thread so disk writes overlap the
/// next tick. At most one write is in flight; publishing again (or calling
/// [`SnapshotWriter::finish`]) waits for the previous one first.
#[derive(Debug)]
pub struct SnapshotWriter {
    latest: PathBuf,
    history: Option<PathBuf>,
    pending: Option<(u64, JoinHandle<Result<(), StoreError>>)>,
    superseded: Vec<u64>,
}

impl SnapshotWriter {
    pub fn new(dir: &StateDir, keep_history: bool) -> Self {
        Self {
            latest: dir.snapshot(),
            history: keep_history.then(|| dir.snapshot_history()),
            pending: None,
            superseded: Vec::new(),
        }
    }

    pub fn publish(&mut self, snapshot: WorldSnapshot) {
        self.join_pending();
        let latest = self.latest.clone();
        let history = self.history.clone();
        let tick = snapshot.tick;
        let handle = thread::spawn(move || write_snapshot(&latest, history.as_deref(), &snapshot));
        self.pending = Some((tick, handle));
    }

    fn join_pending(&mut self) {
        let Some((tick, handle)) = self.pending.take() else {
            return;
        };
        match handle.join() {
            Ok(Ok(())) => debug!(tick, "snapshot published"),
            Ok(Err(err)) => {
                warn!(tick, error = %err, "snapshot write failed; superseded by the next tick");
                self.superseded.push(tick);
            }
            Err(_) => {
                warn!(tick, "snapshot writer thread panicked");
                self.superseded.push(tick);
            }
        }
    }

    /// Wait for the in-flight write and return ticks whose write failed.
    pub fn finish(mut self) -> Vec<u64> {
        self.join_pending();
        std::mem::take(&mut self.superseded)
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.join_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testkit::Sandbox;

    #[test]
    fn publishes_latest_and_history() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::new(tmp.path());
        let mut sb = Sandbox::new();
        sb.spawn(3, Position::origin());

        let mut writer = SnapshotWriter::new(&dir, true);
        writer.publish(WorldSnapshot::from_world(&sb.world));
        sb.world.tick = 1;
        writer.publish(WorldSnapshot::from_world(&sb.world));
        assert!(writer.finish().is_empty());

        let latest = load_world_snapshot(&dir).unwrap().unwrap();
        assert_eq!(latest.tick, 1);
        assert_eq!(latest.agents.len(), 1);
        assert!(latest.agents[0].alive);
        assert!(dir.snapshot_history().join("tick_000000.json").exists());
        assert!(dir.snapshot_history().join("tick_000001.json").exists());
    }

    #[test]
    fn old_documents_still_load() {
        let json = r#"{"tick":4,"agents":[{"id":1,"position":{"x":0,"y":0,"z":0},"qi":2,"age":3,"alive":true}],"ore_nodes":[],"structures":[]}"#;
        let snapshot: WorldSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.version, 1);
        assert!(snapshot.recharge_nodes.is_empty());
        assert_eq!(snapshot.agents[0].max_age, DEFAULT_MAX_AGENT_AGE);
    }
}
