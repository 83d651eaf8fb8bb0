use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::ore::{Decay, NodeId, OreKind, OreNode, RechargeNode};
use crate::modules::qi::{self, Flow, LedgerError, Qi, QiJournal};
use crate::modules::structure::{Structure, StructureId};
use crate::modules::zone::{Zone, ZoneId};

pub type AgentId = u64;

/// Default agent lifespan in ticks unless extended by the creator.
pub const DEFAULT_MAX_AGENT_AGE: u64 = 112;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn origin() -> Self {
        Self { x: 0, y: 0, z: 0 }
    }

    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            z: self.z.saturating_add(dz),
        }
    }

    /// Chebyshev distance, saturating at `i32::MAX`.
    pub fn distance(self, other: Position) -> i32 {
        let axis = |a: i32, b: i32| (a as i64 - b as i64).abs();
        let d = axis(self.x, other.x).max(axis(self.y, other.y)).max(axis(self.z, other.z));
        i32::try_from(d).unwrap_or(i32::MAX)
    }

    pub fn manhattan(self, other: Position) -> i64 {
        (self.x as i64 - other.x as i64).abs()
            + (self.y as i64 - other.y as i64).abs()
            + (self.z as i64 - other.z as i64).abs()
    }

    pub fn within_range(self, other: Position, range: i32) -> bool {
        self.distance(other) <= range
    }

    pub fn in_bounds(self, half_extent: i32) -> bool {
        let limit = half_extent.max(0).unsigned_abs();
        self.x.unsigned_abs() <= limit && self.y.unsigned_abs() <= limit && self.z.unsigned_abs() <= limit
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

fn default_half_extent() -> i32 {
    256
}
fn default_scan_range() -> i32 {
    8
}
fn default_max_move_radius() -> i32 {
    3
}
fn default_harvest_range() -> i32 {
    1
}
fn default_harvest_per_action() -> Qi {
    3
}
fn default_dock_range() -> i32 {
    1
}
fn default_dock_draw() -> Qi {
    1
}
fn default_max_zone_radius() -> i32 {
    8
}
fn default_max_program_len() -> usize {
    256
}
fn default_max_age() -> u64 {
    DEFAULT_MAX_AGENT_AGE
}
fn default_reproduction_threshold() -> Qi {
    4
}
fn default_child_qi_percent() -> u8 {
    50
}
fn default_memory_limit() -> usize {
    8
}
fn default_child_memory_limit() -> usize {
    4
}

/// Tunables that decide whether an action is legal. They live inside the
/// world so replaying a saved world always validates the same way.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldRules {
    /// Positions must satisfy |x|,|y|,|z| <= half_extent.
    #[serde(default = "default_half_extent")]
    pub half_extent: i32,
    #[serde(default = "default_scan_range")]
    pub scan_range: i32,
    #[serde(default = "default_max_move_radius")]
    pub max_move_radius: i32,
    #[serde(default = "default_harvest_range")]
    pub harvest_range: i32,
    #[serde(default = "default_harvest_per_action")]
    pub harvest_per_action: Qi,
    #[serde(default = "default_dock_range")]
    pub dock_range: i32,
    #[serde(default = "default_dock_draw")]
    pub dock_draw: Qi,
    #[serde(default = "default_max_zone_radius")]
    pub max_zone_radius: i32,
    #[serde(default = "default_max_program_len")]
    pub max_program_len: usize,
    #[serde(default = "default_max_age")]
    pub default_max_age: u64,
    #[serde(default = "default_reproduction_threshold")]
    pub reproduction_threshold: Qi,
    /// Share of the parent's post-cost balance handed to a child.
    #[serde(default = "default_child_qi_percent")]
    pub child_qi_percent: u8,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    #[serde(default = "default_child_memory_limit")]
    pub child_memory_limit: usize,
}

impl Default for WorldRules {
    fn default() -> Self {
        Self {
            half_extent: default_half_extent(),
            scan_range: default_scan_range(),
            max_move_radius: default_max_move_radius(),
            harvest_range: default_harvest_range(),
            harvest_per_action: default_harvest_per_action(),
            dock_range: default_dock_range(),
            dock_draw: default_dock_draw(),
            max_zone_radius: default_max_zone_radius(),
            max_program_len: default_max_program_len(),
            default_max_age: default_max_age(),
            reproduction_threshold: default_reproduction_threshold(),
            child_qi_percent: default_child_qi_percent(),
            memory_limit: default_memory_limit(),
            child_memory_limit: default_child_memory_limit(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Active,
    Stalled,
    Dead,
}

impl AgentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            AgentStatus::Spawning => "spawning",
            AgentStatus::Active => "active",
            AgentStatus::Stalled => "stalled",
            AgentStatus::Dead => "dead",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    Age,
    Hazard,
    Corruption,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Wallet address whose key signs this agent's actions.
    pub owner: String,
    pub position: Position,
    pub qi: Qi,
    #[serde(default)]
    pub transistors: Qi,
    pub age: u64,
    pub max_age: u64,
    pub status: AgentStatus,
    /// Nonce of the last accepted action; the next one must be this plus one.
    pub last_nonce: u64,
    #[serde(default)]
    pub parent: Option<AgentId>,
    #[serde(default)]
    pub offspring: Vec<AgentId>,
    #[serde(default)]
    pub memory: VecDeque<String>,
    #[serde(default)]
    pub death: Option<DeathReason>,
}

impl Agent {
    pub fn is_alive(&self) -> bool {
        self.status != AgentStatus::Dead
    }

    /// Append a note, dropping the oldest ones past `limit`.
    pub fn remember(&mut self, note: String, limit: usize) {
        self.memory.push_back(note);
        while self.memory.len() > limit {
            self.memory.pop_front();
        }
    }
}

/// Input for creating an agent.
#[derive(Clone, Debug)]
pub struct AgentSpec {
    pub owner: String,
    pub qi: Qi,
    pub position: Position,
    pub max_age: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hazard {
    pub agent_id: AgentId,
    pub reason: DeathReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),
    #[error("agent {0} is dead")]
    AgentDead(AgentId),
    #[error("wallet {0} has no registered key")]
    UnknownWallet(String),
    #[error("position {0} is outside the world bounds")]
    OutOfBounds(Position),
    #[error("ore node {0} not found")]
    NodeNotFound(NodeId),
    #[error("agent {agent_id}: {source}")]
    Ledger {
        agent_id: AgentId,
        source: LedgerError,
    },
    #[error("ambient pool: {0}")]
    Pool(LedgerError),
    #[error("inconsistent world state: {0}")]
    Inconsistent(String),
}

/// Canonical world snapshot owned by the tick engine between ticks.
///
/// Every collection is ordered so that serialising the same world always
/// produces the same bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    pub(crate) tick: u64,
    #[serde(default)]
    pub(crate) rules: WorldRules,
    next_agent_id: AgentId,
    next_node_id: NodeId,
    next_structure_id: StructureId,
    next_zone_id: ZoneId,
    pub(crate) agents: BTreeMap<AgentId, Agent>,
    #[serde(default)]
    pub(crate) ore_nodes: BTreeMap<NodeId, OreNode>,
    #[serde(default)]
    pub(crate) recharge_nodes: BTreeMap<NodeId, RechargeNode>,
    #[serde(default)]
    pub(crate) structures: BTreeMap<StructureId, Structure>,
    #[serde(default)]
    pub(crate) zones: BTreeMap<ZoneId, Zone>,
    /// Wallet address -> hex encoded ed25519 public key.
    #[serde(default)]
    pub(crate) wallet_keys: BTreeMap<String, String>,
    /// Estates without heirs.
    #[serde(default)]
    pub(crate) ambient_pool: Qi,
    /// Action costs, outside the world total until recycled into recharge nodes.
    #[serde(default)]
    pub(crate) recycle_reserve: Qi,
    /// Qi the creator has put in: agent funding, qi ore, recharge capacity.
    /// Recharge nodes only regenerate fresh charge below it. `None` (worlds
    /// saved before it was tracked) leaves regeneration uncapped.
    #[serde(default)]
    pub(crate) qi_supply_cap: Option<Qi>,
    #[serde(default)]
    pub(crate) pending_hazards: Vec<Hazard>,
    #[serde(skip)]
    pub(crate) journal: QiJournal,
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new(WorldRules::default())
    }
}

impl WorldState {
    pub fn new(rules: WorldRules) -> Self {
        Self {
            tick: 0,
            rules,
            next_agent_id: 1,
            next_node_id: 1,
            next_structure_id: 1,
            next_zone_id: 1,
            agents: BTreeMap::new(),
            ore_nodes: BTreeMap::new(),
            recharge_nodes: BTreeMap::new(),
            structures: BTreeMap::new(),
            zones: BTreeMap::new(),
            wallet_keys: BTreeMap::new(),
            ambient_pool: 0,
            recycle_reserve: 0,
            qi_supply_cap: Some(0),
            pending_hazards: Vec::new(),
            journal: QiJournal::default(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn rules(&self) -> &WorldRules {
        &self.rules
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(&id)
    }

    pub(crate) fn agent_mut(&mut self, id: AgentId) -> Result<&mut Agent, WorldError> {
        self.agents.get_mut(&id).ok_or(WorldError::AgentNotFound(id))
    }

    /// Agents in ascending id order, dead ones included.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn alive_agent_ids(&self) -> Vec<AgentId> {
        self.agents
            .values()
            .filter(|a| a.is_alive())
            .map(|a| a.id)
            .collect()
    }

    pub fn ore_nodes(&self) -> impl Iterator<Item = &OreNode> {
        self.ore_nodes.values()
    }

    pub fn ore_node(&self, id: NodeId) -> Option<&OreNode> {
        self.ore_nodes.get(&id)
    }

    pub fn recharge_nodes(&self) -> impl Iterator<Item = &RechargeNode> {
        self.recharge_nodes.values()
    }

    pub fn recharge_node(&self, id: NodeId) -> Option<&RechargeNode> {
        self.recharge_nodes.get(&id)
    }

    pub fn structures(&self) -> impl Iterator<Item = &Structure> {
        self.structures.values()
    }

    pub fn structure(&self, id: StructureId) -> Option<&Structure> {
        self.structures.get(&id)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(&id)
    }

    pub fn ambient_pool(&self) -> Qi {
        self.ambient_pool
    }

    pub fn recycle_reserve(&self) -> Qi {
        self.recycle_reserve
    }

    pub fn qi_supply_cap(&self) -> Option<Qi> {
        self.qi_supply_cap
    }

    /// World total plus Qi still stored in recharge nodes, qi ore and the
    /// recycle reserve.
    pub fn qi_supply(&self) -> Qi {
        let charge = self.recharge_nodes.values().map(|n| n.charge);
        let ore = self
            .ore_nodes
            .values()
            .filter(|n| n.ore == OreKind::Qi)
            .map(|n| n.remaining);
        charge
            .chain(ore)
            .chain([self.recycle_reserve])
            .fold(self.total_qi(), |acc, v| acc.saturating_add(v))
    }

    /// Fresh regeneration still allowed under the supply cap.
    pub fn regen_budget(&self) -> Qi {
        self.qi_supply_cap
            .map_or(Qi::MAX, |cap| cap.saturating_sub(self.qi_supply()))
    }

    pub(crate) fn add_supply(&mut self, amount: Qi) {
        if let Some(cap) = &mut self.qi_supply_cap {
            *cap = cap.saturating_add(amount);
        }
    }

    pub fn pending_hazards(&self) -> &[Hazard] {
        &self.pending_hazards
    }

    pub fn journal(&self) -> &QiJournal {
        &self.journal
    }

    pub(crate) fn reset_journal(&mut self) -> QiJournal {
        std::mem::take(&mut self.journal)
    }

    /// Qi held inside the world: every agent balance plus the ambient pool.
    pub fn total_qi(&self) -> Qi {
        self.agents
            .values()
            .map(|a| a.qi)
            .fold(self.ambient_pool, |acc, v| acc.saturating_add(v))
    }

    /// Alive agent standing on `position`.
    pub fn occupant(&self, position: Position) -> Option<AgentId> {
        self.agents
            .values()
            .find(|a| a.is_alive() && a.position == position)
            .map(|a| a.id)
    }

    pub fn structure_at(&self, position: Position) -> Option<&Structure> {
        self.structures.values().find(|s| s.position == position)
    }

    pub fn zone_at(&self, position: Position) -> Option<&Zone> {
        self.zones.values().find(|z| z.region.contains(position))
    }

    pub fn register_wallet_key(&mut self, address: impl Into<String>, public_key_hex: impl Into<String>) {
        self.wallet_keys.insert(address.into(), public_key_hex.into());
    }

    pub fn wallet_key(&self, address: &str) -> Option<&str> {
        self.wallet_keys.get(address).map(String::as_str)
    }

    /// Nearest unoccupied in-bounds cell at or around `near`, scanning
    /// rings of growing Chebyshev radius in x, y, z order.
    pub fn free_cell_near(&self, near: Position, max_radius: i32) -> Option<Position> {
        let half = self.rules.half_extent;
        for radius in 0..=max_radius {
            for dx in -radius..=radius {
                for dy in -radius..=radius {
                    for dz in -radius..=radius {
                        if dx.abs().max(dy.abs()).max(dz.abs()) != radius {
                            continue;
                        }
                        let cell = near.offset(dx, dy, dz);
                        if cell.in_bounds(half) && self.occupant(cell).is_none() {
                            return Some(cell);
                        }
                    }
                }
            }
        }
        None
    }

    pub(crate) fn insert_agent(&mut self, spec: AgentSpec) -> Result<AgentId, WorldError> {
        if !self.wallet_keys.contains_key(&spec.owner) {
            return Err(WorldError::UnknownWallet(spec.owner));
        }
        if !spec.position.in_bounds(self.rules.half_extent) {
            return Err(WorldError::OutOfBounds(spec.position));
        }
        let position = self
            .free_cell_near(spec.position, self.rules.scan_range)
            .ok_or(WorldError::OutOfBounds(spec.position))?;

        let id = self.next_agent_id;
        self.next_agent_id += 1;
        let agent = Agent {
            id,
            owner: spec.owner,
            position,
            qi: spec.qi,
            transistors: 0,
            age: 0,
            max_age: spec.max_age.unwrap_or(self.rules.default_max_age).max(1),
            status: AgentStatus::Spawning,
            last_nonce: 0,
            parent: None,
            offspring: Vec::new(),
            memory: VecDeque::new(),
            death: None,
        };
        self.agents.insert(id, agent);
        Ok(id)
    }

    pub fn add_ore_node(
        &mut self,
        ore: OreKind,
        position: Position,
        quantity: Qi,
        decay: Option<Decay>,
    ) -> Result<NodeId, WorldError> {
        if !position.in_bounds(self.rules.half_extent) {
            return Err(WorldError::OutOfBounds(position));
        }
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.ore_nodes.insert(
            id,
            OreNode {
                id,
                ore,
                position,
                remaining: quantity,
                decay,
            },
        );
        if ore == OreKind::Qi {
            self.add_supply(quantity);
        }
        Ok(id)
    }

    pub fn add_recharge_node(
        &mut self,
        position: Position,
        capacity: Qi,
        regen_per_tick: Qi,
    ) -> Result<NodeId, WorldError> {
        if !position.in_bounds(self.rules.half_extent) {
            return Err(WorldError::OutOfBounds(position));
        }
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.recharge_nodes.insert(
            id,
            RechargeNode {
                id,
                position,
                capacity,
                charge: capacity,
                regen_per_tick,
            },
        );
        self.add_supply(capacity);
        Ok(id)
    }

    pub(crate) fn next_structure_id(&mut self) -> StructureId {
        let id = self.next_structure_id;
        self.next_structure_id += 1;
        id
    }

    pub(crate) fn next_zone_id(&mut self) -> ZoneId {
        let id = self.next_zone_id;
        self.next_zone_id += 1;
        id
    }

    /// Credit an agent through the ledger and journal the flow.
    pub(crate) fn credit_agent(&mut self, id: AgentId, amount: Qi, flow: Flow) -> Result<Qi, WorldError> {
        let agent = self.agent_mut(id)?;
        qi::credit(&mut agent.qi, amount).map_err(|source| WorldError::Ledger {
            agent_id: id,
            source,
        })?;
        let balance = agent.qi;
        self.journal.record(flow, amount);
        Ok(balance)
    }

    /// Debit an agent through the ledger and journal the flow.
    pub(crate) fn debit_agent(&mut self, id: AgentId, amount: Qi, flow: Flow) -> Result<Qi, WorldError> {
        let agent = self.agent_mut(id)?;
        qi::debit(&mut agent.qi, amount).map_err(|source| WorldError::Ledger {
            agent_id: id,
            source,
        })?;
        let balance = agent.qi;
        self.journal.record(flow, amount);
        Ok(balance)
    }

    fn debit_into(&mut self, from: AgentId, amount: Qi, flow: Flow) -> Result<Qi, WorldError> {
        let balance = self.debit_agent(from, amount, flow)?;
        let sink = match flow {
            Flow::Spent => &mut self.recycle_reserve,
            _ => &mut self.ambient_pool,
        };
        if let Err(err) = qi::credit(sink, amount) {
            self.agent_mut(from)?.qi += amount;
            return Err(WorldError::Pool(err));
        }
        Ok(balance)
    }

    /// Action cost. Returns the agent's new balance.
    pub(crate) fn spend(&mut self, from: AgentId, amount: Qi) -> Result<Qi, WorldError> {
        self.debit_into(from, amount, Flow::Spent)
    }

    pub(crate) fn release_to_pool(&mut self, from: AgentId, amount: Qi) -> Result<(), WorldError> {
        self.debit_into(from, amount, Flow::Released).map(|_| ())
    }

    /// Move up to `max` from the recycle reserve into a recharge node.
    pub(crate) fn recycle_into(&mut self, node_id: NodeId, max: Qi) -> Result<Qi, WorldError> {
        let node = self
            .recharge_nodes
            .get_mut(&node_id)
            .ok_or(WorldError::NodeNotFound(node_id))?;
        let amount = node.refill(max.min(self.recycle_reserve));
        qi::debit(&mut self.recycle_reserve, amount).map_err(WorldError::Pool)?;
        self.journal.record(Flow::Recycled, amount);
        Ok(amount)
    }

    /// Move Qi from one agent to another under a single journal entry.
    pub(crate) fn move_qi(&mut self, from: AgentId, to: AgentId, amount: Qi, flow: Flow) -> Result<(), WorldError> {
        if !self.agents.contains_key(&to) {
            return Err(WorldError::AgentNotFound(to));
        }
        let agent = self.agent_mut(from)?;
        qi::debit(&mut agent.qi, amount).map_err(|source| WorldError::Ledger {
            agent_id: from,
            source,
        })?;
        let target = self.agent_mut(to)?;
        if let Err(source) = qi::credit(&mut target.qi, amount) {
            self.agent_mut(from)?.qi += amount;
            return Err(WorldError::Ledger { agent_id: to, source });
        }
        self.journal.record(flow, amount);
        Ok(())
    }

    /// Verify the cross references a freshly loaded world depends on.
    pub fn check_consistency(&self) -> Result<(), WorldError> {
        let fail = |msg: String| Err(WorldError::Inconsistent(msg));
        let mut cells: BTreeSet<Position> = BTreeSet::new();

        for (id, agent) in &self.agents {
            if *id != agent.id {
                return fail(format!("agent key {} holds agent {}", id, agent.id));
            }
            if agent.id >= self.next_agent_id {
                return fail(format!("agent {} not below next id {}", agent.id, self.next_agent_id));
            }
            if !self.wallet_keys.contains_key(&agent.owner) {
                return fail(format!("agent {} owner {} has no key", agent.id, agent.owner));
            }
            if agent.is_alive() != agent.death.is_none() {
                return fail(format!("agent {} status and death reason disagree", agent.id));
            }
            if agent.is_alive() && !cells.insert(agent.position) {
                return fail(format!("two alive agents share {}", agent.position));
            }
            if let Some(parent) = agent.parent {
                if !self.agents.contains_key(&parent) {
                    return fail(format!("agent {} parent {} missing", agent.id, parent));
                }
            }
            if let Some(child) = agent.offspring.iter().find(|c| !self.agents.contains_key(c)) {
                return fail(format!("agent {} offspring {} missing", agent.id, child));
            }
        }

        let max_node = self
            .ore_nodes
            .keys()
            .chain(self.recharge_nodes.keys())
            .max()
            .copied();
        if let Some(max) = max_node {
            if max >= self.next_node_id {
                return fail(format!("node {} not below next id {}", max, self.next_node_id));
            }
        }
        for node in self.recharge_nodes.values() {
            if node.charge > node.capacity {
                return fail(format!("recharge node {} over capacity", node.id));
            }
        }

        for (id, s) in &self.structures {
            if *id != s.id || s.id >= self.next_structure_id {
                return fail(format!("structure {} has a bad id", id));
            }
            if !self.agents.contains_key(&s.owner) {
                return fail(format!("structure {} owner {} missing", s.id, s.owner));
            }
        }

        let zones: Vec<&Zone> = self.zones.values().collect();
        for (idx, zone) in zones.iter().enumerate() {
            if zone.id >= self.next_zone_id {
                return fail(format!("zone {} not below next id {}", zone.id, self.next_zone_id));
            }
            if !zone.members.contains(&zone.claimant) {
                return fail(format!("zone {} claimant is not a member", zone.id));
            }
            if let Some(m) = zone.members.iter().find(|m| !self.agents.contains_key(m)) {
                return fail(format!("zone {} member {} missing", zone.id, m));
            }
            if zones[idx + 1..].iter().any(|other| other.region.overlaps(&zone.region)) {
                return fail(format!("zone {} overlaps another zone", zone.id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const OWNER: &str = "owner";

    pub(crate) fn world_with_owner() -> WorldState {
        let mut world = WorldState::default();
        world.register_wallet_key(OWNER, "00");
        world
    }

    #[test]
    fn spawn_shifts_off_occupied_cells() {
        let mut world = world_with_owner();
        let a = world
            .insert_agent(AgentSpec {
                owner: OWNER.into(),
                qi: 1,
                position: Position::origin(),
                max_age: None,
            })
            .unwrap();
        world.agent_mut(a).unwrap().status = AgentStatus::Active;
        let b = world
            .insert_agent(AgentSpec {
                owner: OWNER.into(),
                qi: 1,
                position: Position::origin(),
                max_age: None,
            })
            .unwrap();
        assert_ne!(world.agent(a).unwrap().position, world.agent(b).unwrap().position);
        assert_eq!(world.agent(b).unwrap().position.distance(Position::origin()), 1);
    }

    #[test]
    fn unknown_owner_cannot_spawn() {
        let mut world = WorldState::default();
        let err = world
            .insert_agent(AgentSpec {
                owner: "nobody".into(),
                qi: 0,
                position: Position::origin(),
                max_age: None,
            })
            .unwrap_err();
        assert_eq!(err, WorldError::UnknownWallet("nobody".into()));
    }

    #[test]
    fn total_qi_counts_agents_and_pool() {
        let mut world = world_with_owner();
        let a = world
            .insert_agent(AgentSpec {
                owner: OWNER.into(),
                qi: 5,
                position: Position::origin(),
                max_age: None,
            })
            .unwrap();
        world.release_to_pool(a, 2).unwrap();
        assert_eq!(world.ambient_pool(), 2);
        assert_eq!(world.total_qi(), 5);
        assert_eq!(world.journal().released, 2);

        world.spend(a, 1).unwrap();
        assert_eq!(world.recycle_reserve(), 1);
        assert_eq!(world.total_qi(), 4);
        assert_eq!(world.qi_supply(), 5);
    }

    #[test]
    fn consistency_rejects_dangling_owner() {
        let mut world = world_with_owner();
        world
            .insert_agent(AgentSpec {
                owner: OWNER.into(),
                qi: 0,
                position: Position::origin(),
                max_age: None,
            })
            .unwrap();
        assert!(world.check_consistency().is_ok());
        world.wallet_keys.clear();
        assert!(matches!(
            world.check_consistency(),
            Err(WorldError::Inconsistent(_))
        ));
    }

    #[test]
    fn serialisation_is_stable() {
        let mut world = world_with_owner();
        world
            .add_ore_node(OreKind::Qi, Position::new(2, 0, 0), 9, None)
            .unwrap();
        let first = serde_json::to_vec(&world).unwrap();
        let reloaded: WorldState = serde_json::from_slice(&first).unwrap();
        assert_eq!(serde_json::to_vec(&reloaded).unwrap(), first);
    }
}
