use serde::{Deserialize, Serialize};

use crate::modules::action::InspectTarget;
use crate::modules::ore::{NodeId, OreKind, OreNode, RechargeNode};
use crate::modules::qi::Qi;
use crate::modules::structure::{Structure, StructureId, StructureKind};
use crate::modules::world::{Agent, AgentId, AgentStatus, Position, WorldState};
use crate::modules::zone::{Region, Zone, ZoneId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearbyAgent {
    pub id: AgentId,
    pub position: Position,
    pub distance: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearbyOre {
    pub id: NodeId,
    pub ore: OreKind,
    pub position: Position,
    pub remaining: Qi,
    pub distance: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearbyRecharge {
    pub id: NodeId,
    pub position: Position,
    pub charge: Qi,
    pub distance: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearbyStructure {
    pub id: StructureId,
    pub kind: StructureKind,
    pub position: Position,
    pub owner: AgentId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NearbyZone {
    pub id: ZoneId,
    pub region: Region,
    pub claimant: AgentId,
    pub member: bool,
}

/// What an agent can see at the moment it is asked to decide.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub tick: u64,
    pub agent_id: AgentId,
    pub position: Position,
    pub qi: Qi,
    pub transistors: Qi,
    pub age: u64,
    pub max_age: u64,
    pub status: AgentStatus,
    pub next_nonce: u64,
    pub agents: Vec<NearbyAgent>,
    pub ore_nodes: Vec<NearbyOre>,
    pub recharge_nodes: Vec<NearbyRecharge>,
    pub structures: Vec<NearbyStructure>,
    pub zones: Vec<NearbyZone>,
    pub memory: Vec<String>,
}

/// Build the observation for `agent_id` from the current state. Everything
/// is limited to `rules.scan_range` and listed in id order.
pub fn observe(state: &WorldState, agent_id: AgentId) -> Option<Observation> {
    let me = state.agent(agent_id)?;
    let range = state.rules().scan_range;
    let here = me.position;

    let agents = state
        .agents()
        .filter(|a| a.is_alive() && a.id != agent_id && here.within_range(a.position, range))
        .map(|a| NearbyAgent {
            id: a.id,
            position: a.position,
            distance: here.distance(a.position),
        })
        .collect();
    let ore_nodes = state
        .ore_nodes()
        .filter(|n| here.within_range(n.position, range))
        .map(|n| NearbyOre {
            id: n.id,
            ore: n.ore,
            position: n.position,
            remaining: n.remaining,
            distance: here.distance(n.position),
        })
        .collect();
    let recharge_nodes = state
        .recharge_nodes()
        .filter(|n| here.within_range(n.position, range))
        .map(|n| NearbyRecharge {
            id: n.id,
            position: n.position,
            charge: n.charge,
            distance: here.distance(n.position),
        })
        .collect();
    let structures = state
        .structures()
        .filter(|s| here.within_range(s.position, range))
        .map(|s| NearbyStructure {
            id: s.id,
            kind: s.kind,
            position: s.position,
            owner: s.owner,
        })
        .collect();
    let zones = state
        .zones()
        .filter(|z| z.region.grow(range).contains(here))
        .map(|z| NearbyZone {
            id: z.id,
            region: z.region,
            claimant: z.claimant,
            member: z.is_member(agent_id),
        })
        .collect();

    Some(Observation {
        tick: state.tick(),
        agent_id,
        position: here,
        qi: me.qi,
        transistors: me.transistors,
        age: me.age,
        max_age: me.max_age,
        status: me.status,
        next_nonce: me.last_nonce + 1,
        agents,
        ore_nodes,
        recharge_nodes,
        structures,
        zones,
        memory: me.memory.iter().cloned().collect(),
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum Inspected {
    Agent {
        id: AgentId,
        position: Position,
        qi: Qi,
        age: u64,
        max_age: u64,
        status: AgentStatus,
        parent: Option<AgentId>,
        offspring: Vec<AgentId>,
    },
    Structure(Structure),
    OreNode(OreNode),
    RechargeNode(RechargeNode),
    Zone(Zone),
}

impl Inspected {
    fn agent(a: &Agent) -> Self {
        Inspected::Agent {
            id: a.id,
            position: a.position,
            qi: a.qi,
            age: a.age,
            max_age: a.max_age,
            status: a.status,
            parent: a.parent,
            offspring: a.offspring.clone(),
        }
    }
}

pub fn inspect(state: &WorldState, target: InspectTarget) -> Option<Inspected> {
    match target {
        InspectTarget::Agent(id) => state.agent(id).map(Inspected::agent),
        InspectTarget::Structure(id) => state.structure(id).cloned().map(Inspected::Structure),
        InspectTarget::OreNode(id) => state.ore_node(id).cloned().map(Inspected::OreNode),
        InspectTarget::RechargeNode(id) => state
            .recharge_node(id)
            .cloned()
            .map(Inspected::RechargeNode),
        InspectTarget::Zone(id) => state.zone(id).cloned().map(Inspected::Zone),
    }
}
