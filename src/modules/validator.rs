use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::modules::action::{ActionKind, SignedAction};
use crate::modules::event::EventKind;
use crate::modules::observe::{self, Inspected, Observation};
use crate::modules::ore::{NodeId, OreKind};
use crate::modules::qi::{self, Flow, Qi};
use crate::modules::structure::{Structure, StructureKind};
use crate::modules::wallet::verify_signature;
use crate::modules::world::{Agent, AgentId, AgentSpec, AgentStatus, Position, WorldError, WorldState};
use crate::modules::zone::{Region, Zone, ZoneId};

/// Why an action was refused. Rejections are ordinary outcomes, not errors
/// of the runtime, and leave the world untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Rejection {
    #[error("agent {agent_id} not found")]
    AgentNotFound { agent_id: AgentId },
    #[error("agent {agent_id} is dead")]
    AgentDead { agent_id: AgentId },
    #[error("owner wallet {owner} has no registered key")]
    UnknownWallet { owner: String },
    #[error("signature does not verify against the owner key")]
    BadSignature,
    #[error("expected nonce {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("insufficient qi: required {required}, available {available}")]
    InsufficientQi { required: Qi, available: Qi },
    #[error("target {target} is outside the world bounds")]
    OutOfBounds { target: Position },
    #[error("move of {distance} exceeds max radius {max}")]
    MoveTooFar { distance: i32, max: i32 },
    #[error("move must change position")]
    ZeroMove,
    #[error("position {target} is held by agent {occupant}")]
    Occupied { target: Position, occupant: AgentId },
    #[error("target {target} is not adjacent")]
    NotAdjacent { target: Position },
    #[error("ore node {node_id} not found")]
    NodeNotFound { node_id: NodeId },
    #[error("ore node {node_id} is {distance} away, range is {range}")]
    NodeOutOfRange { node_id: NodeId, distance: i32, range: i32 },
    #[error("ore node {node_id} is depleted")]
    NodeDepleted { node_id: NodeId },
    #[error("no qi ore within range {range}")]
    NoOreInRange { range: i32 },
    #[error("a structure already stands at {target}")]
    CellOccupied { target: Position },
    #[error("zone {zone_id} requires membership to build at {target}")]
    ZonePermission { zone_id: ZoneId, target: Position },
    #[error("needs a transistor")]
    MissingTransistor,
    #[error("program of {len} bytes exceeds limit {max}")]
    ProgramTooLong { len: usize, max: usize },
    #[error("program is empty")]
    EmptyProgram,
    #[error("radius must be at least 1, got {radius}")]
    InvalidRadius { radius: i32 },
    #[error("zone half-size {size} exceeds max {max}")]
    ZoneTooLarge { size: i32, max: i32 },
    #[error("zone would overlap zone {other}")]
    ZoneOverlap { other: ZoneId },
    #[error("zone {zone_id} not found")]
    ZoneNotFound { zone_id: ZoneId },
    #[error("agent is not inside zone {zone_id}")]
    NotInZone { zone_id: ZoneId },
    #[error("already a member of zone {zone_id}")]
    AlreadyMember { zone_id: ZoneId },
    #[error("not a member of zone {zone_id}")]
    NotMember { zone_id: ZoneId },
    #[error("claimant cannot leave zone {zone_id}")]
    ClaimantCannotLeave { zone_id: ZoneId },
    #[error("only the claimant may change zone {zone_id}")]
    NotClaimant { zone_id: ZoneId },
    #[error("reproduction needs {threshold} qi, have {available}")]
    BelowReproductionThreshold { threshold: Qi, available: Qi },
    #[error("no free cell next to the parent")]
    NoFreeCell,
    #[error("inspect target not found")]
    TargetNotFound,
}

impl Rejection {
    pub const fn code(&self) -> &'static str {
        match self {
            Rejection::AgentNotFound { .. } => "agent_not_found",
            Rejection::AgentDead { .. } => "agent_dead",
            Rejection::UnknownWallet { .. } => "unknown_wallet",
            Rejection::BadSignature => "bad_signature",
            Rejection::BadNonce { .. } => "bad_nonce",
            Rejection::InsufficientQi { .. } => "insufficient_qi",
            Rejection::OutOfBounds { .. } => "out_of_bounds",
            Rejection::MoveTooFar { .. } => "move_too_far",
            Rejection::ZeroMove => "zero_move",
            Rejection::Occupied { .. } => "occupied",
            Rejection::NotAdjacent { .. } => "not_adjacent",
            Rejection::NodeNotFound { .. } => "node_not_found",
            Rejection::NodeOutOfRange { .. } => "node_out_of_range",
            Rejection::NodeDepleted { .. } => "node_depleted",
            Rejection::NoOreInRange { .. } => "no_ore_in_range",
            Rejection::CellOccupied { .. } => "cell_occupied",
            Rejection::ZonePermission { .. } => "zone_permission",
            Rejection::MissingTransistor => "missing_transistor",
            Rejection::ProgramTooLong { .. } => "program_too_long",
            Rejection::EmptyProgram => "empty_program",
            Rejection::InvalidRadius { .. } => "invalid_radius",
            Rejection::ZoneTooLarge { .. } => "zone_too_large",
            Rejection::ZoneOverlap { .. } => "zone_overlap",
            Rejection::ZoneNotFound { .. } => "zone_not_found",
            Rejection::NotInZone { .. } => "not_in_zone",
            Rejection::AlreadyMember { .. } => "already_member",
            Rejection::NotMember { .. } => "not_member",
            Rejection::ClaimantCannotLeave { .. } => "claimant_cannot_leave",
            Rejection::NotClaimant { .. } => "not_claimant",
            Rejection::BelowReproductionThreshold { .. } => "below_reproduction_threshold",
            Rejection::NoFreeCell => "no_free_cell",
            Rejection::TargetNotFound => "target_not_found",
        }
    }
}

/// Read-only result of a free action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum Report {
    Scan(Observation),
    Inspect(Inspected),
    Idle,
}

/// World change a validated action will make once applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    Observe(Report),
    Move { from: Position, to: Position },
    Mine { node_id: NodeId, ore: OreKind, amount: Qi },
    Build { kind: StructureKind, position: Position },
    PlaceBlock { position: Position },
    WriteProgram { position: Position, program: Vec<u8> },
    ClaimZone { region: Region },
    JoinZone { zone_id: ZoneId },
    LeaveZone { zone_id: ZoneId },
    ExpandZone { zone_id: ZoneId, region: Region },
    Reproduce { position: Position, endowment: Qi },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    pub agent_id: AgentId,
    pub nonce: u64,
    pub action: ActionKind,
    pub cost: Qi,
    pub change: Change,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accepted {
        effect: Effect,
        events: Vec<EventKind>,
    },
    Rejected {
        reason: Rejection,
        events: Vec<EventKind>,
    },
}

impl Verdict {
    pub fn events(&self) -> &[EventKind] {
        match self {
            Verdict::Accepted { events, .. } | Verdict::Rejected { events, .. } => events,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

/// Decide whether `action` is legal against `state`. Pure: the verdict
/// depends on nothing but the two arguments.
pub fn validate(state: &WorldState, action: &SignedAction) -> Result<Effect, Rejection> {
    let agent = state.agent(action.agent_id).ok_or(Rejection::AgentNotFound {
        agent_id: action.agent_id,
    })?;
    if !agent.is_alive() {
        return Err(Rejection::AgentDead {
            agent_id: agent.id,
        });
    }

    let key = state
        .wallet_key(&agent.owner)
        .ok_or_else(|| Rejection::UnknownWallet {
            owner: agent.owner.clone(),
        })?;
    if !verify_signature(key, &action.payload(), &action.signature) {
        return Err(Rejection::BadSignature);
    }

    let expected = agent.last_nonce + 1;
    if action.nonce != expected {
        return Err(Rejection::BadNonce {
            expected,
            got: action.nonce,
        });
    }

    let cost = action.kind.qi_cost();
    if agent.qi < cost {
        return Err(Rejection::InsufficientQi {
            required: cost,
            available: agent.qi,
        });
    }

    let change = check_target(state, agent, &action.kind, cost)?;
    Ok(Effect {
        agent_id: agent.id,
        nonce: action.nonce,
        action: action.kind.clone(),
        cost,
        change,
    })
}

fn check_target(state: &WorldState, agent: &Agent, kind: &ActionKind, cost: Qi) -> Result<Change, Rejection> {
    let rules = state.rules();
    let here = agent.position;

    let change = match kind {
        ActionKind::Scan => {
            let obs = observe::observe(state, agent.id).ok_or(Rejection::AgentNotFound {
                agent_id: agent.id,
            })?;
            Change::Observe(Report::Scan(obs))
        }
        ActionKind::Inspect { target } => {
            let found = observe::inspect(state, *target).ok_or(Rejection::TargetNotFound)?;
            Change::Observe(Report::Inspect(found))
        }
        ActionKind::Idle => Change::Observe(Report::Idle),
        ActionKind::Move { dx, dy, dz } => {
            let distance = i32::try_from(dx.unsigned_abs().max(dy.unsigned_abs()).max(dz.unsigned_abs()))
                .unwrap_or(i32::MAX);
            if distance == 0 {
                return Err(Rejection::ZeroMove);
            }
            if distance > rules.max_move_radius {
                return Err(Rejection::MoveTooFar {
                    distance,
                    max: rules.max_move_radius,
                });
            }
            let to = here.offset(*dx, *dy, *dz);
            check_bounds(state, to)?;
            if let Some(occupant) = state.occupant(to) {
                return Err(Rejection::Occupied { target: to, occupant });
            }
            Change::Move { from: here, to }
        }
        ActionKind::Mine { node_id } => {
            let node = state.ore_node(*node_id).ok_or(Rejection::NodeNotFound {
                node_id: *node_id,
            })?;
            let distance = here.distance(node.position);
            if distance > rules.harvest_range {
                return Err(Rejection::NodeOutOfRange {
                    node_id: node.id,
                    distance,
                    range: rules.harvest_range,
                });
            }
            if node.remaining == 0 {
                return Err(Rejection::NodeDepleted { node_id: node.id });
            }
            Change::Mine {
                node_id: node.id,
                ore: node.ore,
                amount: node.remaining.min(rules.harvest_per_action),
            }
        }
        ActionKind::HarvestQiOre => {
            let node = state
                .ore_nodes()
                .filter(|n| {
                    n.ore == OreKind::Qi && n.remaining > 0 && here.within_range(n.position, rules.harvest_range)
                })
                .min_by_key(|n| (here.manhattan(n.position), n.id))
                .ok_or(Rejection::NoOreInRange {
                    range: rules.harvest_range,
                })?;
            Change::Mine {
                node_id: node.id,
                ore: node.ore,
                amount: node.remaining.min(rules.harvest_per_action),
            }
        }
        ActionKind::Build { kind } => {
            check_buildable(state, agent, here)?;
            if kind.needs_transistor() && agent.transistors == 0 {
                return Err(Rejection::MissingTransistor);
            }
            Change::Build {
                kind: *kind,
                position: here,
            }
        }
        ActionKind::PlaceBlock { dx, dy, dz } => {
            let target = here.offset(*dx, *dy, *dz);
            if here.distance(target) != 1 {
                return Err(Rejection::NotAdjacent { target });
            }
            check_bounds(state, target)?;
            check_buildable(state, agent, target)?;
            Change::PlaceBlock { position: target }
        }
        ActionKind::WriteProgram { program } => {
            if program.is_empty() {
                return Err(Rejection::EmptyProgram);
            }
            if program.len() > rules.max_program_len {
                return Err(Rejection::ProgramTooLong {
                    len: program.len(),
                    max: rules.max_program_len,
                });
            }
            if agent.transistors == 0 {
                return Err(Rejection::MissingTransistor);
            }
            check_buildable(state, agent, here)?;
            Change::WriteProgram {
                position: here,
                program: program.clone(),
            }
        }
        ActionKind::ClaimZone { radius } => {
            if *radius < 1 {
                return Err(Rejection::InvalidRadius { radius: *radius });
            }
            if *radius > rules.max_zone_radius {
                return Err(Rejection::ZoneTooLarge {
                    size: *radius,
                    max: rules.max_zone_radius,
                });
            }
            let region = Region::around(here, *radius);
            check_region(state, region, None)?;
            Change::ClaimZone { region }
        }
        ActionKind::JoinZone { zone_id } => {
            let zone = find_zone(state, *zone_id)?;
            if !zone.region.contains(here) {
                return Err(Rejection::NotInZone { zone_id: zone.id });
            }
            if zone.is_member(agent.id) {
                return Err(Rejection::AlreadyMember { zone_id: zone.id });
            }
            Change::JoinZone { zone_id: zone.id }
        }
        ActionKind::LeaveZone { zone_id } => {
            let zone = find_zone(state, *zone_id)?;
            if !zone.is_member(agent.id) {
                return Err(Rejection::NotMember { zone_id: zone.id });
            }
            if zone.claimant == agent.id {
                return Err(Rejection::ClaimantCannotLeave { zone_id: zone.id });
            }
            Change::LeaveZone { zone_id: zone.id }
        }
        ActionKind::ExpandZone { zone_id, by } => {
            let zone = find_zone(state, *zone_id)?;
            if zone.claimant != agent.id {
                return Err(Rejection::NotClaimant { zone_id: zone.id });
            }
            if *by < 1 {
                return Err(Rejection::InvalidRadius { radius: *by });
            }
            let region = zone.region.grow(*by);
            if region.half_size() > rules.max_zone_radius {
                return Err(Rejection::ZoneTooLarge {
                    size: region.half_size(),
                    max: rules.max_zone_radius,
                });
            }
            check_region(state, region, Some(zone.id))?;
            Change::ExpandZone {
                zone_id: zone.id,
                region,
            }
        }
        ActionKind::Reproduce => {
            if agent.qi < rules.reproduction_threshold {
                return Err(Rejection::BelowReproductionThreshold {
                    threshold: rules.reproduction_threshold,
                    available: agent.qi,
                });
            }
            let position = state.free_cell_near(here, 1).ok_or(Rejection::NoFreeCell)?;
            let remaining = agent.qi - cost;
            let endowment = remaining.saturating_mul(rules.child_qi_percent.min(100) as Qi) / 100;
            Change::Reproduce { position, endowment }
        }
    };
    Ok(change)
}

fn check_bounds(state: &WorldState, target: Position) -> Result<(), Rejection> {
    if target.in_bounds(state.rules().half_extent) {
        Ok(())
    } else {
        Err(Rejection::OutOfBounds { target })
    }
}

fn check_buildable(state: &WorldState, agent: &Agent, target: Position) -> Result<(), Rejection> {
    if state.structure_at(target).is_some() {
        return Err(Rejection::CellOccupied { target });
    }
    if let Some(zone) = state.zone_at(target) {
        if !zone.is_member(agent.id) {
            return Err(Rejection::ZonePermission {
                zone_id: zone.id,
                target,
            });
        }
    }
    Ok(())
}

fn check_region(state: &WorldState, region: Region, skip: Option<ZoneId>) -> Result<(), Rejection> {
    if !region.within_bounds(state.rules().half_extent) {
        return Err(Rejection::OutOfBounds { target: region.max });
    }
    if let Some(other) = state
        .zones()
        .find(|z| Some(z.id) != skip && z.region.overlaps(&region))
    {
        return Err(Rejection::ZoneOverlap { other: other.id });
    }
    Ok(())
}

fn find_zone(state: &WorldState, zone_id: ZoneId) -> Result<&Zone, Rejection> {
    state.zone(zone_id).ok_or(Rejection::ZoneNotFound { zone_id })
}

/// Commit a validated effect. Errors here are ledger faults, not rejections,
/// and abort the tick.
pub fn apply(state: &mut WorldState, effect: Effect) -> Result<Vec<EventKind>, WorldError> {
    let Effect {
        agent_id,
        nonce,
        action,
        cost,
        change,
    } = effect;
    let mut events = Vec::new();

    state.agent_mut(agent_id)?.last_nonce = nonce;
    if cost > 0 {
        state.spend(agent_id, cost)?;
        events.push(EventKind::QiSpent {
            agent_id,
            amount: cost,
            action: action.label().to_string(),
        });
    }

    match change {
        Change::Observe(_) => events.push(EventKind::ActionObserved {
            agent_id,
            action: action.token(),
            nonce,
        }),
        Change::Move { from, to } => {
            state.agent_mut(agent_id)?.position = to;
            events.push(EventKind::AgentMoved { agent_id, from, to });
        }
        Change::Mine { node_id, ore, amount } => {
            let node = state
                .ore_nodes
                .get_mut(&node_id)
                .ok_or(WorldError::NodeNotFound(node_id))?;
            let taken = node.extract(amount);
            let remaining = node.remaining;
            let position = node.position;
            match ore {
                OreKind::Qi => {
                    state.credit_agent(agent_id, taken, Flow::Mined)?;
                    events.push(EventKind::QiGained {
                        agent_id,
                        amount: taken,
                        source: format!("ore_node:{}", node_id),
                    });
                }
                OreKind::Transistor => {
                    let agent = state.agent_mut(agent_id)?;
                    qi::credit(&mut agent.transistors, taken)
                        .map_err(|source| WorldError::Ledger { agent_id, source })?;
                }
            }
            events.push(EventKind::OreMined {
                agent_id,
                node_id,
                ore,
                amount: taken,
                remaining,
            });
            if remaining == 0 {
                events.push(EventKind::OreNodeDrained {
                    node_id,
                    ore,
                    position,
                });
            }
        }
        Change::Build { kind, position } => {
            if kind.needs_transistor() {
                take_transistor(state, agent_id)?;
            }
            let structure_id = place(state, agent_id, kind, position, None);
            events.push(EventKind::StructureBuilt {
                agent_id,
                structure_id,
                kind,
                position,
            });
        }
        Change::PlaceBlock { position } => {
            let structure_id = place(state, agent_id, StructureKind::Block, position, None);
            events.push(EventKind::BlockPlaced {
                agent_id,
                structure_id,
                position,
            });
        }
        Change::WriteProgram { position, program } => {
            take_transistor(state, agent_id)?;
            let len = program.len();
            let structure_id = place(state, agent_id, StructureKind::Programmable, position, Some(program));
            events.push(EventKind::ProgramWritten {
                agent_id,
                structure_id,
                position,
                len,
            });
        }
        Change::ClaimZone { region } => {
            let zone_id = state.next_zone_id();
            state.zones.insert(
                zone_id,
                Zone {
                    id: zone_id,
                    region,
                    claimant: agent_id,
                    members: [agent_id].into_iter().collect(),
                },
            );
            events.push(EventKind::ZoneClaimed {
                agent_id,
                zone_id,
                region,
            });
        }
        Change::JoinZone { zone_id } => {
            zone_mut(state, zone_id)?.members.insert(agent_id);
            events.push(EventKind::ZoneJoined { agent_id, zone_id });
        }
        Change::LeaveZone { zone_id } => {
            zone_mut(state, zone_id)?.members.remove(&agent_id);
            events.push(EventKind::ZoneLeft { agent_id, zone_id });
        }
        Change::ExpandZone { zone_id, region } => {
            zone_mut(state, zone_id)?.region = region;
            events.push(EventKind::ZoneExpanded {
                agent_id,
                zone_id,
                region,
            });
        }
        Change::Reproduce { position, endowment } => {
            let parent = state.agent_mut(agent_id)?.clone();
            let child = state.insert_agent(AgentSpec {
                owner: parent.owner.clone(),
                qi: 0,
                position,
                max_age: Some(parent.max_age),
            })?;
            let memory_limit = state.rules().child_memory_limit;
            {
                let c = state.agent_mut(child)?;
                c.status = AgentStatus::Active;
                c.parent = Some(agent_id);
                let skip = parent.memory.len().saturating_sub(memory_limit);
                c.memory = parent.memory.iter().skip(skip).cloned().collect();
            }
            state.agent_mut(agent_id)?.offspring.push(child);
            state.move_qi(agent_id, child, endowment, Flow::Endowed)?;
            let child_agent = state.agent_mut(child)?;
            events.push(EventKind::AgentSpawned {
                agent_id: child,
                owner: child_agent.owner.clone(),
                qi: child_agent.qi,
                position: child_agent.position,
                parent: Some(agent_id),
            });
            events.push(EventKind::AgentReproduced {
                parent: agent_id,
                child,
                endowment,
            });
        }
    }
    Ok(events)
}

fn take_transistor(state: &mut WorldState, agent_id: AgentId) -> Result<(), WorldError> {
    let agent = state.agent_mut(agent_id)?;
    qi::debit(&mut agent.transistors, 1).map_err(|source| WorldError::Ledger { agent_id, source })
}

fn place(
    state: &mut WorldState,
    owner: AgentId,
    kind: StructureKind,
    position: Position,
    program: Option<Vec<u8>>,
) -> u64 {
    let id = state.next_structure_id();
    state.structures.insert(
        id,
        Structure {
            id,
            kind,
            position,
            owner,
            program,
        },
    );
    id
}

fn zone_mut(state: &mut WorldState, zone_id: ZoneId) -> Result<&mut Zone, WorldError> {
    state
        .zones
        .get_mut(&zone_id)
        .ok_or_else(|| WorldError::Inconsistent(format!("zone {} vanished", zone_id)))
}

/// Validate then, if legal, apply. A rejection yields exactly one
/// `action_rejected` event and no state change.
pub fn validate_and_apply(state: &mut WorldState, action: &SignedAction) -> Result<Verdict, WorldError> {
    match validate(state, action) {
        Ok(effect) => {
            let events = apply(state, effect.clone())?;
            Ok(Verdict::Accepted { effect, events })
        }
        Err(reason) => {
            debug!(
                agent_id = action.agent_id,
                action = %action.kind,
                nonce = action.nonce,
                code = reason.code(),
                %reason,
                "action rejected"
            );
            let events = vec![EventKind::ActionRejected {
                agent_id: action.agent_id,
                action: action.kind.token(),
                nonce: action.nonce,
                code: reason.code().to_string(),
                reason: reason.to_string(),
            }];
            Ok(Verdict::Rejected { reason, events })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::testkit::Sandbox;

    fn names(events: &[EventKind]) -> Vec<&'static str> {
        events.iter().map(EventKind::name).collect()
    }

    #[test]
    fn paid_move_debits_and_moves() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let verdict = sb.submit(id, "move:1,0,0");

        assert!(verdict.is_accepted());
        assert_eq!(names(verdict.events()), ["qi_spent", "agent_moved"]);
        let agent = sb.world.agent(id).unwrap();
        assert_eq!(agent.qi, 2);
        assert_eq!(agent.position, Position::new(1, 0, 0));
        assert_eq!(agent.last_nonce, 1);
    }

    #[test]
    fn harvest_without_qi_is_rejected_cleanly() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(0, Position::origin());
        sb.world
            .add_ore_node(OreKind::Qi, Position::new(1, 0, 0), 10, None)
            .unwrap();
        let before = sb.world.clone();
        let verdict = sb.submit(id, "harvest_qi_ore");

        match &verdict {
            Verdict::Rejected { reason, events } => {
                assert!(matches!(reason, Rejection::InsufficientQi { required: 1, available: 0 }));
                assert_eq!(names(events), ["action_rejected"]);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(sb.world, before);
    }

    #[test]
    fn rejected_action_keeps_the_nonce_free() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let rejected = sb.submit(id, "move:9,0,0");
        assert!(!rejected.is_accepted());
        assert_eq!(sb.world.agent(id).unwrap().last_nonce, 0);

        let accepted = sb.submit(id, "move:1,0,0");
        assert!(accepted.is_accepted());
        assert_eq!(sb.world.agent(id).unwrap().last_nonce, 1);
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let action = sb.sign(id, 1, "scan");
        assert!(validate_and_apply(&mut sb.world, &action).unwrap().is_accepted());
        let replay = validate_and_apply(&mut sb.world, &action).unwrap();
        assert!(matches!(
            replay,
            Verdict::Rejected {
                reason: Rejection::BadNonce { expected: 2, got: 1 },
                ..
            }
        ));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let mut action = sb.sign(id, 1, "move:1,0,0");
        action.kind = ActionKind::Move { dx: 0, dy: 1, dz: 0 };
        assert_eq!(validate(&sb.world, &action), Err(Rejection::BadSignature));
    }

    #[test]
    fn free_actions_cost_nothing_but_use_a_nonce() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(0, Position::origin());
        let verdict = sb.submit(id, "scan");
        match verdict {
            Verdict::Accepted { effect, events } => {
                assert!(matches!(effect.change, Change::Observe(Report::Scan(_))));
                assert_eq!(names(&events), ["action_observed"]);
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
        assert_eq!(sb.world.agent(id).unwrap().qi, 0);
        assert_eq!(sb.world.agent(id).unwrap().last_nonce, 1);
    }

    #[test]
    fn cannot_move_onto_another_agent() {
        let mut sb = Sandbox::new();
        let a = sb.spawn(3, Position::origin());
        let b = sb.spawn(3, Position::new(1, 0, 0));
        let verdict = sb.submit(a, "move:1,0,0");
        assert!(matches!(
            verdict,
            Verdict::Rejected {
                reason: Rejection::Occupied { occupant, .. },
                ..
            } if occupant == b
        ));
    }

    #[test]
    fn move_must_stay_in_bounds() {
        let mut sb = Sandbox::new();
        let edge = sb.world.rules().half_extent;
        let id = sb.spawn(3, Position::new(edge, 0, 0));
        let verdict = sb.submit(id, "move:1,0,0");
        assert!(matches!(
            verdict,
            Verdict::Rejected {
                reason: Rejection::OutOfBounds { .. },
                ..
            }
        ));
    }

    #[test]
    fn harvest_prefers_nearest_then_lowest_id() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let far = sb
            .world
            .add_ore_node(OreKind::Qi, Position::new(1, 1, 0), 10, None)
            .unwrap();
        let near = sb
            .world
            .add_ore_node(OreKind::Qi, Position::new(1, 0, 0), 2, None)
            .unwrap();
        let verdict = sb.submit(id, "harvest_qi_ore");
        match verdict {
            Verdict::Accepted { effect, events } => {
                assert_eq!(
                    effect.change,
                    Change::Mine {
                        node_id: near,
                        ore: OreKind::Qi,
                        amount: 2
                    }
                );
                assert_eq!(names(&events), ["qi_spent", "qi_gained", "ore_mined", "ore_node_drained"]);
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
        assert_eq!(sb.world.agent(id).unwrap().qi, 4);
        assert_eq!(sb.world.ore_node(far).unwrap().remaining, 10);

        let next = sb.submit(id, "harvest_qi_ore");
        assert!(next.is_accepted());
        assert_eq!(sb.world.ore_node(far).unwrap().remaining, 7);
    }

    #[test]
    fn transistor_ore_fills_inventory_for_programs() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(5, Position::origin());
        let node = sb
            .world
            .add_ore_node(OreKind::Transistor, Position::new(0, 1, 0), 1, None)
            .unwrap();
        assert!(matches!(
            sb.submit(id, "write_program:01"),
            Verdict::Rejected {
                reason: Rejection::MissingTransistor,
                ..
            }
        ));
        assert!(sb.submit(id, &format!("mine:{}", node)).is_accepted());
        assert_eq!(sb.world.agent(id).unwrap().transistors, 1);
        assert_eq!(sb.world.agent(id).unwrap().qi, 4);

        let verdict = sb.submit(id, "write_program:0102");
        assert_eq!(names(verdict.events()), ["qi_spent", "program_written"]);
        let agent = sb.world.agent(id).unwrap();
        assert_eq!(agent.transistors, 0);
        let structure = sb.world.structure_at(Position::origin()).unwrap();
        assert_eq!(structure.program.as_deref(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn building_needs_an_empty_cell() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(5, Position::origin());
        assert!(sb.submit(id, "build:basic").is_accepted());
        assert!(matches!(
            sb.submit(id, "build:basic"),
            Verdict::Rejected {
                reason: Rejection::CellOccupied { .. },
                ..
            }
        ));
        assert!(sb.submit(id, "place_block:1,0,0").is_accepted());
        assert!(matches!(
            sb.submit(id, "place_block:2,0,0"),
            Verdict::Rejected {
                reason: Rejection::NotAdjacent { .. },
                ..
            }
        ));
    }

    #[test]
    fn zones_gate_building_and_membership() {
        let mut sb = Sandbox::new();
        let owner = sb.spawn(10, Position::origin());
        let guest = sb.spawn(10, Position::new(2, 0, 0));

        assert!(sb.submit(owner, "claim_zone:2").is_accepted());
        let zone_id = sb.world.zones().next().unwrap().id;

        assert!(matches!(
            sb.submit(guest, "build:basic"),
            Verdict::Rejected {
                reason: Rejection::ZonePermission { .. },
                ..
            }
        ));
        assert!(sb.submit(guest, &format!("join_zone:{}", zone_id)).is_accepted());
        assert!(sb.submit(guest, "build:basic").is_accepted());
        assert!(matches!(
            sb.submit(guest, &format!("expand_zone:{},1", zone_id)),
            Verdict::Rejected {
                reason: Rejection::NotClaimant { .. },
                ..
            }
        ));
        assert!(matches!(
            sb.submit(owner, &format!("leave_zone:{}", zone_id)),
            Verdict::Rejected {
                reason: Rejection::ClaimantCannotLeave { .. },
                ..
            }
        ));
        assert!(sb.submit(guest, &format!("leave_zone:{}", zone_id)).is_accepted());
        assert!(sb.submit(owner, &format!("expand_zone:{},1", zone_id)).is_accepted());
        assert_eq!(sb.world.zone(zone_id).unwrap().region.half_size(), 3);
    }

    #[test]
    fn extreme_offsets_are_rejected_not_wrapped() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(10, Position::origin());

        let verdict = sb.submit_kind(id, ActionKind::Move { dx: i32::MIN, dy: 0, dz: 0 });
        assert!(matches!(
            verdict,
            Verdict::Rejected {
                reason: Rejection::MoveTooFar { distance: i32::MAX, .. },
                ..
            }
        ));
        let verdict = sb.submit_kind(id, ActionKind::PlaceBlock { dx: i32::MIN, dy: i32::MAX, dz: 0 });
        assert!(matches!(
            verdict,
            Verdict::Rejected {
                reason: Rejection::NotAdjacent { .. },
                ..
            }
        ));

        assert!(sb.submit(id, "claim_zone:1").is_accepted());
        let zone_id = sb.world.zones().next().unwrap().id;
        let verdict = sb.submit_kind(id, ActionKind::ExpandZone { zone_id, by: i32::MAX });
        assert!(matches!(
            verdict,
            Verdict::Rejected {
                reason: Rejection::ZoneTooLarge { size: i32::MAX, .. },
                ..
            }
        ));
        assert_eq!(sb.world.zone(zone_id).unwrap().region.half_size(), 1);
        assert_eq!(sb.world.agent(id).unwrap().position, Position::origin());
    }

    #[test]
    fn zones_cannot_overlap() {
        let mut sb = Sandbox::new();
        let a = sb.spawn(10, Position::origin());
        let b = sb.spawn(10, Position::new(3, 0, 0));
        assert!(sb.submit(a, "claim_zone:1").is_accepted());
        assert!(matches!(
            sb.submit(b, "claim_zone:2"),
            Verdict::Rejected {
                reason: Rejection::ZoneOverlap { .. },
                ..
            }
        ));
        assert!(matches!(
            sb.submit(b, "claim_zone:99"),
            Verdict::Rejected {
                reason: Rejection::ZoneTooLarge { .. },
                ..
            }
        ));
    }

    #[test]
    fn reproduction_endows_child_next_to_parent() {
        let mut sb = Sandbox::new();
        let parent = sb.spawn(9, Position::origin());
        let verdict = sb.submit(parent, "reproduce");
        assert_eq!(names(verdict.events()), ["qi_spent", "agent_spawned", "agent_reproduced"]);

        let p = sb.world.agent(parent).unwrap();
        let child_id = p.offspring[0];
        let child = sb.world.agent(child_id).unwrap();
        assert_eq!(child.qi, 4);
        assert_eq!(p.qi, 4);
        assert_eq!(child.parent, Some(parent));
        assert_eq!(child.position.distance(p.position), 1);
        assert_eq!(child.status, AgentStatus::Active);
        assert_eq!(child.max_age, p.max_age);
    }

    #[test]
    fn reproduction_needs_threshold() {
        let mut sb = Sandbox::new();
        let parent = sb.spawn(3, Position::origin());
        assert!(matches!(
            sb.submit(parent, "reproduce"),
            Verdict::Rejected {
                reason: Rejection::BelowReproductionThreshold { .. },
                ..
            }
        ));
    }

    #[test]
    fn dead_agents_cannot_act() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        sb.world.agent_mut(id).unwrap().status = AgentStatus::Dead;
        let action = sb.sign(id, 1, "scan");
        assert_eq!(
            validate(&sb.world, &action),
            Err(Rejection::AgentDead { agent_id: id })
        );
    }
}
