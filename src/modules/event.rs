use serde::{Deserialize, Serialize};

use crate::modules::ore::{NodeId, OreKind};
use crate::modules::qi::Qi;
use crate::modules::structure::{StructureId, StructureKind};
use crate::modules::world::{AgentId, DeathReason, Position};
use crate::modules::zone::{Region, ZoneId};

/// One entry of the append-only event log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub tick: u64,
    /// Position of the event within its tick.
    pub seq: u32,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    TickStarted,
    TickCompleted {
        total_qi: Qi,
    },
    AgentSpawned {
        agent_id: AgentId,
        owner: String,
        qi: Qi,
        position: Position,
        parent: Option<AgentId>,
    },
    ActionObserved {
        agent_id: AgentId,
        action: String,
        nonce: u64,
    },
    ActionRejected {
        agent_id: AgentId,
        action: String,
        nonce: u64,
        code: String,
        reason: String,
    },
    QiSpent {
        agent_id: AgentId,
        amount: Qi,
        action: String,
    },
    QiGained {
        agent_id: AgentId,
        amount: Qi,
        source: String,
    },
    AgentMoved {
        agent_id: AgentId,
        from: Position,
        to: Position,
    },
    OreMined {
        agent_id: AgentId,
        node_id: NodeId,
        ore: OreKind,
        amount: Qi,
        remaining: Qi,
    },
    OreNodeDrained {
        node_id: NodeId,
        ore: OreKind,
        position: Position,
    },
    OreDecayed {
        node_id: NodeId,
        amount: Qi,
        remaining: Qi,
    },
    RechargeDocked {
        agent_id: AgentId,
        node_id: NodeId,
        amount: Qi,
    },
    RechargeRegenerated {
        node_id: NodeId,
        charge: Qi,
    },
    QiRecycled {
        node_id: NodeId,
        amount: Qi,
    },
    StructureBuilt {
        agent_id: AgentId,
        structure_id: StructureId,
        kind: StructureKind,
        position: Position,
    },
    BlockPlaced {
        agent_id: AgentId,
        structure_id: StructureId,
        position: Position,
    },
    ProgramWritten {
        agent_id: AgentId,
        structure_id: StructureId,
        position: Position,
        len: usize,
    },
    ZoneClaimed {
        agent_id: AgentId,
        zone_id: ZoneId,
        region: Region,
    },
    ZoneJoined {
        agent_id: AgentId,
        zone_id: ZoneId,
    },
    ZoneLeft {
        agent_id: AgentId,
        zone_id: ZoneId,
    },
    ZoneExpanded {
        agent_id: AgentId,
        zone_id: ZoneId,
        region: Region,
    },
    AgentReproduced {
        parent: AgentId,
        child: AgentId,
        endowment: Qi,
    },
    AgentStalled {
        agent_id: AgentId,
    },
    AgentRecovered {
        agent_id: AgentId,
        qi: Qi,
    },
    AgentDied {
        agent_id: AgentId,
        reason: DeathReason,
        age: u64,
    },
    QiInherited {
        from: AgentId,
        heir: AgentId,
        amount: Qi,
    },
    QiReleased {
        agent_id: AgentId,
        amount: Qi,
    },
}

impl EventKind {
    /// Snake-case name used in the log and in summaries.
    pub const fn name(&self) -> &'static str {
        match self {
            EventKind::TickStarted => "tick_started",
            EventKind::TickCompleted { .. } => "tick_completed",
            EventKind::AgentSpawned { .. } => "agent_spawned",
            EventKind::ActionObserved { .. } => "action_observed",
            EventKind::ActionRejected { .. } => "action_rejected",
            EventKind::QiSpent { .. } => "qi_spent",
            EventKind::QiGained { .. } => "qi_gained",
            EventKind::AgentMoved { .. } => "agent_moved",
            EventKind::OreMined { .. } => "ore_mined",
            EventKind::OreNodeDrained { .. } => "ore_node_drained",
            EventKind::OreDecayed { .. } => "ore_decayed",
            EventKind::RechargeDocked { .. } => "recharge_docked",
            EventKind::RechargeRegenerated { .. } => "recharge_regenerated",
            EventKind::QiRecycled { .. } => "qi_recycled",
            EventKind::StructureBuilt { .. } => "structure_built",
            EventKind::BlockPlaced { .. } => "block_placed",
            EventKind::ProgramWritten { .. } => "program_written",
            EventKind::ZoneClaimed { .. } => "zone_claimed",
            EventKind::ZoneJoined { .. } => "zone_joined",
            EventKind::ZoneLeft { .. } => "zone_left",
            EventKind::ZoneExpanded { .. } => "zone_expanded",
            EventKind::AgentReproduced { .. } => "agent_reproduced",
            EventKind::AgentStalled { .. } => "agent_stalled",
            EventKind::AgentRecovered { .. } => "agent_recovered",
            EventKind::AgentDied { .. } => "agent_died",
            EventKind::QiInherited { .. } => "qi_inherited",
            EventKind::QiReleased { .. } => "qi_released",
        }
    }

    /// Agent the event is about, if any.
    pub fn agent(&self) -> Option<AgentId> {
        match self {
            EventKind::AgentSpawned { agent_id, .. }
            | EventKind::ActionObserved { agent_id, .. }
            | EventKind::ActionRejected { agent_id, .. }
            | EventKind::QiSpent { agent_id, .. }
            | EventKind::QiGained { agent_id, .. }
            | EventKind::AgentMoved { agent_id, .. }
            | EventKind::OreMined { agent_id, .. }
            | EventKind::RechargeDocked { agent_id, .. }
            | EventKind::StructureBuilt { agent_id, .. }
            | EventKind::BlockPlaced { agent_id, .. }
            | EventKind::ProgramWritten { agent_id, .. }
            | EventKind::ZoneClaimed { agent_id, .. }
            | EventKind::ZoneJoined { agent_id, .. }
            | EventKind::ZoneLeft { agent_id, .. }
            | EventKind::ZoneExpanded { agent_id, .. }
            | EventKind::AgentStalled { agent_id }
            | EventKind::AgentRecovered { agent_id, .. }
            | EventKind::AgentDied { agent_id, .. }
            | EventKind::QiReleased { agent_id, .. } => Some(*agent_id),
            EventKind::AgentReproduced { parent, .. } => Some(*parent),
            EventKind::QiInherited { from, .. } => Some(*from),
            EventKind::TickStarted
            | EventKind::TickCompleted { .. }
            | EventKind::OreNodeDrained { .. }
            | EventKind::OreDecayed { .. }
            | EventKind::RechargeRegenerated { .. }
            | EventKind::QiRecycled { .. } => None,
        }
    }
}

/// Stamps event kinds with their tick and in-tick sequence number.
#[derive(Debug)]
pub struct EventSink {
    tick: u64,
    first_seq: u32,
    events: Vec<Event>,
}

impl EventSink {
    pub fn new(tick: u64) -> Self {
        Self::resume(tick, 0)
    }

    /// Continue numbering a tick whose events up to `first_seq - 1` are
    /// already logged.
    pub fn resume(tick: u64, first_seq: u32) -> Self {
        Self {
            tick,
            first_seq,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, kind: EventKind) {
        let seq = self.first_seq.saturating_add(self.events.len() as u32);
        self.events.push(Event {
            tick: self.tick,
            seq,
            kind,
        });
    }

    pub fn extend(&mut self, kinds: impl IntoIterator<Item = EventKind>) {
        for kind in kinds {
            self.push(kind);
        }
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}
