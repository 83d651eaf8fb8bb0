pub mod modules;

pub use modules::action::{self, ActionKind, InspectTarget, ParseActionError, SignedAction};
pub use modules::agent::{
    Brain, BrainError, BrainMode, DEFAULT_AGENT_GOAL, DEFAULT_LOOP_ACTIONS, LlmBrain, LlmClient,
    LlmProvider, LoopBrain, ScriptedBrain,
};
pub use modules::config::{self, ConfigError, SimConfig};
pub use modules::engine::{
    Decision, EngineError, EnginePhase, RunPlan, RunSummary, StopReason, TickAborted, TickEngine,
    TickOutcome,
};
pub use modules::event::{Event, EventKind, EventSink};
pub use modules::infusion::{InfusionError, InfusionPlan, InfusionReceipt, Spread, infuse_ore};
pub use modules::lifecycle;
pub use modules::ore::{Decay, NodeId, OreKind};
pub use modules::qi::{self, Qi, QiAudit, QiJournal};
pub use modules::state::{self, RuntimeState, Status};
pub use modules::stats::{ActionCount, ActionStats, ActionStatsStore};
pub use modules::store::{self, StateDir, StoreError};
pub use modules::structure::{Structure, StructureKind};
pub use modules::validator::{Rejection, Verdict};
pub use modules::view::{SnapshotWriter, WorldSnapshot, load_world_snapshot};
pub use modules::wallet::{self, Keyring, MineOutcome, MineParams, Wallet, WalletStore};
pub use modules::world::{
    Agent, AgentId, AgentSpec, AgentStatus, DEFAULT_MAX_AGENT_AGE, DeathReason, Position,
    WorldError, WorldRules, WorldState,
};
pub use modules::zone::{Region, Zone, ZoneId};
