use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::modules::action::{ActionKind, SignedAction};
use crate::modules::agent::{Brain, BrainError};
use crate::modules::event::{Event, EventKind, EventSink};
use crate::modules::lifecycle;
use crate::modules::observe::{self, Observation};
use crate::modules::qi::{Flow, QiAudit};
use crate::modules::store::StoreError;
use crate::modules::validator::{self, Rejection, Verdict};
use crate::modules::view::{SnapshotWriter, WorldSnapshot};
use crate::modules::wallet::Keyring;
use crate::modules::world::{AgentId, WorldError, WorldState};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("qi not conserved: before {}, after {}, journal {:?}", .0.before, .0.after, .0.journal)]
    Conservation(QiAudit),
    #[error("persisting tick failed: {0}")]
    Persist(#[from] StoreError),
}

/// A tick that could not complete. `state` is the last good world.
#[derive(Debug, Error)]
#[error("tick aborted: {error}")]
pub struct TickAborted {
    pub state: Box<WorldState>,
    #[source]
    pub error: EngineError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Processing { tick: u64 },
}

/// What one agent did during a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub agent_id: AgentId,
    pub action: ActionKind,
    /// Set when the brain's answer was replaced by `idle`.
    pub fallback: Option<String>,
    pub rejection: Option<Rejection>,
}

impl Decision {
    pub fn accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickOutcome {
    pub tick: u64,
    pub events: Vec<Event>,
    pub decisions: Vec<Decision>,
    pub audit: QiAudit,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunPlan {
    /// `None` runs until stopped or every agent is dead.
    pub ticks: Option<u64>,
    pub pacing: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Requested,
    Extinct,
}

#[derive(Debug)]
pub struct RunSummary {
    pub state: WorldState,
    pub ticks_run: u64,
    pub reason: StopReason,
}

pub struct TickEngine<B: Brain> {
    brain: Arc<Mutex<B>>,
    keyring: Keyring,
    brain_timeout: Duration,
    phase: EnginePhase,
    writer: Option<SnapshotWriter>,
}

impl<B: Brain> TickEngine<B> {
    pub fn new(brain: B, keyring: Keyring, brain_timeout: Duration) -> Self {
        Self {
            brain: Arc::new(Mutex::new(brain)),
            keyring,
            brain_timeout,
            phase: EnginePhase::Idle,
            writer: None,
        }
    }

    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Advance the world by one tick. On failure the untouched starting
    /// state comes back inside the error.
    pub fn step(&mut self, state: WorldState) -> Result<(WorldState, TickOutcome), TickAborted> {
        let mut next = state.clone();
        let result = self.process(&mut next);
        self.phase = EnginePhase::Idle;
        match result {
            Ok(outcome) => {
                if let Some(writer) = self.writer.as_mut() {
                    writer.publish(WorldSnapshot::from_world(&next));
                }
                Ok((next, outcome))
            }
            Err(error) => {
                warn!(tick = state.tick() + 1, %error, "tick aborted; keeping previous state");
                Err(TickAborted {
                    state: Box::new(state),
                    error,
                })
            }
        }
    }

    fn process(&mut self, state: &mut WorldState) -> Result<TickOutcome, EngineError> {
        let tick = state.tick() + 1;
        self.phase = EnginePhase::Processing { tick };
        state.reset_journal();
        let before = state.total_qi();

        let mut sink = EventSink::new(tick);
        sink.push(EventKind::TickStarted);
        let mut decisions = Vec::new();

        for agent_id in state.alive_agent_ids() {
            let Some(observation) = observe::observe(state, agent_id) else {
                continue;
            };
            let (action, fallback) = self.ask(&observation);
            let signed = self.sign(state, agent_id, observation.next_nonce, action.clone());

            let verdict = validator::validate_and_apply(state, &signed)?;
            sink.extend(verdict.events().iter().cloned());
            let rejection = match verdict {
                Verdict::Accepted { .. } => None,
                Verdict::Rejected { reason, .. } => {
                    sink.extend(lifecycle::note_rejection(state, agent_id, &reason));
                    Some(reason)
                }
            };

            let note = match &rejection {
                None => format!("tick {}: {} ok", tick, action),
                Some(reason) => format!("tick {}: {} rejected ({})", tick, action, reason.code()),
            };
            let limit = state.rules().memory_limit;
            state.agent_mut(agent_id)?.remember(note, limit);

            decisions.push(Decision {
                agent_id,
                action,
                fallback,
                rejection,
            });
        }

        sink.extend(lifecycle::advance(state)?);
        sink.extend(environment(state, tick)?);
        state.tick = tick;

        let audit = QiAudit {
            before,
            after: state.total_qi(),
            journal: state.reset_journal(),
        };
        if !audit.is_balanced() {
            return Err(EngineError::Conservation(audit));
        }
        sink.push(EventKind::TickCompleted {
            total_qi: audit.after,
        });
        debug!(tick, total_qi = audit.after, decisions = decisions.len(), "tick complete");

        Ok(TickOutcome {
            tick,
            events: sink.into_events(),
            decisions,
            audit,
        })
    }

    /// Ask the brain, falling back to `idle` on errors, late replies and bad tokens.
    fn ask(&mut self, observation: &Observation) -> (ActionKind, Option<String>) {
        let agent_id = observation.agent_id;
        let fallback = match self.decide_within(observation) {
            Ok(token) => match token.parse::<ActionKind>() {
                Ok(kind) => return (kind, None),
                Err(err) => err.to_string(),
            },
            Err(err) => err.to_string(),
        };
        warn!(agent_id, reason = %fallback, "brain answer replaced with idle");
        (ActionKind::Idle, Some(fallback))
    }

    /// Runs `decide` on its own thread and waits at most the brain timeout.
    /// An overrunning call keeps the brain locked; later asks see `Busy`
    /// until it returns, and its answer is dropped.
    fn decide_within(&self, observation: &Observation) -> Result<String, BrainError> {
        let timeout = self.brain_timeout;
        let brain = Arc::clone(&self.brain);
        let observation = observation.clone();
        let name = format!("harimu-brain-{}", observation.agent_id);
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let answer = match brain.try_lock() {
                    Ok(mut brain) => brain.decide(&observation, timeout),
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().decide(&observation, timeout),
                    Err(TryLockError::WouldBlock) => Err(BrainError::Busy),
                };
                // The receiver is gone when the engine stopped waiting.
                let _ = tx.send(answer);
            })
            .map_err(|e| BrainError::Crashed(format!("spawn: {}", e)))?;

        match rx.recv_timeout(timeout) {
            Ok(answer) => answer,
            Err(RecvTimeoutError::Timeout) => Err(BrainError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(BrainError::Crashed("brain panicked".into())),
        }
    }

    fn sign(&self, state: &WorldState, agent_id: AgentId, nonce: u64, kind: ActionKind) -> SignedAction {
        let owner = state.agent(agent_id).map(|a| a.owner.as_str()).unwrap_or_default();
        // A missing key leaves the action unsigned; the validator rejects it.
        let signature = match self.keyring.sign(owner, agent_id, nonce, &kind) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(agent_id, %err, "cannot sign for agent");
                String::new()
            }
        };
        SignedAction {
            agent_id,
            nonce,
            kind,
            signature,
        }
    }

    /// Loop `step` until the plan completes, `should_stop` says so, or no
    /// agent is left alive. The stop check only runs between ticks.
    pub fn run<S, H>(
        &mut self,
        mut state: WorldState,
        plan: RunPlan,
        mut should_stop: S,
        mut on_tick: H,
    ) -> Result<RunSummary, TickAborted>
    where
        S: FnMut() -> bool,
        H: FnMut(&WorldState, &TickOutcome) -> Result<(), StoreError>,
    {
        let mut ticks_run = 0u64;
        let reason = loop {
            if plan.ticks.is_some_and(|n| ticks_run >= n) {
                break StopReason::Completed;
            }
            if ticks_run > 0 && !plan.pacing.is_zero() {
                thread::sleep(plan.pacing);
            }
            if should_stop() {
                break StopReason::Requested;
            }
            if state.alive_agent_ids().is_empty() {
                break StopReason::Extinct;
            }

            let (next, outcome) = self.step(state)?;
            state = next;
            ticks_run += 1;
            if let Err(err) = on_tick(&state, &outcome) {
                return Err(TickAborted {
                    state: Box::new(state),
                    error: err.into(),
                });
            }
        };
        info!(ticks_run, ?reason, tick = state.tick(), "run finished");
        Ok(RunSummary {
            state,
            ticks_run,
            reason,
        })
    }

    /// Flush the snapshot writer. Returns ticks whose snapshot was superseded.
    pub fn finish(self) -> Vec<u64> {
        self.writer.map(SnapshotWriter::finish).unwrap_or_default()
    }
}

/// Recharge docking, node regeneration (recycling first) and ore decay, in that order.
fn environment(state: &mut WorldState, tick: u64) -> Result<Vec<EventKind>, WorldError> {
    let mut events = Vec::new();
    let rules = state.rules().clone();

    for agent_id in state.alive_agent_ids() {
        let Some(here) = state.agent(agent_id).map(|a| a.position) else {
            continue;
        };
        let node_id = state
            .recharge_nodes()
            .filter(|n| n.charge > 0 && here.within_range(n.position, rules.dock_range))
            .min_by_key(|n| (here.distance(n.position), n.id))
            .map(|n| n.id);
        let Some(node_id) = node_id else {
            continue;
        };
        let amount = match state.recharge_nodes.get_mut(&node_id) {
            Some(node) => node.draw(rules.dock_draw),
            None => continue,
        };
        if amount == 0 {
            continue;
        }
        state.credit_agent(agent_id, amount, Flow::Recharged)?;
        events.push(EventKind::RechargeDocked {
            agent_id,
            node_id,
            amount,
        });
    }

    // Each node regains up to its rate: recycled action costs first, then fresh
    // charge while the world is below its supply cap.
    let mut budget = state.regen_budget();
    let node_ids: Vec<_> = state.recharge_nodes.keys().copied().collect();
    for node_id in node_ids {
        let Some(rate) = state.recharge_node(node_id).map(|n| n.regen_per_tick) else {
            continue;
        };
        let recycled = state.recycle_into(node_id, rate)?;
        if recycled > 0 {
            events.push(EventKind::QiRecycled {
                node_id,
                amount: recycled,
            });
        }
        let Some(node) = state.recharge_nodes.get_mut(&node_id) else {
            continue;
        };
        let fresh = node.refill((rate - recycled).min(budget));
        budget -= fresh;
        if recycled + fresh > 0 {
            events.push(EventKind::RechargeRegenerated {
                node_id,
                charge: node.charge,
            });
        }
    }

    for node in state.ore_nodes.values_mut() {
        let lost = node.decay_at(tick);
        if lost == 0 {
            continue;
        }
        events.push(EventKind::OreDecayed {
            node_id: node.id,
            amount: lost,
            remaining: node.remaining,
        });
        if node.remaining == 0 {
            events.push(EventKind::OreNodeDrained {
                node_id: node.id,
                ore: node.ore,
                position: node.position,
            });
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::agent::{LoopBrain, ScriptedBrain};
    use crate::modules::ore::{Decay, OreKind};
    use crate::modules::store::StateDir;
    use crate::modules::testkit::Sandbox;
    use crate::modules::view;
    use crate::modules::world::Position;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn engine<B: Brain>(sb: &Sandbox, brain: B) -> TickEngine<B> {
        TickEngine::new(brain, sb.keyring.clone(), TIMEOUT)
    }

    fn names(outcome: &TickOutcome) -> Vec<&'static str> {
        outcome.events.iter().map(|e| e.kind.name()).collect()
    }

    #[test]
    fn single_move_tick() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let mut brain = ScriptedBrain::new();
        brain.push(id, "move:1,0,0");
        let mut engine = engine(&sb, brain);

        let (state, outcome) = engine.step(sb.world.clone()).unwrap();
        let agent = state.agent(id).unwrap();
        assert_eq!(agent.qi, 2);
        assert_eq!(agent.position, Position::new(1, 0, 0));
        assert_eq!(state.tick(), 1);
        assert_eq!(
            names(&outcome),
            ["tick_started", "qi_spent", "agent_moved", "tick_completed"]
        );
        assert!(outcome.audit.is_balanced());
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[test]
    fn broke_agent_harvest_is_rejected_and_stalls() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(0, Position::origin());
        sb.world
            .add_ore_node(OreKind::Qi, Position::new(1, 0, 0), 10, None)
            .unwrap();
        let mut brain = ScriptedBrain::new();
        brain.push(id, "harvest_qi_ore");
        let mut engine = engine(&sb, brain);

        let (state, outcome) = engine.step(sb.world.clone()).unwrap();
        assert_eq!(state.agent(id).unwrap().qi, 0);
        let n = names(&outcome);
        assert_eq!(n.iter().filter(|e| **e == "action_rejected").count(), 1);
        assert!(!n.contains(&"qi_spent"));
        assert!(n.contains(&"agent_stalled"));
        assert!(state.agent(id).unwrap().is_alive());
    }

    #[test]
    fn rejected_turn_does_not_burn_the_nonce() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let mut brain = ScriptedBrain::new();
        brain.push(id, "move:5,0,0").push(id, "move:1,0,0");
        let mut engine = engine(&sb, brain);

        let (state, first) = engine.step(sb.world.clone()).unwrap();
        assert!(!first.decisions[0].accepted());
        assert_eq!(state.agent(id).unwrap().last_nonce, 0);
        let (state, second) = engine.step(state).unwrap();
        assert!(second.decisions[0].accepted());
        assert_eq!(state.agent(id).unwrap().last_nonce, 1);
    }

    #[test]
    fn unparseable_answers_become_idle() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(3, Position::origin());
        let mut brain = ScriptedBrain::new();
        brain.push(id, "teleport:9");
        let mut engine = engine(&sb, brain);

        let (state, outcome) = engine.step(sb.world.clone()).unwrap();
        let decision = &outcome.decisions[0];
        assert_eq!(decision.action, ActionKind::Idle);
        assert!(decision.fallback.is_some());
        assert_eq!(state.agent(id).unwrap().qi, 3);
        assert_eq!(state.agent(id).unwrap().last_nonce, 1);
    }

    #[test]
    fn spent_qi_is_recycled_into_recharge_nodes() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(5, Position::origin());
        let node = sb.world.add_recharge_node(Position::new(20, 0, 0), 10, 3).unwrap();
        // The node's charge now sits with the agent, so the world is at its cap.
        sb.world.recharge_nodes.get_mut(&node).unwrap().charge = 0;
        sb.world.agent_mut(id).unwrap().qi += 10;
        assert_eq!(sb.world.qi_supply_cap(), Some(15));
        assert_eq!(sb.world.regen_budget(), 0);

        let mut brain = ScriptedBrain::new();
        brain.push(id, "move:1,0,0").push(id, "move:1,0,0");
        let mut engine = engine(&sb, brain);

        let (state, outcome) = engine.step(sb.world.clone()).unwrap();
        assert!(outcome.audit.is_balanced());
        assert_eq!(outcome.audit.journal.recycled, 1);
        assert!(names(&outcome).contains(&"qi_recycled"));
        assert_eq!(state.recharge_node(node).unwrap().charge, 1);
        assert_eq!(state.recycle_reserve(), 0);
        assert_eq!(state.total_qi(), 14);
        assert_eq!(state.qi_supply(), 15);

        let (state, _) = engine.step(state).unwrap();
        assert_eq!(state.recharge_node(node).unwrap().charge, 2);
        assert_eq!(state.agent(id).unwrap().qi, 13);
        assert_eq!(state.qi_supply(), 15);
    }

    #[test]
    fn fresh_regeneration_stops_at_the_supply_cap() {
        let mut sb = Sandbox::new();
        sb.spawn(2, Position::origin());
        let node = sb.world.add_recharge_node(Position::new(20, 0, 0), 10, 3).unwrap();
        sb.world.recharge_nodes.get_mut(&node).unwrap().charge = 0;
        let cap = sb.world.qi_supply_cap().unwrap();
        let mut engine = engine(&sb, ScriptedBrain::new());

        let mut state = sb.world.clone();
        let mut charges = Vec::new();
        for _ in 0..5 {
            let (next, outcome) = engine.step(state).unwrap();
            assert!(outcome.audit.is_balanced());
            assert!(next.qi_supply() <= cap);
            charges.push(next.recharge_node(node).unwrap().charge);
            state = next;
        }
        assert_eq!(charges, vec![3, 6, 9, 10, 10]);
    }

    struct SlowBrain(Duration);

    impl Brain for SlowBrain {
        fn decide(&mut self, _: &Observation, _: Duration) -> Result<String, BrainError> {
            thread::sleep(self.0);
            Ok("move:1,0,0".into())
        }
    }

    #[test]
    fn blocking_brain_is_cut_off_at_the_timeout() {
        let mut sb = Sandbox::new();
        let a = sb.spawn(3, Position::origin());
        let b = sb.spawn(3, Position::new(4, 0, 0));
        let mut engine = TickEngine::new(
            SlowBrain(Duration::from_millis(600)),
            sb.keyring.clone(),
            Duration::from_millis(30),
        );

        let started = std::time::Instant::now();
        let (state, outcome) = engine.step(sb.world.clone()).unwrap();
        assert!(started.elapsed() < Duration::from_millis(450));

        for decision in &outcome.decisions {
            assert_eq!(decision.action, ActionKind::Idle);
            assert!(decision.fallback.is_some());
        }
        assert_eq!(state.agent(a).unwrap().position, Position::origin());
        assert_eq!(state.agent(b).unwrap().position, Position::new(4, 0, 0));
        assert_eq!(state.agent(a).unwrap().last_nonce, 1);
        assert!(outcome.audit.is_balanced());
    }

    fn busy_world() -> Sandbox {
        let mut sb = Sandbox::new();
        let a = sb.spawn(6, Position::origin());
        sb.spawn(2, Position::new(3, 0, 0));
        sb.world
            .add_ore_node(OreKind::Qi, Position::new(1, 0, 0), 12, Some(Decay { every: 4, amount: 1 }))
            .unwrap();
        sb.world.add_recharge_node(Position::new(3, 1, 0), 4, 1).unwrap();
        sb.world.agent_mut(a).unwrap().max_age = 6;
        sb
    }

    fn run_busy(sb: &Sandbox, ticks: u64) -> (WorldState, Vec<Event>) {
        let brain = LoopBrain::new(
            ["harvest_qi_ore", "reproduce", "scan", "move:0,1,0", "build:basic", "move:0,-1,0"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        let mut engine = engine(sb, brain);
        let mut events = Vec::new();
        let summary = engine
            .run(
                sb.world.clone(),
                RunPlan {
                    ticks: Some(ticks),
                    pacing: Duration::ZERO,
                },
                || false,
                |_, outcome| {
                    assert!(outcome.audit.is_balanced());
                    events.extend(outcome.events.iter().cloned());
                    Ok(())
                },
            )
            .unwrap();
        (summary.state, events)
    }

    #[test]
    fn identical_inputs_replay_identically() {
        let sb = busy_world();
        let (a_state, a_events) = run_busy(&sb, 10);
        let (b_state, b_events) = run_busy(&sb, 10);
        assert_eq!(
            serde_json::to_vec(&a_state).unwrap(),
            serde_json::to_vec(&b_state).unwrap()
        );
        assert_eq!(a_events, b_events);
    }

    #[test]
    fn busy_world_conserves_qi_and_kills_once() {
        let sb = busy_world();
        let (state, events) = run_busy(&sb, 10);
        let deaths = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::AgentDied { agent_id: 1, .. }))
            .count();
        assert_eq!(deaths, 1);
        assert!(events.iter().any(|e| e.kind.name() == "recharge_docked"));
        assert!(state.check_consistency().is_ok());

        let mut ticks: Vec<u64> = events.iter().map(|e| e.tick).collect();
        ticks.dedup();
        assert!(ticks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ledger_fault_returns_the_previous_state() {
        let mut sb = Sandbox::new();
        let id = sb.spawn(0, Position::origin());
        sb.world.agent_mut(id).unwrap().qi = u64::MAX;
        sb.world.add_recharge_node(Position::new(1, 0, 0), 5, 0).unwrap();
        let before = sb.world.clone();
        let mut engine = engine(&sb, ScriptedBrain::new());

        let aborted = engine.step(sb.world.clone()).unwrap_err();
        assert!(matches!(aborted.error, EngineError::World(WorldError::Ledger { .. })));
        assert_eq!(*aborted.state, before);
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[test]
    fn stop_request_is_honoured_between_ticks() {
        let mut sb = Sandbox::new();
        sb.spawn(1, Position::origin());
        let mut engine = engine(&sb, ScriptedBrain::new());
        let mut checks = 0;
        let summary = engine
            .run(
                sb.world.clone(),
                RunPlan::default(),
                || {
                    checks += 1;
                    checks > 3
                },
                |_, _| Ok(()),
            )
            .unwrap();
        assert_eq!(summary.reason, StopReason::Requested);
        assert_eq!(summary.ticks_run, 3);
        assert_eq!(summary.state.tick(), 3);
    }

    #[test]
    fn snapshots_follow_the_tick() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::new(tmp.path());
        let mut sb = Sandbox::new();
        sb.spawn(1, Position::origin());
        let mut engine = engine(&sb, ScriptedBrain::new()).with_snapshots(SnapshotWriter::new(&dir, false));
        let summary = engine
            .run(
                sb.world.clone(),
                RunPlan {
                    ticks: Some(2),
                    pacing: Duration::ZERO,
                },
                || false,
                |_, _| Ok(()),
            )
            .unwrap();
        assert!(engine.finish().is_empty());
        let snapshot = view::load_world_snapshot(&dir).unwrap().unwrap();
        assert_eq!(snapshot.tick, summary.state.tick());
        assert!(!dir.snapshot_history().exists());
    }
}
