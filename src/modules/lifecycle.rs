use tracing::{debug, info};

use crate::modules::event::EventKind;
use crate::modules::qi::{Flow, Qi};
use crate::modules::validator::Rejection;
use crate::modules::world::{AgentId, AgentSpec, AgentStatus, DeathReason, Hazard, WorldError, WorldState};

/// Create an agent and make it active straight away.
pub fn spawn(state: &mut WorldState, spec: AgentSpec) -> Result<(AgentId, Vec<EventKind>), WorldError> {
    let funding = spec.qi;
    let id = state.insert_agent(spec)?;
    state.add_supply(funding);
    let agent = state.agent_mut(id)?;
    agent.status = AgentStatus::Active;
    let event = EventKind::AgentSpawned {
        agent_id: id,
        owner: agent.owner.clone(),
        qi: agent.qi,
        position: agent.position,
        parent: None,
    };
    info!(agent_id = id, qi = agent.qi, position = %agent.position, "agent spawned");
    Ok((id, vec![event]))
}

/// Creator top-up from outside the tick loop. Journals as infused Qi.
pub fn infuse(state: &mut WorldState, agent_id: AgentId, amount: Qi) -> Result<Vec<EventKind>, WorldError> {
    let agent = state.agent(agent_id).ok_or(WorldError::AgentNotFound(agent_id))?;
    if !agent.is_alive() {
        return Err(WorldError::AgentDead(agent_id));
    }
    let balance = state.credit_agent(agent_id, amount, Flow::Infused)?;
    state.add_supply(amount);
    let mut events = vec![EventKind::QiGained {
        agent_id,
        amount,
        source: "infusion".to_string(),
    }];
    events.extend(recover(state, agent_id, balance)?);
    Ok(events)
}

pub fn extend_life(state: &mut WorldState, agent_id: AgentId, extra: u64) -> Result<u64, WorldError> {
    let agent = state.agent_mut(agent_id)?;
    if !agent.is_alive() {
        return Err(WorldError::AgentDead(agent_id));
    }
    agent.max_age = agent.max_age.saturating_add(extra);
    Ok(agent.max_age)
}

/// Queue a hazard; it fires during the next lifecycle pass.
pub fn queue_hazard(state: &mut WorldState, agent_id: AgentId, reason: DeathReason) -> Result<(), WorldError> {
    let agent = state.agent(agent_id).ok_or(WorldError::AgentNotFound(agent_id))?;
    if !agent.is_alive() {
        return Err(WorldError::AgentDead(agent_id));
    }
    state.pending_hazards.push(Hazard { agent_id, reason });
    Ok(())
}

/// An agent with zero Qi whose paid action bounced for lack of Qi stalls.
pub fn note_rejection(state: &mut WorldState, agent_id: AgentId, reason: &Rejection) -> Option<EventKind> {
    if !matches!(reason, Rejection::InsufficientQi { .. }) {
        return None;
    }
    let agent = state.agent_mut(agent_id).ok()?;
    if agent.status != AgentStatus::Active || agent.qi != 0 {
        return None;
    }
    agent.status = AgentStatus::Stalled;
    debug!(agent_id, "agent stalled");
    Some(EventKind::AgentStalled { agent_id })
}

fn recover(state: &mut WorldState, agent_id: AgentId, balance: Qi) -> Result<Option<EventKind>, WorldError> {
    let agent = state.agent_mut(agent_id)?;
    if agent.status == AgentStatus::Stalled && balance > 0 {
        agent.status = AgentStatus::Active;
        return Ok(Some(EventKind::AgentRecovered { agent_id, qi: balance }));
    }
    Ok(None)
}

/// Per-tick lifecycle pass over every alive agent in ascending id order:
/// age, recover from a stall, then die from a queued hazard or old age.
pub fn advance(state: &mut WorldState) -> Result<Vec<EventKind>, WorldError> {
    let hazards = std::mem::take(&mut state.pending_hazards);
    let mut events = Vec::new();

    for agent_id in state.alive_agent_ids() {
        let agent = state.agent_mut(agent_id)?;
        if !agent.is_alive() {
            continue;
        }
        agent.age = agent.age.saturating_add(1);
        let (age, max_age, qi) = (agent.age, agent.max_age, agent.qi);
        events.extend(recover(state, agent_id, qi)?);

        let hazard = hazards.iter().find(|h| h.agent_id == agent_id).map(|h| h.reason);
        let reason = match hazard {
            Some(reason) => Some(reason),
            None if age >= max_age => Some(DeathReason::Age),
            None => None,
        };
        if let Some(reason) = reason {
            events.extend(kill(state, agent_id, reason)?);
        }
    }
    Ok(events)
}

/// Mark an agent dead and settle its Qi. Dead agents are left alone, so the
/// death event is emitted once per agent.
pub fn kill(state: &mut WorldState, agent_id: AgentId, reason: DeathReason) -> Result<Vec<EventKind>, WorldError> {
    let agent = state.agent_mut(agent_id)?;
    if !agent.is_alive() {
        return Ok(Vec::new());
    }
    agent.status = AgentStatus::Dead;
    agent.death = Some(reason);
    let age = agent.age;
    let estate = agent.qi;
    let offspring = agent.offspring.clone();
    info!(agent_id, ?reason, age, estate, "agent died");

    let mut events = vec![EventKind::AgentDied { agent_id, reason, age }];
    if estate == 0 {
        return Ok(events);
    }

    let mut heirs: Vec<AgentId> = offspring
        .into_iter()
        .filter(|id| state.agent(*id).is_some_and(|a| a.is_alive()))
        .collect();
    heirs.sort_unstable();
    heirs.dedup();

    if heirs.is_empty() {
        state.release_to_pool(agent_id, estate)?;
        events.push(EventKind::QiReleased {
            agent_id,
            amount: estate,
        });
        return Ok(events);
    }

    let share = estate / heirs.len() as Qi;
    let remainder = estate % heirs.len() as Qi;
    for (idx, heir) in heirs.iter().enumerate() {
        let amount = if idx == 0 { share + remainder } else { share };
        if amount == 0 {
            continue;
        }
        state.move_qi(agent_id, *heir, amount, Flow::Inherited)?;
        events.push(EventKind::QiInherited {
            from: agent_id,
            heir: *heir,
            amount,
        });
        let balance = state.agent(*heir).map(|a| a.qi).unwrap_or(0);
        events.extend(recover(state, *heir, balance)?);
    }
    Ok(events)
}
