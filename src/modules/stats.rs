use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::modules::engine::Decision;
use crate::modules::store::{self, StateDir, StoreError};
use crate::modules::world::AgentId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCount {
    pub accepted: u64,
    pub rejected: u64,
}

/// Per-agent tallies keyed by action label (`move`, `harvest_qi_ore`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStats {
    pub actions: BTreeMap<String, ActionCount>,
    #[serde(default)]
    pub fallbacks: u64,
}

impl ActionStats {
    pub fn record(&mut self, decision: &Decision) {
        let count = self
            .actions
            .entry(decision.action.label().to_string())
            .or_default();
        if decision.accepted() {
            count.accepted = count.accepted.saturating_add(1);
        } else {
            count.rejected = count.rejected.saturating_add(1);
        }
        if decision.fallback.is_some() {
            self.fallbacks = self.fallbacks.saturating_add(1);
        }
    }

    pub fn accepted(&self) -> u64 {
        self.actions.values().map(|c| c.accepted).sum()
    }

    pub fn rejected(&self) -> u64 {
        self.actions.values().map(|c| c.rejected).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatsStore {
    pub per_agent: BTreeMap<AgentId, ActionStats>,
}

impl ActionStatsStore {
    pub fn load(dir: &StateDir) -> Result<Self, StoreError> {
        Ok(store::read_json(&dir.action_stats())?.unwrap_or_default())
    }

    pub fn save(&self, dir: &StateDir) -> Result<(), StoreError> {
        store::write_json_atomic(&dir.action_stats(), self)
    }

    pub fn reset(dir: &StateDir) -> Result<(), StoreError> {
        Self::default().save(dir)
    }

    pub fn record_all<'a>(&mut self, decisions: impl IntoIterator<Item = &'a Decision>) {
        for decision in decisions {
            self.per_agent
                .entry(decision.agent_id)
                .or_default()
                .record(decision);
        }
    }

    pub fn agent(&self, agent_id: AgentId) -> Option<&ActionStats> {
        self.per_agent.get(&agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::action::ActionKind;
    use crate::modules::validator::Rejection;

    fn decision(agent_id: AgentId, action: ActionKind, rejection: Option<Rejection>) -> Decision {
        Decision {
            agent_id,
            action,
            fallback: None,
            rejection,
        }
    }

    #[test]
    fn tallies_by_label_and_outcome() {
        let rejected = Rejection::InsufficientQi {
            required: 1,
            available: 0,
        };
        let decisions = [
            decision(1, ActionKind::Move { dx: 1, dy: 0, dz: 0 }, None),
            decision(1, ActionKind::Move { dx: 0, dy: 1, dz: 0 }, Some(rejected)),
            decision(2, ActionKind::Scan, None),
        ];
        let mut stats = ActionStatsStore::default();
        stats.record_all(&decisions);

        let one = stats.agent(1).unwrap();
        assert_eq!(one.actions["move"], ActionCount { accepted: 1, rejected: 1 });
        assert_eq!(one.accepted(), 1);
        assert_eq!(one.rejected(), 1);
        assert_eq!(stats.agent(2).unwrap().actions["scan"].accepted, 1);
    }

    #[test]
    fn persists_through_the_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::new(tmp.path());
        assert_eq!(ActionStatsStore::load(&dir).unwrap(), ActionStatsStore::default());

        let mut stats = ActionStatsStore::default();
        stats.record_all(&[decision(3, ActionKind::Idle, None)]);
        stats.save(&dir).unwrap();
        assert_eq!(ActionStatsStore::load(&dir).unwrap(), stats);

        ActionStatsStore::reset(&dir).unwrap();
        assert!(ActionStatsStore::load(&dir).unwrap().per_agent.is_empty());
    }
}
