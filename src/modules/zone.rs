use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::modules::world::{AgentId, Position};

pub type ZoneId = u64;

/// Axis-aligned box of cells, both corners inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub min: Position,
    pub max: Position,
}

impl Region {
    /// Cube of half-size `radius` around `center`.
    pub fn around(center: Position, radius: i32) -> Self {
        Self {
            min: center,
            max: center,
        }
        .grow(radius)
    }

    /// Pushes every face outward by `by`, saturating at the `i32` range.
    pub fn grow(self, by: i32) -> Self {
        let back = by.saturating_neg();
        Self {
            min: self.min.offset(back, back, back),
            max: self.max.offset(by, by, by),
        }
    }

    pub fn contains(&self, p: Position) -> bool {
        (self.min.x..=self.max.x).contains(&p.x)
            && (self.min.y..=self.max.y).contains(&p.y)
            && (self.min.z..=self.max.z).contains(&p.z)
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
            && self.min.z <= other.max.z
            && other.min.z <= self.max.z
    }

    /// Largest half-size along any axis, rounded down.
    pub fn half_size(&self) -> i32 {
        let span = |lo: i32, hi: i32| hi as i64 - lo as i64;
        let widest = span(self.min.x, self.max.x)
            .max(span(self.min.y, self.max.y))
            .max(span(self.min.z, self.max.z));
        i32::try_from(widest / 2).unwrap_or(i32::MAX)
    }

    pub fn within_bounds(&self, half_extent: i32) -> bool {
        self.min.in_bounds(half_extent) && self.max.in_bounds(half_extent)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub region: Region,
    pub claimant: AgentId,
    pub members: BTreeSet<AgentId>,
}

impl Zone {
    pub fn is_member(&self, agent_id: AgentId) -> bool {
        self.members.contains(&agent_id)
    }
}
