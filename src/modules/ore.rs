use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::modules::qi::Qi;
use crate::modules::world::Position;

pub type NodeId = u64;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OreKind {
    #[default]
    Qi,
    Transistor,
}

impl OreKind {
    pub const fn label(self) -> &'static str {
        match self {
            OreKind::Qi => "qi",
            OreKind::Transistor => "transistor",
        }
    }

    /// Wallet price of one unit when infused by the creator.
    pub const fn infusion_price(self) -> Qi {
        match self {
            OreKind::Qi => 1,
            OreKind::Transistor => 100,
        }
    }
}

impl fmt::Display for OreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for OreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "qi" => Ok(OreKind::Qi),
            "transistor" => Ok(OreKind::Transistor),
            other => Err(format!("unknown ore kind '{}', use qi|transistor", other)),
        }
    }
}

/// Every `every` ticks the node loses `amount` units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decay {
    pub every: u64,
    pub amount: Qi,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OreNode {
    pub id: NodeId,
    pub ore: OreKind,
    pub position: Position,
    pub remaining: Qi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay: Option<Decay>,
}

impl OreNode {
    /// Remove up to `max` units and return how many were taken.
    pub fn extract(&mut self, max: Qi) -> Qi {
        let amount = self.remaining.min(max);
        self.remaining -= amount;
        amount
    }

    /// Apply the decay schedule for `tick`, returning the units lost.
    pub fn decay_at(&mut self, tick: u64) -> Qi {
        match self.decay {
            Some(Decay { every, amount }) if every > 0 && tick % every == 0 => self.extract(amount),
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechargeNode {
    pub id: NodeId,
    pub position: Position,
    pub capacity: Qi,
    pub charge: Qi,
    pub regen_per_tick: Qi,
}

impl RechargeNode {
    /// Draw up to `max` charge for a docked agent.
    pub fn draw(&mut self, max: Qi) -> Qi {
        let amount = self.charge.min(max);
        self.charge -= amount;
        amount
    }

    pub fn headroom(&self) -> Qi {
        self.capacity.saturating_sub(self.charge)
    }

    /// Add up to `max` charge without passing capacity. Returns the amount added.
    pub fn refill(&mut self, max: Qi) -> Qi {
        let gained = self.headroom().min(max);
        self.charge += gained;
        gained
    }
}
