//! Creator-side ore infusion: a wallet pays for new ore nodes scattered
//! around a centre point.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::modules::ore::{Decay, NodeId, OreKind};
use crate::modules::qi::Qi;
use crate::modules::wallet::{WalletError, WalletStore};
use crate::modules::world::{Position, WorldError, WorldState};

const DEFAULT_CHUNK: Qi = 10;

#[derive(Debug, Error)]
pub enum InfusionError {
    #[error("{0}")]
    Invalid(String),
    #[error("infusion of {units} {ore} overflows the price")]
    Overflow { units: Qi, ore: OreKind },
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    World(#[from] WorldError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spread {
    pub center: Position,
    pub radius: i32,
}

impl Default for Spread {
    fn default() -> Self {
        Self {
            center: Position::origin(),
            radius: 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfusionPlan {
    pub ore: OreKind,
    /// Total units, split into nodes of at most `capacity`. Overrides `count`.
    pub amount: Option<Qi>,
    pub count: u32,
    pub capacity: Qi,
    pub spread: Spread,
    /// Fixed seed for reproducible placement.
    pub seed: Option<u64>,
    pub decay: Option<Decay>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfusionReceipt {
    pub wallet: String,
    pub ore: OreKind,
    pub nodes: Vec<NodeId>,
    pub units: Qi,
    pub charged: Qi,
    pub wallet_balance: Qi,
}

fn node_sizes(plan: &InfusionPlan) -> Result<Vec<Qi>, InfusionError> {
    if let Some(total) = plan.amount {
        if total == 0 {
            return Err(InfusionError::Invalid("amount must be greater than 0".into()));
        }
        let chunk = if plan.capacity > 0 { plan.capacity } else { DEFAULT_CHUNK };
        let mut sizes = Vec::new();
        let mut remaining = total;
        while remaining > 0 {
            let size = remaining.min(chunk);
            sizes.push(size);
            remaining -= size;
        }
        return Ok(sizes);
    }
    if plan.count == 0 {
        return Err(InfusionError::Invalid("count must be at least 1".into()));
    }
    if plan.capacity == 0 {
        return Err(InfusionError::Invalid("capacity must be greater than 0".into()));
    }
    Ok(vec![plan.capacity; plan.count as usize])
}

fn random_position(spread: Spread, half_extent: i32, rng: &mut StdRng) -> Position {
    let radius = spread.radius.max(0);
    let mut axis = |c: i32| c.saturating_add(rng.gen_range(-radius..=radius)).clamp(-half_extent, half_extent);
    Position::new(axis(spread.center.x), axis(spread.center.y), axis(spread.center.z))
}

/// Debit the wallet at the ore's infusion price and add the planned nodes.
/// Both sides are only mutated in memory; the caller persists them together.
pub fn infuse_ore(
    world: &mut WorldState,
    wallets: &mut WalletStore,
    wallet: &str,
    plan: &InfusionPlan,
) -> Result<InfusionReceipt, InfusionError> {
    let sizes = node_sizes(plan)?;
    let units = sizes
        .iter()
        .try_fold(0 as Qi, |acc, v| acc.checked_add(*v))
        .ok_or(InfusionError::Overflow { units: Qi::MAX, ore: plan.ore })?;
    let charged = units
        .checked_mul(plan.ore.infusion_price())
        .ok_or(InfusionError::Overflow { units, ore: plan.ore })?;
    let wallet_balance = wallets.debit(wallet, charged)?;

    let mut rng = match plan.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let half_extent = world.rules().half_extent;
    let mut nodes = Vec::with_capacity(sizes.len());
    for size in sizes {
        let position = random_position(plan.spread, half_extent, &mut rng);
        nodes.push(world.add_ore_node(plan.ore, position, size, plan.decay)?);
    }
    info!(wallet, ore = %plan.ore, units, charged, nodes = nodes.len(), "ore infused");

    Ok(InfusionReceipt {
        wallet: wallet.to_string(),
        ore: plan.ore,
        nodes,
        units,
        charged,
        wallet_balance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(ore: OreKind, amount: Option<Qi>) -> InfusionPlan {
        InfusionPlan {
            ore,
            amount,
            count: 2,
            capacity: 10,
            spread: Spread {
                center: Position::origin(),
                radius: 3,
            },
            seed: Some(7),
            decay: None,
        }
    }

    fn funded(balance: Qi) -> (WalletStore, String) {
        let mut wallets = WalletStore::default();
        let address = wallets.create().address.clone();
        wallets.credit(&address, balance).unwrap();
        (wallets, address)
    }

    #[test]
    fn amount_is_split_into_capacity_chunks() {
        let (mut wallets, address) = funded(100);
        let mut world = WorldState::default();
        let receipt = infuse_ore(&mut world, &mut wallets, &address, &plan(OreKind::Qi, Some(25))).unwrap();
        assert_eq!(receipt.nodes.len(), 3);
        assert_eq!(receipt.charged, 25);
        assert_eq!(receipt.wallet_balance, 75);
        let sizes: Vec<Qi> = world.ore_nodes().map(|n| n.remaining).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(world.ore_nodes().all(|n| n.position.distance(Position::origin()) <= 3));
    }

    #[test]
    fn transistors_cost_more_and_poor_wallets_are_refused() {
        let (mut wallets, address) = funded(150);
        let mut world = WorldState::default();
        let err = infuse_ore(&mut world, &mut wallets, &address, &plan(OreKind::Transistor, Some(2))).unwrap_err();
        assert!(matches!(err, InfusionError::Wallet(_)));
        assert_eq!(world.ore_nodes().count(), 0);
        assert_eq!(wallets.get(&address).unwrap().balance, 150);

        let receipt = infuse_ore(&mut world, &mut wallets, &address, &plan(OreKind::Transistor, Some(1))).unwrap();
        assert_eq!(receipt.charged, 100);
    }

    #[test]
    fn seeded_placement_is_reproducible() {
        let place = || {
            let (mut wallets, address) = funded(100);
            let mut world = WorldState::default();
            infuse_ore(&mut world, &mut wallets, &address, &plan(OreKind::Qi, None)).unwrap();
            world.ore_nodes().map(|n| n.position).collect::<Vec<_>>()
        };
        assert_eq!(place(), place());
    }
}
