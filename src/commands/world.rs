use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use harimu::{
    Decay, InfusionPlan, OreKind, Position, Qi, Spread, StateDir, WalletStore, WorldSnapshot,
    WorldState, infuse_ore, load_world_snapshot, store,
};

use super::{PositionArg, require_idle_world, require_world};

#[derive(Subcommand)]
pub enum WorldCommand {
    /// Infuse ore nodes into the world, paid for by a wallet
    Infuse {
        /// Wallet address to fund the infusion (defaults to the first wallet)
        #[arg(long)]
        wallet: Option<String>,
        /// Total units to inject (splits into nodes of at most --capacity)
        #[arg(long)]
        amount: Option<Qi>,
        /// Number of nodes to create (ignored when --amount is set)
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Units per node
        #[arg(long, default_value_t = 10)]
        capacity: Qi,
        /// Center and radius for random placement: x,y,z,r (radius must be >= 0)
        #[arg(long, value_name = "x,y,z,r")]
        spread: Option<SpreadArg>,
        /// Optional RNG seed for reproducible placement
        #[arg(long)]
        seed: Option<u64>,
        /// Ore kind to infuse (qi or transistor). Transistors cost 100 Qi each.
        #[arg(long, default_value = "qi")]
        ore: OreKind,
        /// Lose --decay-amount units every N ticks
        #[arg(long, requires = "decay_amount")]
        decay_every: Option<u64>,
        #[arg(long, requires = "decay_every")]
        decay_amount: Option<Qi>,
    },
    /// Place a recharge node agents can dock at
    Recharge {
        #[arg(short = 'p', long, default_value = "0,0,0")]
        position: PositionArg,
        #[arg(long, default_value_t = 10)]
        capacity: Qi,
        /// Charge regained per tick
        #[arg(long, default_value_t = 1)]
        regen: Qi,
    },
    /// List world elements
    List {
        /// Show ore and recharge nodes
        #[arg(long)]
        ore: bool,
        /// Show agent-built structures
        #[arg(long)]
        structure: bool,
        /// Show zones
        #[arg(long)]
        zone: bool,
    },
    /// Export a world snapshot for external viewers
    View {
        /// Print the snapshot JSON to stdout
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct SpreadArg(pub Spread);

impl FromStr for SpreadArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.trim().split(',').collect();
        if parts.len() != 4 {
            return Err("Spread must be formatted as x,y,z,r (radius >= 0)".into());
        }
        let mut values = [0i32; 4];
        for (slot, (part, name)) in values.iter_mut().zip(parts.iter().zip(["x", "y", "z", "radius"])) {
            *slot = part
                .trim()
                .parse::<i32>()
                .map_err(|_| format!("{} must be an integer", name))?;
        }
        if values[3] < 0 {
            return Err("radius must be non-negative".into());
        }
        Ok(SpreadArg(Spread {
            center: Position::new(values[0], values[1], values[2]),
            radius: values[3],
        }))
    }
}

pub(super) fn run_world(dir: &StateDir, cmd: WorldCommand) -> Result<()> {
    match cmd {
        WorldCommand::Infuse {
            wallet,
            amount,
            count,
            capacity,
            spread,
            seed,
            ore,
            decay_every,
            decay_amount,
        } => {
            let decay = match (decay_every, decay_amount) {
                (Some(0), _) => bail!("--decay-every must be greater than 0"),
                (Some(every), Some(amount)) => Some(Decay { every, amount }),
                _ => None,
            };
            let mut world = require_idle_world(dir)?;
            let mut wallets = WalletStore::load(dir)?;
            let address = wallets.resolve(wallet.as_deref())?.address.clone();
            let plan = InfusionPlan {
                ore,
                amount,
                count,
                capacity,
                spread: spread.map(|s| s.0).unwrap_or_default(),
                seed,
                decay,
            };
            let receipt = infuse_ore(&mut world, &mut wallets, &address, &plan).context("infusing ore")?;
            store::save_world(dir, &world)?;
            wallets.save(dir)?;

            println!(
                "Infused {} {} across {} node(s) using wallet {} (charged {}, new balance {})",
                receipt.units,
                receipt.ore,
                receipt.nodes.len(),
                receipt.wallet,
                receipt.charged,
                receipt.wallet_balance
            );
            for id in &receipt.nodes {
                if let Some(node) = world.ore_node(*id) {
                    println!(" - node {} at {} remaining={} ore={}", node.id, node.position, node.remaining, node.ore);
                }
            }
        }
        WorldCommand::Recharge {
            position,
            capacity,
            regen,
        } => {
            let mut world = require_idle_world(dir)?;
            let id = world.add_recharge_node(position.0, capacity, regen)?;
            store::save_world(dir, &world)?;
            println!(
                "Added recharge node {} at {} (capacity={}, regen/tick={})",
                id, position.0, capacity, regen
            );
        }
        WorldCommand::List { ore, structure, zone } => {
            let world = require_world(dir)?;
            let all = !ore && !structure && !zone;
            if ore || all {
                print_nodes(&world);
            }
            if structure || all {
                print_structures(&world);
            }
            if zone || all {
                print_zones(&world);
            }
        }
        WorldCommand::View { json } => {
            let snapshot = match load_world_snapshot(dir)? {
                Some(snapshot) => snapshot,
                None => {
                    let snapshot = WorldSnapshot::from_world(&require_world(dir)?);
                    store::write_json_atomic(&dir.snapshot(), &snapshot)?;
                    snapshot
                }
            };
            println!(
                "World snapshot v{}: tick={} | agents={} | structures={} | ore_nodes={} | recharge_nodes={}",
                snapshot.version,
                snapshot.tick,
                snapshot.agents.len(),
                snapshot.structures.len(),
                snapshot.ore_nodes.len(),
                snapshot.recharge_nodes.len()
            );
            println!(
                "Snapshot file: {} (pass --json to print it here)",
                dir.snapshot().display()
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }
    }

    Ok(())
}

fn print_nodes(world: &WorldState) {
    if world.ore_nodes().next().is_none() {
        println!("No ore nodes infused yet. Use `harimu world infuse` to add some.");
    } else {
        println!("{} ore node(s):", world.ore_nodes().count());
        for node in world.ore_nodes() {
            let decay = node
                .decay
                .map_or_else(|| "-".to_string(), |d| format!("{} every {} ticks", d.amount, d.every));
            println!(
                " - {}: pos={} remaining={} ore={} decay={}",
                node.id, node.position, node.remaining, node.ore, decay
            );
        }
    }
    for node in world.recharge_nodes() {
        println!(
            " - recharge {}: pos={} charge={}/{} regen/tick={}",
            node.id, node.position, node.charge, node.capacity, node.regen_per_tick
        );
    }
}

fn print_structures(world: &WorldState) {
    if world.structures().next().is_none() {
        println!("No structures built yet.");
        return;
    }
    println!("{} structure(s):", world.structures().count());
    for s in world.structures() {
        let program = s
            .program
            .as_ref()
            .map_or_else(String::new, |p| format!(" program={}B", p.len()));
        println!(" - id={} kind={} owner=#{} pos={}{}", s.id, s.kind, s.owner, s.position, program);
    }
}

fn print_zones(world: &WorldState) {
    if world.zones().next().is_none() {
        println!("No zones claimed yet.");
        return;
    }
    for zone in world.zones() {
        println!(
            " - zone {}: {}..{} claimant=#{} members={:?}",
            zone.id, zone.region.min, zone.region.max, zone.claimant, zone.members
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_requires_four_parts_and_positive_radius() {
        let SpreadArg(spread) = "1,2,3,4".parse().unwrap();
        assert_eq!(spread.center, Position::new(1, 2, 3));
        assert_eq!(spread.radius, 4);
        assert!("1,2,3".parse::<SpreadArg>().is_err());
        assert!("0,0,0,-1".parse::<SpreadArg>().is_err());
    }
}
