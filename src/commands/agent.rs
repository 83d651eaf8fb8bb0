use anyhow::{Context, Result, anyhow};
use clap::{Subcommand, ValueEnum};
use harimu::{
    ActionStatsStore, AgentId, AgentSpec, DeathReason, EventKind, Qi, StateDir, WalletStore,
    WorldState, lifecycle, store,
};

use super::{PositionArg, require_idle_world, require_world};

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Spawn an agent funded from a wallet
    Create {
        /// Funding wallet, which also owns the agent (defaults to first wallet)
        #[arg(long)]
        wallet: Option<String>,
        /// Starting Qi, debited from the wallet
        #[arg(long, default_value_t = 3)]
        qi: Qi,
        /// Starting position as x,y,z (nearest free cell is used)
        #[arg(short = 'p', long, default_value = "0,0,0")]
        position: PositionArg,
        /// Lifespan in ticks (defaults to the world rule)
        #[arg(long)]
        max_age: Option<u64>,
    },
    /// List all agents
    List,
    /// Show info for an agent
    Info { agent_id: AgentId },
    /// Infuse Qi from a wallet into an agent
    Infuse {
        agent_id: AgentId,
        #[arg(long)]
        amount: Qi,
        /// Funding wallet (defaults to the agent's owner)
        #[arg(long)]
        wallet: Option<String>,
    },
    /// Extend an agent's lifespan
    ExtendLife {
        agent_id: AgentId,
        /// Extra ticks added to max_age
        #[arg(long)]
        ticks: u64,
    },
    /// Queue a hazard that kills the agent on the next tick
    Hazard {
        agent_id: AgentId,
        #[arg(long, value_enum, default_value_t = HazardArg::Hazard)]
        reason: HazardArg,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HazardArg {
    Hazard,
    Corruption,
}

impl From<HazardArg> for DeathReason {
    fn from(arg: HazardArg) -> Self {
        match arg {
            HazardArg::Hazard => DeathReason::Hazard,
            HazardArg::Corruption => DeathReason::Corruption,
        }
    }
}

/// Append events produced outside the tick loop, stamped with the current tick.
fn log_events(dir: &StateDir, world: &WorldState, kinds: Vec<EventKind>) -> Result<()> {
    store::append_at_tick(&dir.events(), world.tick(), kinds)?;
    Ok(())
}

const RECENT_EVENTS: usize = 5;

pub(super) fn run_agent(dir: &StateDir, cmd: AgentCommand) -> Result<()> {
    let mut world = match cmd {
        AgentCommand::List | AgentCommand::Info { .. } => require_world(dir)?,
        _ => require_idle_world(dir)?,
    };

    match cmd {
        AgentCommand::Create {
            wallet,
            qi,
            position,
            max_age,
        } => {
            let mut wallets = WalletStore::load(dir)?;
            let owner = wallets.resolve(wallet.as_deref())?.clone();
            wallets.debit(&owner.address, qi)?;
            world.register_wallet_key(&owner.address, &owner.public_key);
            let (id, events) = lifecycle::spawn(
                &mut world,
                AgentSpec {
                    owner: owner.address.clone(),
                    qi,
                    position: position.0,
                    max_age,
                },
            )
            .context("spawning agent")?;
            store::save_world(dir, &world)?;
            wallets.save(dir)?;
            log_events(dir, &world, events)?;

            let agent = world
                .agent(id)
                .ok_or_else(|| anyhow!("agent {} vanished after spawn", id))?;
            println!(
                "Created agent #{} owned by {} (qi={}, position={}, max_age={})",
                agent.id, agent.owner, agent.qi, agent.position, agent.max_age
            );
        }
        AgentCommand::List => {
            if world.agents().next().is_none() {
                println!("No agents found");
            }
            for agent in world.agents() {
                println!(
                    "#{} | status={} | qi={} | transistors={} | position={} | age={}/{}",
                    agent.id,
                    agent.status.label(),
                    agent.qi,
                    agent.transistors,
                    agent.position,
                    agent.age,
                    agent.max_age
                );
            }
        }
        AgentCommand::Info { agent_id } => {
            let agent = world
                .agent(agent_id)
                .ok_or_else(|| anyhow!("agent {} not found", agent_id))?;
            println!(
                "Agent #{} | owner={} | status={} | qi={} | transistors={} | position={}",
                agent.id,
                agent.owner,
                agent.status.label(),
                agent.qi,
                agent.transistors,
                agent.position
            );
            println!(
                "Age {}/{} | last_nonce={} | parent={} | offspring={:?}",
                agent.age,
                agent.max_age,
                agent.last_nonce,
                agent.parent.map_or_else(|| "-".to_string(), |p| format!("#{}", p)),
                agent.offspring
            );
            if let Some(reason) = agent.death {
                println!("Died: {:?}", reason);
            }
            for note in &agent.memory {
                println!(" * {}", note);
            }
            let events = store::read_events(&dir.events())?;
            let mine: Vec<_> = events.iter().filter(|e| e.kind.agent() == Some(agent_id)).collect();
            if !mine.is_empty() {
                println!("Recent events:");
                for event in &mine[mine.len().saturating_sub(RECENT_EVENTS)..] {
                    println!("   tick {} #{} {}", event.tick, event.seq, event.kind.name());
                }
            }
            if let Some(stats) = ActionStatsStore::load(dir)?.agent(agent_id) {
                println!(
                    "Actions: accepted={} rejected={} fallbacks={}",
                    stats.accepted(),
                    stats.rejected(),
                    stats.fallbacks
                );
            }
        }
        AgentCommand::Infuse {
            agent_id,
            amount,
            wallet,
        } => {
            let owner = world
                .agent(agent_id)
                .map(|a| a.owner.clone())
                .ok_or_else(|| anyhow!("agent {} not found", agent_id))?;
            let mut wallets = WalletStore::load(dir)?;
            let funder = wallets
                .resolve(Some(wallet.as_deref().unwrap_or(&owner)))?
                .address
                .clone();
            wallets.debit(&funder, amount)?;
            let events = lifecycle::infuse(&mut world, agent_id, amount)?;
            store::save_world(dir, &world)?;
            wallets.save(dir)?;
            log_events(dir, &world, events)?;
            let qi = world.agent(agent_id).map_or(0, |a| a.qi);
            println!(
                "Infused {} Qi from {} into agent #{} (new qi={})",
                amount, funder, agent_id, qi
            );
        }
        AgentCommand::ExtendLife { agent_id, ticks } => {
            let max_age = lifecycle::extend_life(&mut world, agent_id, ticks)?;
            store::save_world(dir, &world)?;
            println!(
                "Extended lifespan for agent #{} to {} ticks",
                agent_id, max_age
            );
        }
        AgentCommand::Hazard { agent_id, reason } => {
            lifecycle::queue_hazard(&mut world, agent_id, reason.into())?;
            store::save_world(dir, &world)?;
            println!(
                "Queued {:?} for agent #{}; it fires on the next tick",
                reason, agent_id
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use harimu::{Position, Status, state};

    use super::*;

    fn seeded(tmp: &tempfile::TempDir) -> (StateDir, String, AgentId) {
        let dir = StateDir::new(tmp.path());
        dir.ensure().unwrap();
        let mut wallets = WalletStore::default();
        let wallet = wallets.create().clone();
        wallets.credit(&wallet.address, 20).unwrap();
        wallets.save(&dir).unwrap();

        let mut world = WorldState::default();
        world.register_wallet_key(&wallet.address, &wallet.public_key);
        let (id, _) = lifecycle::spawn(
            &mut world,
            AgentSpec {
                owner: wallet.address.clone(),
                qi: 3,
                position: Position::origin(),
                max_age: None,
            },
        )
        .unwrap();
        store::save_world(&dir, &world).unwrap();
        (dir, wallet.address, id)
    }

    #[test]
    fn infusion_waits_for_the_loop_to_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, address, id) = seeded(&tmp);
        let infuse = || AgentCommand::Infuse {
            agent_id: id,
            amount: 5,
            wallet: None,
        };

        state::set_status(&dir, Status::Running, 0, None).unwrap();
        assert!(run_agent(&dir, infuse()).is_err());
        assert!(run_agent(&dir, AgentCommand::ExtendLife { agent_id: id, ticks: 5 }).is_err());
        assert!(run_agent(&dir, AgentCommand::List).is_ok());
        assert_eq!(WalletStore::load(&dir).unwrap().get(&address).unwrap().balance, 20);
        assert_eq!(store::load_world(&dir).unwrap().unwrap().agent(id).unwrap().qi, 3);

        state::request_stop(&dir).unwrap();
        assert!(run_agent(&dir, infuse()).is_err());

        state::set_status(&dir, Status::Stopped, 0, None).unwrap();
        run_agent(&dir, infuse()).unwrap();
        assert_eq!(WalletStore::load(&dir).unwrap().get(&address).unwrap().balance, 15);
        assert_eq!(store::load_world(&dir).unwrap().unwrap().agent(id).unwrap().qi, 8);
    }
}
