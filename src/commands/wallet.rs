use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use harimu::{MineOutcome, Qi, StateDir, WalletStore, state, store, wallet};

use super::load_config;

#[derive(Subcommand)]
pub enum WalletCommand {
    /// Create a new wallet (ed25519 keypair)
    Create,
    /// Check balance for a wallet
    Balance {
        /// Wallet address (defaults to first wallet if omitted)
        #[arg(long)]
        address: Option<String>,
    },
    /// List all wallets
    List,
    /// Transfer Qi between wallets
    Transfer {
        /// Sender address
        #[arg(long)]
        from: String,
        /// Recipient address
        #[arg(long)]
        to: String,
        /// Amount of Qi to transfer
        #[arg(long)]
        amount: Qi,
    },
}

pub(super) fn run_wallet(dir: &StateDir, cmd: WalletCommand) -> Result<()> {
    let mut wallets = WalletStore::load(dir)?;

    match cmd {
        WalletCommand::Create => {
            let wallet = wallets.create().clone();
            wallets.save(dir)?;
            println!("Created wallet: {}", wallet.address);
            // An initialised world learns the key right away so agents can be signed for.
            // A running loop owns the world; `agent create` registers the key later.
            if state::active_loop(dir)?.is_some() {
                println!("Tick loop running; the key is registered when an agent is created.");
            } else if let Some(mut world) = store::load_world(dir)? {
                world.register_wallet_key(&wallet.address, &wallet.public_key);
                store::save_world(dir, &world)?;
            }
        }
        WalletCommand::Balance { address } => {
            let wallet = wallets.resolve(address.as_deref())?;
            println!("Wallet {} balance: {} Qi", wallet.address, wallet.balance);
        }
        WalletCommand::List => {
            if wallets.wallets.is_empty() {
                println!("No wallets found");
            }
            for wallet in wallets.wallets.values() {
                println!(
                    "{} | balance={} | next_nonce={}",
                    wallet.address, wallet.balance, wallet.next_nonce
                );
            }
        }
        WalletCommand::Transfer { from, to, amount } => {
            wallets.transfer(&from, &to, amount)?;
            wallets.save(dir)?;
            println!("Transferred {} Qi from {} to {}", amount, from, to);
        }
    }

    Ok(())
}

pub(super) fn run_wallet_mine(
    dir: &StateDir,
    address: Option<String>,
    start_nonce: Option<u64>,
    iterations: u64,
    rounds: u64,
    delay_ms: u64,
) -> Result<()> {
    let config = load_config(dir)?;
    let params = config.mining.params(iterations);
    let mut wallets = WalletStore::load(dir)?;
    let address = wallets.resolve(address.as_deref())?.address.clone();

    println!(
        "Mining for wallet {} ({} attempt(s) per round, difficulty {} leading zero bit(s))",
        address, iterations, params.difficulty_bits
    );

    let mut nonce = start_nonce;
    let mut found = 0u64;
    for round in 1..=rounds {
        let outcome = wallet::mine(&mut wallets, &address, nonce.take(), params)?;
        wallets.save(dir)?;
        match outcome {
            MineOutcome::Found {
                start_nonce,
                attempt,
                hash,
                reward,
                balance,
            } => {
                found += 1;
                println!(
                    "[{}] Mined {} Qi at nonce {} attempt {} | hash={} | balance={}",
                    round, reward, start_nonce, attempt, hash, balance
                );
            }
            MineOutcome::Exhausted {
                start_nonce,
                attempts,
            } => println!(
                "[{}] No solution at nonce {} after {} attempt(s)",
                round, start_nonce, attempts
            ),
        }

        if delay_ms > 0 && round < rounds {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }
    }
    println!("Rounds with a reward: {}/{}", found, rounds);
    Ok(())
}
