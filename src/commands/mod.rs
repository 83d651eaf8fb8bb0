use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use harimu::{
    ActionKind, ActionStatsStore, Brain, BrainMode, Event, EventKind, LlmBrain, LlmClient,
    LlmProvider, LoopBrain, Position, RunPlan, RuntimeState, ScriptedBrain, SimConfig,
    SnapshotWriter, StateDir, Status, StopReason, TickEngine, TickOutcome, WalletStore,
    WorldState, config, state, store,
};
use tracing::warn;

mod agent;
mod wallet;
mod world;

use agent::{AgentCommand, run_agent};
use wallet::{WalletCommand, run_wallet, run_wallet_mine};
use world::{WorldCommand, run_world};

#[derive(Parser)]
#[command(
    name = "harimu",
    version,
    about = "Harimu sandbox CLI (agents, Qi, ticks)",
    long_about = None
)]
pub struct Cli {
    /// State directory (default $HARIMU_HOME, then .harimu)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize local Harimu state
    Init {
        /// Reset an existing world, event log and stats (wallets are kept)
        #[arg(long)]
        force: bool,
    },
    /// Run the tick loop for continuous or bounded ticks
    Start(StartArgs),
    /// Show runtime status
    Status,
    /// Ask a running loop to stop after its current tick
    Stop {
        /// Mark the runtime stopped without waiting, e.g. after the loop crashed
        #[arg(long)]
        force: bool,
    },
    /// Agent operations
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    /// Wallet operations (local, file-backed)
    Wallet {
        #[command(subcommand)]
        command: WalletCommand,
    },
    /// World operations (ore and recharge nodes, snapshots)
    World {
        #[command(subcommand)]
        command: WorldCommand,
    },
    /// Mine Qi into a wallet using PoW
    Mine {
        /// Optional wallet address (defaults to first wallet)
        #[arg(long)]
        address: Option<String>,
        /// Starting nonce (defaults to the wallet's next nonce)
        #[arg(long)]
        start_nonce: Option<u64>,
        /// Hash attempts per round
        #[arg(long, default_value_t = 100_000)]
        iterations: u64,
        /// Number of rounds
        #[arg(long, default_value_t = 1)]
        rounds: u64,
        /// Delay between rounds in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

#[derive(Args, Clone, Debug)]
pub struct StartArgs {
    /// Number of ticks to run (omit for continuous)
    #[arg(short = 't', long)]
    pub ticks: Option<u64>,
    /// Decision driver: loop (fixed cycle), llm, or script (replay a file)
    #[arg(long, default_value_t = BrainMode::Llm, value_enum)]
    pub brain: BrainMode,
    /// Script file for --brain script, one `<agent_id> <action>` per line
    #[arg(long)]
    pub script: Option<PathBuf>,
    /// LLM host/base URL (defaults to config.toml, then OpenAI)
    #[arg(long)]
    pub llm_host: Option<String>,
    /// Model name (e.g. gpt-5-nano, gpt-4o-mini, glm-4.6:cloud)
    #[arg(long)]
    pub llm_model: Option<String>,
    /// LLM provider: openai (/v1/chat/completions) or ollama (/api/chat)
    #[arg(long, value_enum)]
    pub llm_provider: Option<LlmProvider>,
    /// API key for OpenAI-compatible providers (also reads LLM_API_KEY env var)
    #[arg(long)]
    pub llm_api_key: Option<String>,
    /// Upper bound on one brain decision in ms
    #[arg(long, alias = "llm-timeout-ms")]
    pub brain_timeout_ms: Option<u64>,
    /// Desired tick rate (ticks per second). If set, overrides delay-ms.
    #[arg(long)]
    pub tick_rate: Option<f64>,
    /// Delay between ticks in ms (used when --tick-rate is not set; 0 falls back to engine.tick_rate, then 1 tick/sec)
    #[arg(short = 'd', long, default_value_t = 0)]
    pub delay_ms: u64,
    /// Action token for the loop brain (repeatable), e.g. scan | move:1,0,0 | harvest_qi_ore
    #[arg(short = 'a', long = "action", value_name = "ACTION")]
    pub actions: Vec<ActionKind>,
    /// Run in the foreground (default is background)
    #[arg(long, action = ArgAction::SetTrue, default_value_t = false)]
    pub foreground: bool,
    /// Internal flag for background child process (do not use directly)
    #[arg(long, hide = true, default_value_t = false)]
    pub background_child: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PositionArg(pub Position);

impl FromStr for PositionArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.trim().split(',').collect();
        if parts.len() != 3 {
            return Err("Position must be formatted as x,y,z".into());
        }
        let coord = |idx: usize, name: &str| {
            parts[idx]
                .trim()
                .parse::<i32>()
                .map_err(|_| format!("{} must be an integer", name))
        };
        Ok(PositionArg(Position::new(coord(0, "x")?, coord(1, "y")?, coord(2, "z")?)))
    }
}

pub fn run() {
    let cli = Cli::parse();
    let dir = cli.home.map(StateDir::new).unwrap_or_else(StateDir::from_env);
    if let Err(err) = dispatch(&dir, cli.command) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn dispatch(dir: &StateDir, command: Command) -> Result<()> {
    match command {
        Command::Init { force } => run_init(dir, force),
        Command::Start(args) => run_start(dir, args),
        Command::Status => run_status(dir),
        Command::Stop { force } => run_stop(dir, force),
        Command::Agent { command } => run_agent(dir, command),
        Command::Wallet { command } => run_wallet(dir, command),
        Command::World { command } => run_world(dir, command),
        Command::Mine {
            address,
            start_nonce,
            iterations,
            rounds,
            delay_ms,
        } => run_wallet_mine(dir, address, start_nonce, iterations, rounds, delay_ms),
    }
}

fn load_config(dir: &StateDir) -> Result<SimConfig> {
    SimConfig::load(&dir.config()).context("loading config.toml")
}

/// Persisted world, or an error telling the user to run `harimu init`.
fn require_world(dir: &StateDir) -> Result<WorldState> {
    store::load_world(dir)?
        .ok_or_else(|| anyhow!("world not initialized at {}; run `harimu init`", dir.root().display()))
}

/// Refuse to touch `world.json` while a tick loop owns it; the loop would
/// overwrite the change on its next tick.
fn ensure_no_active_loop(dir: &StateDir) -> Result<()> {
    if let Some(runtime) = state::active_loop(dir)? {
        bail!(
            "a tick loop is {} (last tick {}); run `harimu stop` and wait for it to exit first",
            runtime.status.label(),
            runtime.last_tick
        );
    }
    Ok(())
}

/// Persisted world for a command that changes it.
fn require_idle_world(dir: &StateDir) -> Result<WorldState> {
    ensure_no_active_loop(dir)?;
    require_world(dir)
}

fn run_init(dir: &StateDir, force: bool) -> Result<()> {
    ensure_no_active_loop(dir)?;
    if dir.world().exists() && !force {
        bail!(
            "already initialized at {}; pass --force to reset the world",
            dir.root().display()
        );
    }
    dir.ensure()?;
    let config = load_config(dir)?;
    let wallets = WalletStore::load(dir)?;

    let mut world = WorldState::new(config.world);
    for wallet in wallets.wallets.values() {
        world.register_wallet_key(&wallet.address, &wallet.public_key);
    }
    store::save_world(dir, &world)?;
    store::remove_if_exists(&dir.events())?;
    store::remove_if_exists(&dir.snapshot())?;
    ActionStatsStore::reset(dir)?;
    RuntimeState::init(dir)?;

    println!("Initialized Harimu state at {}", dir.root().display());
    if !wallets.wallets.is_empty() {
        println!("Kept {} wallet(s)", wallets.wallets.len());
    }
    Ok(())
}

fn run_status(dir: &StateDir) -> Result<()> {
    let Some(runtime) = RuntimeState::load(dir)? else {
        println!("Status: not initialized. Run `harimu init`.");
        return Ok(());
    };
    println!(
        "Status: {} | last_tick={} | message={} | updated={}",
        runtime.status.label(),
        runtime.last_tick,
        runtime.message.as_deref().unwrap_or("-"),
        runtime
            .updated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into())
    );
    if let Ok(pid) = fs::read_to_string(dir.pid()) {
        println!("Background pid: {}", pid.trim());
    }
    if let Some(world) = store::load_world(dir)? {
        println!(
            "World: tick={} | agents alive={}/{} | total_qi={} | ambient_pool={} | recycle_reserve={}",
            world.tick(),
            world.alive_agent_ids().len(),
            world.agents().count(),
            world.total_qi(),
            world.ambient_pool(),
            world.recycle_reserve()
        );
    }
    Ok(())
}

fn run_stop(dir: &StateDir, force: bool) -> Result<()> {
    let Some(runtime) = RuntimeState::load(dir)? else {
        bail!("not initialized; run `harimu init` first");
    };
    if force {
        state::set_status(dir, Status::Stopped, runtime.last_tick, Some("marked stopped by --force".into()))?;
        store::remove_if_exists(&dir.pid())?;
        println!("Marked the runtime stopped at tick {}.", runtime.last_tick);
    } else if state::request_stop(dir)? {
        println!("Stop requested; the loop exits after its current tick.");
    } else {
        println!("No running loop.");
    }
    print_action_summary(dir)
}

fn run_start(dir: &StateDir, args: StartArgs) -> Result<()> {
    ensure_no_active_loop(dir)?;
    if !args.foreground && !args.background_child {
        return launch_background_start(dir, &args);
    }

    let config = load_config(dir)?;
    let world = require_world(dir)?;
    if world.alive_agent_ids().is_empty() {
        bail!("no alive agents; create one with `harimu agent create`");
    }
    let keyring = WalletStore::load(dir)?
        .keyring()
        .context("loading wallet keys")?;

    let plan = RunPlan {
        ticks: args.ticks,
        pacing: start_pacing(&args, &config)?,
    };
    let timeout = Duration::from_millis(
        args.brain_timeout_ms
            .unwrap_or(config.engine.brain_timeout_ms),
    );
    let writer = SnapshotWriter::new(dir, config.engine.keep_snapshot_history);

    match args.brain {
        BrainMode::Loop => {
            let cycle = args.actions.iter().map(ToString::to_string).collect();
            let engine = TickEngine::new(LoopBrain::new(cycle), keyring, timeout).with_snapshots(writer);
            drive(dir, engine, world, plan)
        }
        BrainMode::Script => {
            let path = args
                .script
                .as_ref()
                .context("--script is required with --brain script")?;
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading script {}", path.display()))?;
            let brain = ScriptedBrain::parse(&text)?;
            let engine = TickEngine::new(brain, keyring, timeout).with_snapshots(writer);
            drive(dir, engine, world, plan)
        }
        BrainMode::Llm => {
            let api_key = args
                .llm_api_key
                .clone()
                .or_else(|| env::var("LLM_API_KEY").ok())
                .or_else(|| load_llm_key_from_file(dir));
            let client = LlmClient::new(
                args.llm_host.clone().unwrap_or(config.llm.host),
                args.llm_model.clone().unwrap_or(config.llm.model),
                args.llm_provider.unwrap_or(config.llm.provider),
                api_key,
            )
            .context("llm client")?;
            let brain = LlmBrain::new(client, dir.llm_log());
            let engine = TickEngine::new(brain, keyring, timeout).with_snapshots(writer);
            drive(dir, engine, world, plan)
        }
    }
}

/// CLI `--tick-rate`, then `--delay-ms`, then `engine.tick_rate` from config.
fn start_pacing(args: &StartArgs, config: &SimConfig) -> Result<Duration> {
    let rate = args
        .tick_rate
        .or_else(|| (args.delay_ms == 0).then_some(config.engine.tick_rate).flatten());
    config::pacing(rate, args.delay_ms).context("tick pacing")
}

fn drive<B: Brain>(dir: &StateDir, mut engine: TickEngine<B>, world: WorldState, plan: RunPlan) -> Result<()> {
    if world.tick() > 0 {
        println!("Resuming from tick {}", world.tick());
    }
    state::set_status(dir, Status::Running, world.tick(), Some("tick loop running".into()))?;
    let mut stats = ActionStatsStore::load(dir)?;

    let result = engine.run(
        world,
        plan,
        || state::stop_requested(dir),
        |world, outcome| {
            store::save_world(dir, world)?;
            store::append_events(&dir.events(), &outcome.events)?;
            stats.record_all(&outcome.decisions);
            stats.save(dir)?;
            print_tick(world, outcome);
            state::record_tick(dir, world.tick())?;
            Ok(())
        },
    );

    let superseded = engine.finish();
    if !superseded.is_empty() {
        warn!(?superseded, "some tick snapshots were not written");
    }
    store::remove_if_exists(&dir.pid())?;

    match result {
        Ok(summary) => {
            let message = match summary.reason {
                StopReason::Completed => format!("completed {} tick(s)", summary.ticks_run),
                StopReason::Requested => "stopped by user".to_string(),
                StopReason::Extinct => "no alive agents left".to_string(),
            };
            state::set_status(dir, Status::Stopped, summary.state.tick(), Some(message.clone()))?;
            println!("Loop finished at tick {}: {}", summary.state.tick(), message);
            print_action_summary(dir)
        }
        Err(aborted) => {
            state::set_status(
                dir,
                Status::Stopped,
                aborted.state.tick(),
                Some(format!("aborted: {}", aborted.error)),
            )?;
            Err(aborted).context("tick loop aborted; the last good world is kept on disk")
        }
    }
}

fn load_llm_key_from_file(dir: &StateDir) -> Option<String> {
    let data = fs::read_to_string(dir.root().join(".key")).ok()?;
    let trimmed = data.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn print_action_summary(dir: &StateDir) -> Result<()> {
    let stats = ActionStatsStore::load(dir)?;
    if stats.per_agent.is_empty() {
        println!("No action stats recorded.");
        return Ok(());
    }
    println!("Action summary per agent:");
    for (agent, tally) in &stats.per_agent {
        let actions: Vec<String> = tally
            .actions
            .iter()
            .map(|(label, count)| format!("{}={}/{}", label, count.accepted, count.rejected))
            .collect();
        println!(
            " - agent {} | accepted={} rejected={} fallbacks={} | {}",
            agent,
            tally.accepted(),
            tally.rejected(),
            tally.fallbacks,
            actions.join(" ")
        );
    }
    Ok(())
}

fn print_tick(world: &WorldState, outcome: &TickOutcome) {
    let rejected = outcome.decisions.iter().filter(|d| !d.accepted()).count();
    println!(
        "Tick {}: {} events, {} rejections, total_qi={}",
        outcome.tick,
        outcome.events.len(),
        rejected,
        outcome.audit.after
    );
    for event in &outcome.events {
        if matches!(event.kind, EventKind::TickStarted | EventKind::TickCompleted { .. }) {
            continue;
        }
        println!(" - {}", describe_event(event));
    }
    for decision in &outcome.decisions {
        if let Some(reason) = &decision.fallback {
            println!(" ! agent #{} idled: {}", decision.agent_id, reason);
        }
        if let Some(agent) = world.agent(decision.agent_id) {
            println!(
                "Agent #{} | qi={} | transistors={} | position={} | status={} | age={}/{}",
                agent.id,
                agent.qi,
                agent.transistors,
                agent.position,
                agent.status.label(),
                agent.age,
                agent.max_age
            );
        }
    }
}

fn describe_event(event: &Event) -> String {
    match &event.kind {
        EventKind::AgentSpawned {
            agent_id,
            qi,
            position,
            parent,
            ..
        } => match parent {
            Some(parent) => format!("agent #{} born to #{} with qi={} at {}", agent_id, parent, qi, position),
            None => format!("agent #{} spawned with qi={} at {}", agent_id, qi, position),
        },
        EventKind::ActionObserved { agent_id, action, .. } => {
            format!("agent #{} observed ({})", agent_id, action)
        }
        EventKind::ActionRejected {
            agent_id,
            action,
            reason,
            ..
        } => format!("agent #{} action {} rejected: {}", agent_id, action, reason),
        EventKind::QiSpent {
            agent_id,
            amount,
            action,
        } => format!("agent #{} spent {} qi on {}", agent_id, amount, action),
        EventKind::QiGained {
            agent_id,
            amount,
            source,
        } => format!("agent #{} gained {} qi from {}", agent_id, amount, source),
        EventKind::AgentMoved { agent_id, from, to } => {
            format!("agent #{} moved from {} to {}", agent_id, from, to)
        }
        EventKind::OreMined {
            agent_id,
            node_id,
            ore,
            amount,
            remaining,
        } => format!(
            "agent #{} mined {} {} from node {} (remaining={})",
            agent_id, amount, ore, node_id, remaining
        ),
        EventKind::OreNodeDrained { node_id, ore, position } => {
            format!("{} node {} drained at {}", ore, node_id, position)
        }
        EventKind::RechargeDocked {
            agent_id,
            node_id,
            amount,
        } => format!("agent #{} docked at node {} for {} qi", agent_id, node_id, amount),
        EventKind::StructureBuilt {
            agent_id,
            structure_id,
            kind,
            position,
        } => format!("agent #{} built {} structure {} at {}", agent_id, kind, structure_id, position),
        EventKind::AgentReproduced {
            parent,
            child,
            endowment,
        } => format!("agent #{} reproduced; child #{} got {} qi", parent, child, endowment),
        EventKind::AgentDied { agent_id, reason, age } => {
            format!("agent #{} died at age {}: {:?}", agent_id, age, reason)
        }
        other => serde_json::to_string(other).unwrap_or_else(|_| other.name().to_string()),
    }
}

fn launch_background_start(dir: &StateDir, args: &StartArgs) -> Result<()> {
    let exe = env::current_exe().context("current_exe")?;
    let mut argv = vec!["--home".to_string(), dir.root().display().to_string()];
    argv.extend(render_start_args(args));
    argv.push("--background-child".into());

    let child = std::process::Command::new(exe)
        .args(&argv)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to spawn background process")?;

    dir.ensure()?;
    let pid_path = dir.pid();
    fs::write(&pid_path, child.id().to_string())
        .with_context(|| format!("failed to write pid file {}", pid_path.display()))?;

    println!(
        "Started background tick loop (pid={}). Stop with `harimu stop`.",
        child.id()
    );
    Ok(())
}

fn render_start_args(args: &StartArgs) -> Vec<String> {
    let mut argv = vec!["start".to_string()];
    if let Some(t) = args.ticks {
        argv.push("--ticks".into());
        argv.push(t.to_string());
    }
    argv.push("--brain".into());
    argv.push(brain_to_arg(args.brain).into());
    if let Some(script) = &args.script {
        argv.push("--script".into());
        argv.push(script.display().to_string());
    }
    let optional = [
        ("--llm-host", args.llm_host.clone()),
        ("--llm-model", args.llm_model.clone()),
        ("--llm-provider", args.llm_provider.map(|p| llm_provider_to_arg(p).to_string())),
        ("--llm-api-key", args.llm_api_key.clone()),
        ("--brain-timeout-ms", args.brain_timeout_ms.map(|ms| ms.to_string())),
        ("--tick-rate", args.tick_rate.map(|rate| rate.to_string())),
    ];
    for (flag, value) in optional {
        if let Some(value) = value {
            argv.push(flag.into());
            argv.push(value);
        }
    }
    if args.tick_rate.is_none() {
        argv.push("--delay-ms".into());
        argv.push(args.delay_ms.to_string());
    }
    for action in &args.actions {
        argv.push("--action".into());
        argv.push(action.to_string());
    }
    argv
}

fn brain_to_arg(brain: BrainMode) -> &'static str {
    match brain {
        BrainMode::Loop => "loop",
        BrainMode::Llm => "llm",
        BrainMode::Script => "script",
    }
}

fn llm_provider_to_arg(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::Ollama => "ollama",
        LlmProvider::Openai => "openai",
    }
}
