use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use iskra::{
    JsonStore, LlmClient, LlmProvider, OfflineGenerator, SimConfig, Simulation, Store,
    SystemClock, TextGenerator, agents, save_world_snapshot,
    state::{self, Status},
    view,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod agent;
mod chat;
mod world;

use agent::{AgentCommand, run_agent};
use chat::run_chat;
use world::{WorldCommand, run_world};

const STATE_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "iskra",
    version,
    about = "Iskra agent dialogue engine (ticks, conversations, human chat)",
    long_about = None
)]
pub struct Cli {
    /// Config file (defaults to ./iskra.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// World file (defaults to .iskra/world.json)
    #[arg(long, global = true)]
    pub world_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize local state and seed the first agents
    Init {
        /// Number of agents to seed into an empty world
        #[arg(long)]
        agents: Option<usize>,
        /// RNG seed for reproducible names and positions
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the engine until stopped or for a bounded number of ticks
    Run {
        /// Number of ticks to run (omit for continuous)
        #[arg(short = 't', long)]
        ticks: Option<u64>,
        /// Milliseconds between ticks (overrides the config file)
        #[arg(short = 'd', long)]
        tick_ms: Option<u64>,
        #[command(flatten)]
        llm: LlmArgs,
        /// RNG seed for the scheduler
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show runtime status
    Status,
    /// Ask a running engine to stop
    Stop,
    /// Agent registry operations
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    /// Read-only world views (events, dialogues, thoughts, snapshot)
    World {
        #[command(subcommand)]
        command: WorldCommand,
    },
    /// Send a message to an agent and wait for the reply
    Chat {
        /// Agent id to talk to
        #[arg(long)]
        agent: u64,
        /// Your user name
        #[arg(long, default_value = "guest")]
        user: String,
        /// The message
        message: String,
        /// How long to wait for the reply
        #[arg(long, default_value_t = 60)]
        wait_secs: u64,
        #[command(flatten)]
        llm: LlmArgs,
    },
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct LlmArgs {
    /// LLM provider: openai (OpenAI-style /v1/chat/completions) or ollama (local /api/chat)
    #[arg(long, value_enum)]
    pub llm_provider: Option<LlmProvider>,
    /// LLM host/base URL
    #[arg(long)]
    pub llm_host: Option<String>,
    /// Model name, interpreted by the selected provider
    #[arg(long)]
    pub llm_model: Option<String>,
    /// LLM timeout in ms
    #[arg(long)]
    pub llm_timeout_ms: Option<u64>,
    /// API key for OpenAI-compatible providers (also reads ISKRA_LLM_API_KEY and .iskra/.key)
    #[arg(long)]
    pub llm_api_key: Option<String>,
    /// Never call a model; every reply is scripted
    #[arg(long, default_value_t = false)]
    pub offline: bool,
}

pub fn run() {
    init_tracing();
    let cli = Cli::parse();
    let ctx = Context {
        config: cli.config,
        world: cli.world_file,
    };
    if let Err(err) = dispatch(&ctx, cli.command) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Paths shared by every subcommand.
pub(crate) struct Context {
    config: Option<PathBuf>,
    world: Option<PathBuf>,
}

impl Context {
    pub(crate) fn load_config(&self) -> Result<SimConfig, String> {
        SimConfig::load(self.config.as_deref()).map_err(|e| e.to_string())
    }

    pub(crate) fn store(&self) -> Arc<JsonStore> {
        let path = self.world.clone().unwrap_or_else(JsonStore::default_path);
        Arc::new(JsonStore::open(path))
    }
}

fn dispatch(ctx: &Context, command: Command) -> Result<(), String> {
    match command {
        Command::Init { agents, seed } => run_init(ctx, agents, seed),
        Command::Run {
            ticks,
            tick_ms,
            llm,
            seed,
        } => run_engine(ctx, ticks, tick_ms, llm, seed),
        Command::Status => run_status(ctx),
        Command::Stop => run_stop(),
        Command::Agent { command } => run_agent(ctx, command),
        Command::World { command } => run_world(ctx, command),
        Command::Chat {
            agent,
            user,
            message,
            wait_secs,
            llm,
        } => run_chat(ctx, agent, &user, &message, Duration::from_secs(wait_secs), llm),
    }
}

fn run_init(ctx: &Context, count: Option<usize>, seed: Option<u64>) -> Result<(), String> {
    let mut config = ctx.load_config()?;
    if let Some(count) = count {
        config.initial_agents = count;
    }
    state::init_state().map_err(|e| e.to_string())?;
    println!(
        "Initialized state at {}",
        state::state_file_path().display()
    );

    let store = ctx.store();
    let mut rng = seed_rng(seed);
    let mut session = store.begin().map_err(|e| e.to_string())?;
    let created = agents::seed_agents(&mut session, &config, &mut rng, chrono::Utc::now())
        .map_err(|e| e.to_string())?;
    if created.is_empty() {
        println!("World at {} already has agents", store.path().display());
        return Ok(());
    }
    store.commit(session).map_err(|e| e.to_string())?;
    println!(
        "Seeded {} agent(s) into {}",
        created.len(),
        store.path().display()
    );
    Ok(())
}

fn run_status(ctx: &Context) -> Result<(), String> {
    match state::load_state().map_err(|e| e.to_string())? {
        None => {
            println!("Status: not initialized. Run `iskra init`.");
        }
        Some(state) => {
            println!(
                "Status: {:?} | last_cycle={} | message={}",
                state.status,
                state.last_cycle,
                state.message.unwrap_or_else(|| "-".into())
            );
        }
    }

    let data = ctx.store().load().map_err(|e| e.to_string())?;
    let snapshot = view::world_snapshot(&data, chrono::Utc::now());
    println!(
        "World: cycle={} | complexity={:.3} | agents={} | mean_energy={:.2} | dialogues={} | thoughts={}",
        snapshot.cycle,
        snapshot.complexity,
        snapshot.agents.len(),
        snapshot.mean_energy,
        snapshot.dialogues,
        snapshot.thoughts
    );
    Ok(())
}

fn run_stop() -> Result<(), String> {
    let current = state::load_state().map_err(|e| e.to_string())?;
    let Some(prev) = current else {
        return Err("Not initialized. Run `iskra init` first.".into());
    };
    let updated = state::set_status(
        Status::Stopped,
        prev.last_cycle,
        Some("stopped by user".into()),
    )
    .map_err(|e| e.to_string())?;
    println!("Stopped. last_cycle={}", updated.last_cycle);
    Ok(())
}

fn run_engine(
    ctx: &Context,
    ticks: Option<u64>,
    tick_ms: Option<u64>,
    llm: LlmArgs,
    seed: Option<u64>,
) -> Result<(), String> {
    let mut config = ctx.load_config()?;
    if let Some(ms) = tick_ms {
        if ms == 0 {
            return Err("tick_ms must be greater than 0".into());
        }
        config.tick_interval_ms = ms;
    }

    if state::load_state().map_err(|e| e.to_string())?.is_none() {
        let initialized = state::init_state().map_err(|e| e.to_string())?;
        println!(
            "State not found; initialized new state at {} (status={:?})",
            state::state_file_path().display(),
            initialized.status
        );
    }

    let store = ctx.store();
    let data = store.load().map_err(|e| e.to_string())?;
    if data.agents.is_empty() {
        return Err("no agents found; run `iskra init` or `iskra agent create`".to_string());
    }
    if let Some(world) = data.world.as_ref() {
        println!("Resuming from cycle {}", world.cycle);
    }

    let generator = build_generator(&mut config, &llm)?;
    let store: Arc<dyn Store> = store;
    let sim = Simulation::start(
        config.clone(),
        Arc::clone(&store),
        generator,
        Arc::new(SystemClock::new()),
        seed,
        ticks,
    )
    .map_err(|e| e.to_string())?;

    state::set_status(Status::Running, current_cycle(&sim), Some("engine running".into()))
        .map_err(|e| e.to_string())?;

    let mut last_published = Instant::now();
    while sim.is_running() {
        std::thread::sleep(STATE_POLL);
        let stop_requested = matches!(
            state::load_state(),
            Ok(Some(s)) if s.status == Status::Stopped
        );
        if stop_requested {
            info!("stop requested");
            break;
        }
        if last_published.elapsed() >= config.tick_interval() {
            publish_progress(&sim);
            last_published = Instant::now();
        }
    }

    let cycle = current_cycle(&sim);
    sim.stop();
    persist_world_view(store.as_ref());
    state::set_status(
        Status::Stopped,
        cycle,
        Some(format!("stopped at cycle {}", cycle)),
    )
    .map_err(|e| e.to_string())?;
    println!("Engine stopped at cycle {}", cycle);
    Ok(())
}

fn current_cycle(sim: &Simulation) -> u64 {
    sim.snapshot()
        .ok()
        .and_then(|data| data.world.map(|w| w.cycle))
        .unwrap_or(0)
}

fn publish_progress(sim: &Simulation) {
    let data = match sim.snapshot() {
        Ok(data) => data,
        Err(err) => {
            warn!(error = %err, "failed to read world for status update");
            return;
        }
    };
    let snapshot = view::world_snapshot(&data, chrono::Utc::now());
    if let Err(err) = save_world_snapshot(&snapshot) {
        warn!(error = %err, "failed to write world snapshot");
    }
    if let Err(err) = state::set_status(
        Status::Running,
        snapshot.cycle,
        Some("engine running".into()),
    ) {
        warn!(error = %err, "failed to update runtime state");
    }
    println!(
        "Cycle {} | agents={} | dialogues={} | mean_energy={:.2}",
        snapshot.cycle,
        snapshot.agents.len(),
        snapshot.dialogues,
        snapshot.mean_energy
    );
}

fn persist_world_view(store: &dyn Store) {
    match store.load() {
        Ok(data) => {
            let snapshot = view::world_snapshot(&data, chrono::Utc::now());
            if let Err(err) = save_world_snapshot(&snapshot) {
                eprintln!("warning: failed to write world snapshot: {}", err);
            }
        }
        Err(err) => eprintln!("warning: failed to read world: {}", err),
    }
}

/// Applies CLI overrides to the config's LLM settings and picks a generator.
/// Without usable credentials every reply falls back to scripted text.
pub(crate) fn build_generator(
    config: &mut SimConfig,
    args: &LlmArgs,
) -> Result<Arc<dyn TextGenerator>, String> {
    if args.offline {
        info!("offline mode; replies will be scripted");
        return Ok(Arc::new(OfflineGenerator));
    }

    let settings = &mut config.llm;
    if let Some(provider) = args.llm_provider {
        settings.provider = provider;
    }
    if let Some(host) = args.llm_host.clone() {
        settings.host = host;
    }
    if let Some(model) = args.llm_model.clone() {
        settings.model = model;
    }
    if let Some(timeout_ms) = args.llm_timeout_ms {
        settings.timeout_ms = timeout_ms;
    }
    let api_key = args
        .llm_api_key
        .clone()
        .or_else(|| settings.api_key.clone())
        .or_else(|| env::var("LLM_API_KEY").ok())
        .or_else(state::load_key_file);
    settings.api_key = api_key;

    if !settings.has_credentials() {
        warn!(
            provider = settings.provider.label(),
            "no API key configured; replies will be scripted"
        );
        return Ok(Arc::new(OfflineGenerator));
    }

    let client = LlmClient::new(settings).map_err(|e| format!("llm client: {}", e))?;
    info!(
        provider = client.provider().label(),
        model = client.model(),
        "language model ready"
    );
    Ok(Arc::new(client))
}

fn seed_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}
