//! sandboxrelay daemon — headless entry point.
//!
//! Run with no subcommand to start the orchestrator: loads configuration,
//! opens the session store, wires the Discord channel adapter, and runs the
//! turn pipeline and reconciler until a shutdown signal arrives. A small set
//! of subcommands query the store directly for inspection without booting
//! the gateway connection.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use sandboxrelay::prelude::*;
use sandboxrelay::store::pool;

#[derive(Parser, Debug)]
#[command(
    name = "sandboxrelay",
    about = "Discord-facing orchestrator mapping conversation threads to sandboxes",
    version,
    long_about = "Run with no subcommand to start the orchestrator daemon.\n\
                  Subcommands inspect the session store without connecting to Discord."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config.toml (default: ~/.sandboxrelay/config.toml, or $SANDBOXRELAY_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a summary of currently tracked sessions.
    Status,
    /// Operate on tracked sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    /// List every tracked session, most recently active first.
    List,
    /// Show the full record for one thread.
    Show {
        /// Discord thread id.
        thread_id: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn resolve_config(cli: &Cli) -> AppConfig {
    match &cli.config {
        Some(path) => load_config(path).unwrap_or_else(|e| {
            error!(error = %e, path = ?path, "failed to load config, using defaults");
            AppConfig::default()
        }),
        None => load_default_config(),
    }
}

fn open_store(config: &AppConfig) -> Arc<dyn SessionStore> {
    let db_path = sandboxrelay::config::default_database_path(config)
        .expect("could not determine database path");
    let db_pool = pool::init(&db_path).expect("failed to open session store");
    Arc::new(SqliteSessionStore::new(db_pool))
}

async fn run_status(store: Arc<dyn SessionStore>) {
    let active = store.list_active().await.unwrap_or_default();
    let tracked = store.list_tracked().await.unwrap_or_default();
    println!("tracked sessions: {}", tracked.len());
    println!("active sessions:  {}", active.len());
}

async fn run_sessions(store: Arc<dyn SessionStore>, action: SessionsAction) {
    match action {
        SessionsAction::List => {
            let sessions = store.list_tracked().await.unwrap_or_default();
            if sessions.is_empty() {
                println!("no tracked sessions");
                return;
            }
            for s in sessions {
                println!(
                    "{}  {:<10}  sandbox={}  updated_at={}",
                    s.thread_id, s.status, s.sandbox_id, s.updated_at
                );
            }
        }
        SessionsAction::Show { thread_id } => match store.get_by_thread(&thread_id).await {
            Ok(Some(record)) => println!("{record:#?}"),
            Ok(None) => println!("no session tracked for thread {thread_id}"),
            Err(e) => error!(error = %e, "failed to look up session"),
        },
    }
}

/// Build and run the orchestrator (gateway connection, turn pipeline,
/// reconciler) until a shutdown signal arrives.
async fn run_orchestrator(config: AppConfig, store: Arc<dyn SessionStore>) {
    let sandbox: Arc<dyn SandboxAPI> = Arc::new(HttpSandboxAPI::new(config.sandbox_provider.clone()));
    let agent: Arc<dyn AgentClient> = Arc::new(HttpAgentClient::new());

    let discord = Arc::new(sandboxrelay::channels::discord::DiscordChannel::new(
        config.discord.clone(),
        config.pipeline.typing_pulse_interval_ms,
    ));
    let inbox: Arc<dyn Inbox> = discord.clone();
    let outbox: Arc<dyn Outbox> = discord.clone();
    let threads: Arc<dyn Threads> = discord.clone();
    let history: Arc<dyn History> = discord.clone();
    let router: Arc<dyn TurnRouter> = Arc::new(HeuristicTurnRouter::new(config.routing.clone()));

    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        sandbox.clone(),
        agent.clone(),
        config.sandbox.clone(),
    ));
    let thread_entity = Arc::new(ThreadEntity::new(
        provisioner,
        store.clone(),
        agent,
        sandbox,
        history,
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        thread_entity.clone(),
        config.sandbox.clone(),
        config.reconciler.clone(),
    ));
    let pipeline = Arc::new(TurnPipeline::new(
        inbox,
        outbox,
        threads,
        router,
        store,
        thread_entity,
        config.pipeline.clone(),
    ));

    let bot_token = config.discord.bot_token.clone();
    let gateway = tokio::spawn(async move {
        if let Err(e) = discord.connect(&bot_token).await {
            error!(error = %e, "discord gateway connection ended");
        }
    });
    let reconciler_task = tokio::spawn(async move { reconciler.run().await });
    let pipeline_task = tokio::spawn(async move { pipeline.run().await });

    tokio::select! {
        _ = gateway => info!("gateway task exited"),
        _ = reconciler_task => info!("reconciler task exited"),
        r = pipeline_task => info!(result = ?r, "pipeline task exited"),
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
    }
}

#[tokio::main]
async fn main() {
    // serenity 0.12's TLS stack needs a crypto provider installed before the
    // first connection; rustls no longer picks a default automatically.
    let _ = rustls::crypto::ring::default_provider().install_default();

    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(&cli);
    let store = open_store(&config);

    match cli.command {
        None => run_orchestrator(config, store).await,
        Some(Commands::Status) => run_status(store).await,
        Some(Commands::Sessions { action }) => run_sessions(store, action).await,
    }
}
