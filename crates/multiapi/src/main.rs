//! Multi-API Daemon - one endpoint, whichever provider is active

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use multiapi::config::Config;
use multiapi::error::Result;
use multiapi::proxy::{AppState, ProxyServer};
use multiapi::registry::{JsonStore, ProviderRegistry, RegistryControl, TraceMirror};
use multiapi::trace::TraceRecorder;

/// Multi-API - a single OpenAI-compatible endpoint for many providers
#[derive(Parser)]
#[command(name = "multiapi")]
#[command(about = "Forward OpenAI-compatible calls to whichever provider is active")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default command)
    #[command(name = "serve")]
    Serve {
        /// Override the listen address from the config file
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None => serve(cli.config, None).await,
        Some(Command::Serve { listen }) => serve(cli.config, listen).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,multiapi=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = config_path {
        tracing::info!("Loading config from: {}", path.display());
        return Config::from_file(&path);
    }

    let default_paths = [
        dirs::home_dir().map(|h| h.join(".multiapi").join("config.toml")),
        dirs::config_dir().map(|c| c.join("multiapi").join("config.toml")),
        Some(PathBuf::from("config.toml")),
    ];

    for path in default_paths.iter().flatten() {
        if path.exists() {
            tracing::info!("Loading config from: {}", path.display());
            return Config::from_file(path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(Config::default())
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    tracing::info!("Starting Multi-API gateway");

    let mut config = load_config(config_path)?;
    if let Some(listen) = listen {
        config.proxy.listen_addr = listen;
    }
    tracing::debug!("Config loaded: {:?}", config);

    let db_path = config.storage.db_path();
    tracing::info!("Opening registry store at: {}", db_path.display());
    let store = Arc::new(
        JsonStore::open(db_path)
            .await?
            .with_trace_limit(config.debug.mirror_limit),
    );

    if !config.providers.is_empty() {
        let seeded = store.seed(&config.providers).await?;
        tracing::info!("Seeded {seeded} provider(s) from config");
    }
    if let Some(id) = &config.active_provider {
        store.activate(id).await?;
    }

    let mirror = config
        .debug
        .mirror_to_store
        .then(|| store.clone() as Arc<dyn TraceMirror>);
    let recorder = Arc::new(TraceRecorder::new(config.debug_logs_dir(), mirror));

    let state = Arc::new(AppState::new(
        &config.proxy,
        store.clone(),
        store.clone(),
        recorder,
    )?);

    if store.debug_mode().await {
        tracing::info!("Restoring debug mode from previous run");
        if let Err(e) = state.set_debug_mode(true).await {
            tracing::warn!("Could not restore debug mode: {e}");
            if let Err(e) = store.set_debug_mode(false).await {
                tracing::warn!("Failed to clear persisted debug mode: {e}");
            }
        }
    }

    match state.registry.get_active().await {
        Some(active) => tracing::info!("Active provider: {} ({})", active.name, active.id),
        None => tracing::warn!("No active provider; forwarding requests will be rejected"),
    }

    let server = ProxyServer::new(config.proxy.clone(), state);
    server.serve().await?;

    tracing::info!("Multi-API gateway stopped");
    Ok(())
}
