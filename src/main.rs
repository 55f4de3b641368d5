use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use taskfleet::agents::{AgentRegistry, RegistrationCodeIssuer, SweeperConfig, spawn_sweeper};
use taskfleet::artifacts::ArtifactStore;
use taskfleet::clock::{Clock, SystemClock};
use taskfleet::codec::GzipBase64;
use taskfleet::config::{Config, LogFormat};
use taskfleet::db::{Database, InMemoryStore, PgStore};
use taskfleet::gateway::{self, AdminAuth, DispatchGateway, GatewayState};
use taskfleet::ledger::{ExecutionLedger, RetentionQueue, RetentionSweeper};
use taskfleet::stats::DailyTaskStats;

#[derive(Parser, Debug)]
#[command(name = "taskfleet", version, about = "Task dispatch controller for remote agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway (default)
    Serve {
        /// Address to listen on
        #[arg(long, env = "DISPATCH_LISTEN_ADDR")]
        listen: Option<SocketAddr>,
    },

    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(config.log_format);

    match cli.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Migrate => migrate(&config).await,
        Command::Serve { listen } => serve(config, listen).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn migrate(config: &Config) -> anyhow::Result<()> {
    let db = config
        .database
        .as_ref()
        .context("DATABASE_URL must be set to run migrations")?;
    let store = PgStore::new(db).await.context("failed to connect to database")?;
    store.run_migrations().await?;
    tracing::info!("Migrations complete");
    Ok(())
}

async fn serve(config: Config, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn Database> = match &config.database {
        Some(db) => {
            let store = PgStore::new(db).await.context("failed to connect to database")?;
            store.run_migrations().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store; state is lost on exit");
            Arc::new(InMemoryStore::new())
        }
    };

    let registry = Arc::new(AgentRegistry::new(store.clone(), clock.clone()));
    let codes = Arc::new(RegistrationCodeIssuer::new(store.clone(), clock.clone()));
    let stats = Arc::new(DailyTaskStats::new(store.clone(), clock.clone()));

    let (retention, retention_worker) = RetentionQueue::spawn(
        Arc::new(RetentionSweeper::new(store.clone(), clock.clone())),
        config.retention_queue_capacity,
    );
    let ledger = Arc::new(ExecutionLedger::new(
        store.clone(),
        stats,
        Arc::new(GzipBase64),
        clock.clone(),
        retention,
    ));

    let artifacts = ArtifactStore::new(config.artifact_dirs.clone(), config.artifact_prefix.clone());
    let sweeper = spawn_sweeper(
        SweeperConfig::default().with_interval(config.sweep_interval),
        registry.clone(),
    );

    let state = GatewayState {
        gateway: Arc::new(DispatchGateway::new(
            registry,
            codes,
            ledger,
            store,
            artifacts,
        )),
        admin: AdminAuth::new(config.admin_token),
    };

    let addr = listen.unwrap_or(config.listen_addr);
    gateway::serve(state, addr, shutdown_signal())
        .await
        .context("gateway failed")?;

    sweeper.abort();
    // The gateway held the last queue handle; let pending cleanups finish.
    if let Err(e) = retention_worker.await {
        tracing::warn!("Retention worker ended abnormally: {}", e);
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
