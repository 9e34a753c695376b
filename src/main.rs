//! lifecycle-engine daemon and operator CLI
//!
//! `serve` runs the cron scheduler and the admin API. The other subcommands
//! run a single pass or print stats and exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lifecycle_engine::api::create_router;
use lifecycle_engine::clock::{Clock, SystemClock};
use lifecycle_engine::config::Config;
use lifecycle_engine::lifecycle::{self, LifecycleDomain, LogNotifier, Reconciler};
use lifecycle_engine::schedule::{CronTrigger, Scheduler};
use lifecycle_engine::store::SqliteStore;

#[derive(Parser)]
#[command(name = "lifecycle-engine")]
#[command(about = "Time-driven lifecycle reconciliation for contracts and subscriptions")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "LIFECYCLE_CONFIG", default_value = "lifecycle-engine.toml")]
    config: PathBuf,

    /// SQLite database (overrides config file)
    #[arg(long, env = "LIFECYCLE_DB_PATH")]
    db: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and admin API
    Serve,

    /// Print the next fire time of each enabled domain
    Schedule,

    #[command(flatten)]
    Lifecycle(lifecycle::cli::LifecycleCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("lifecycle_engine=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = if cli.config.exists() {
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    let store = SqliteStore::open(&config.store.path)
        .with_context(|| format!("opening store at {}", config.store.path.display()))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(store),
        clock.clone(),
        Arc::new(LogNotifier),
        config.lifecycle(),
    ));

    match cli.command {
        Command::Lifecycle(command) => {
            let output = lifecycle::cli::execute_command(&reconciler, command).await?;
            println!("{}", output);
            Ok(())
        }
        Command::Schedule => {
            let scheduler = build_scheduler(&config, reconciler, clock)?;
            println!("{}", serde_json::to_string_pretty(&scheduler.upcoming())?);
            Ok(())
        }
        Command::Serve => serve(config, reconciler, clock).await,
    }
}

fn build_scheduler(
    config: &Config,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Scheduler> {
    let mut scheduler = Scheduler::new(reconciler, clock);
    if config.contracts.enabled {
        scheduler.add_job(LifecycleDomain::Contracts, CronTrigger::parse(&config.contracts.schedule)?);
    }
    if config.subscriptions.enabled {
        scheduler.add_job(
            LifecycleDomain::Subscriptions,
            CronTrigger::parse(&config.subscriptions.schedule)?,
        );
    }
    Ok(scheduler)
}

async fn serve(config: Config, reconciler: Arc<Reconciler>, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    info!("Starting lifecycle-engine");
    info!("Store: {}", config.store.path.display());

    let scheduler = Arc::new(build_scheduler(&config, reconciler.clone(), clock)?);
    if scheduler.jobs().is_empty() {
        warn!("No lifecycle domain is enabled, passes will only run on request");
    }
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    if config.api.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.api.http_port));
        info!("Admin API listening on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        axum::serve(listener, create_router(reconciler))
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        info!("Admin API is disabled");
        shutdown_signal().await;
    }

    scheduler.shutdown();
    scheduler_task.await?;
    info!("lifecycle-engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
