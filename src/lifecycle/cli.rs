//! Lifecycle CLI - on-demand passes and stats outside the schedule

use clap::Subcommand;
use serde::Serialize;
use tracing::info;

use super::models::LifecycleDomain;
use super::orchestrator::{Reconciler, RunOptions};
use crate::error::{Result, StoreError};

/// Lifecycle CLI commands
#[derive(Debug, Subcommand)]
pub enum LifecycleCommands {
    /// Run one reconciliation pass now
    #[command(subcommand)]
    Run(RunCommands),

    /// Show status counts and pending work
    #[command(subcommand)]
    Stats(StatsCommands),
}

#[derive(Debug, Subcommand)]
pub enum RunCommands {
    /// Reconcile contracts
    Contracts {
        /// Only this organization
        #[arg(short, long)]
        tenant: Option<String>,
        /// Scan and count without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Reconcile organization subscriptions
    Subscriptions {
        /// Scan and count without writing
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum StatsCommands {
    /// Contract stats
    Contracts {
        /// Only this organization
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Subscription stats
    Subscriptions {
        /// Only this organization
        #[arg(short, long)]
        tenant: Option<String>,
    },
}

/// Execute a lifecycle CLI command, returning pretty JSON
pub async fn execute_command(reconciler: &Reconciler, command: LifecycleCommands) -> Result<String> {
    match command {
        LifecycleCommands::Run(RunCommands::Contracts { tenant, dry_run }) => {
            info!(tenant = ?tenant, dry_run, "Manual contract pass requested");
            let summary = reconciler
                .run(LifecycleDomain::Contracts, RunOptions { tenant, dry_run })
                .await?;
            to_json(&summary)
        }

        LifecycleCommands::Run(RunCommands::Subscriptions { dry_run }) => {
            info!(dry_run, "Manual subscription pass requested");
            let summary = reconciler
                .run(
                    LifecycleDomain::Subscriptions,
                    RunOptions {
                        tenant: None,
                        dry_run,
                    },
                )
                .await?;
            to_json(&summary)
        }

        LifecycleCommands::Stats(StatsCommands::Contracts { tenant }) => {
            to_json(&reconciler.contract_stats(tenant.as_deref()).await?)
        }

        LifecycleCommands::Stats(StatsCommands::Subscriptions { tenant }) => {
            to_json(&reconciler.subscription_stats(tenant.as_deref()).await?)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value).map_err(StoreError::from)?)
}
