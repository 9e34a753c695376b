//! Lifecycle - time-driven reconciliation of contracts and subscriptions
//!
//! Statuses drift out of date as time passes: a contract nears its end, a
//! subscription's grace period runs out. A pass finds those rows and moves
//! them forward, one transaction per entity.
//!
//! # Pipeline
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           RECONCILER                              │
//! │                                                                    │
//! │  stats ─► expiring soon ─► expired ─► freeze / grace ─► stats     │
//! │                 │             │              │                     │
//! │            ┌────┴─────────────┴──────────────┴────┐               │
//! │            │  Scanner (keyset pages per window)   │               │
//! │            └────┬─────────────────────────────────┘               │
//! │                 ▼                                                  │
//! │            Processor (1 tx per entity) ──► Cascade (renewal)      │
//! │                 │                                                  │
//! │                 ▼                                                  │
//! │             Notifier                                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Transitions
//!
//! - **Contracts**: active → expiring_soon → expired (activating a paid
//!   renewal), frozen → active once the freeze ends
//! - **Subscriptions**: warning flag before expiry, active → expired (grace
//!   period opens), expired → inactive (access suspended)

pub mod models;
pub mod window;
pub mod scanner;
pub mod processor;
pub mod cascade;
pub mod stats;
pub mod notify;
pub mod orchestrator;
pub mod cli;

use std::time::Duration;

pub use models::*;
pub use notify::{LogNotifier, Notice, NoticeKind, Notifier, RecordingNotifier};
pub use orchestrator::{ReconciliationSummary, Reconciler, RunOptions};
pub use stats::{LifecycleStats, NeedsUpdate};
pub use window::WindowEvaluator;

/// Windows for one lifecycle domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainWindows {
    /// How far ahead of `end_date` the warning window opens
    pub expiring_soon: chrono::Duration,
    /// Contracts: delay between `end_date` and expiry.
    /// Subscriptions: length of the post-expiry grace period.
    pub grace_period: chrono::Duration,
}

impl DomainWindows {
    pub fn days(expiring_soon: i64, grace_period: i64) -> Self {
        Self {
            expiring_soon: chrono::Duration::days(expiring_soon),
            grace_period: chrono::Duration::days(grace_period),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Maximum rows per scan query
    pub batch_size: usize,
    /// Bound on one entity's transaction
    pub transaction_timeout: Duration,
    /// Scan and count only
    pub dry_run: bool,
    pub contracts: DomainWindows,
    pub subscriptions: DomainWindows,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            batch_size: scanner::DEFAULT_BATCH_SIZE,
            transaction_timeout: processor::DEFAULT_TRANSACTION_TIMEOUT,
            dry_run: false,
            contracts: DomainWindows::days(5, 0),
            subscriptions: DomainWindows::days(7, 7),
        }
    }
}
