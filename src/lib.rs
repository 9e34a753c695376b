//! lifecycle-engine: time-driven status reconciliation for gym contracts and
//! organization subscriptions.
//!
//! - [`lifecycle`]: window evaluation, scanning, per-entity transactions,
//!   renewal cascade, stats and the [`Reconciler`](lifecycle::Reconciler)
//! - [`store`]: repository trait with SQLite and in-memory implementations
//! - [`schedule`]: cron triggers driving passes
//! - [`api`]: admin HTTP routes

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod schedule;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{LifecycleError, ProcessingError, StoreError};
pub use lifecycle::{ReconciliationSummary, Reconciler};
