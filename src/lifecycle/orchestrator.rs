//! Reconciler - runs one pass over a lifecycle domain
//!
//! A pass is a fixed sequence: stats before, expiring soon, expired (with the
//! renewal cascade), freeze release or grace period end, stats after. Stages
//! run one after another so each sees what the previous one committed. A
//! failing entity or a failing scan is recorded in the summary and the pass
//! moves on; only a failed stats snapshot aborts it.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::models::*;
use super::notify::Notifier;
use super::processor::Processor;
use super::scanner::Scanner;
use super::stats::{LifecycleStats, StatsReporter};
use super::window::WindowEvaluator;
use super::LifecycleConfig;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::LifecycleStore;

//=============================================================================
// SUMMARY
//=============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringSoonReport {
    pub processed: bool,
    pub count: u64,
    pub errors: Vec<EntityError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiredReport {
    pub processed: bool,
    pub expired_count: u64,
    pub cascade_activated_count: u64,
    pub errors: Vec<EntityError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    pub processed: bool,
    pub released_count: u64,
    /// Held rows whose release is not due yet
    pub still_pending_count: u64,
    pub errors: Vec<EntityError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    /// Every stage ran and no entity failed
    pub success: bool,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub domain: LifecycleDomain,
    pub tenant: Option<String>,
    pub dry_run: bool,
    pub expiring_soon: ExpiringSoonReport,
    pub expired: ExpiredReport,
    pub frozen_or_grace: ReleaseReport,
    pub initial_stats: LifecycleStats,
    pub final_stats: LifecycleStats,
    pub duration_ms: u64,
}

impl ReconciliationSummary {
    pub fn error_count(&self) -> usize {
        self.expiring_soon.errors.len() + self.expired.errors.len() + self.frozen_or_grace.errors.len()
    }

    /// Entities moved by this pass
    pub fn transitioned(&self) -> u64 {
        self.expiring_soon.count + self.expired.expired_count + self.frozen_or_grace.released_count
    }
}

/// Per-pass overrides
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub tenant: Option<String>,
    /// Forces a dry run even when the engine is configured to write
    pub dry_run: bool,
}

#[derive(Debug, Default)]
struct StageTally {
    scanned: u64,
    applied: u64,
    cascade_activated: u64,
    errors: Vec<EntityError>,
    scan_error: Option<String>,
}

//=============================================================================
// RECONCILER
//=============================================================================

pub struct Reconciler {
    config: LifecycleConfig,
    clock: Arc<dyn Clock>,
    scanner: Scanner,
    processor: Processor,
    stats: StatsReporter,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            scanner: Scanner::new(store.clone(), config.batch_size),
            processor: Processor::new(
                store.clone(),
                notifier,
                config.transaction_timeout,
                config.subscriptions.grace_period,
            ),
            stats: StatsReporter::new(store),
            clock,
            config,
        }
    }

    /// One pass over contracts, optionally scoped to one organization.
    pub async fn run_contract_lifecycle(&self, tenant: Option<&str>) -> Result<ReconciliationSummary> {
        self.run(
            LifecycleDomain::Contracts,
            RunOptions {
                tenant: tenant.map(str::to_string),
                dry_run: false,
            },
        )
        .await
    }

    /// One pass over every organization's subscription.
    pub async fn run_subscription_lifecycle(&self) -> Result<ReconciliationSummary> {
        self.run(LifecycleDomain::Subscriptions, RunOptions::default()).await
    }

    pub async fn run(&self, domain: LifecycleDomain, options: RunOptions) -> Result<ReconciliationSummary> {
        let started = Instant::now();
        let now = self.clock.now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let tenant = options.tenant.as_deref();
        let dry_run = self.config.dry_run || options.dry_run;
        let eval = self.evaluator(domain, now);

        info!(%run_id, domain = %domain, tenant = ?tenant, dry_run, "Starting lifecycle pass");

        let initial_stats = self.stats.snapshot(domain, &self.scanner, &eval, tenant).await?;

        let expiring = self
            .run_stage(domain, TransitionKind::ExpiringSoon, &eval, tenant, dry_run)
            .await;
        let expired = self
            .run_stage(domain, TransitionKind::Expired, &eval, tenant, dry_run)
            .await;
        let release_kind = match domain {
            LifecycleDomain::Contracts => TransitionKind::FreezeRelease,
            LifecycleDomain::Subscriptions => TransitionKind::GracePeriodOver,
        };
        let mut released = self.run_stage(domain, release_kind, &eval, tenant, dry_run).await;

        let mut still_pending = 0;
        if released.scan_error.is_none() {
            match self.scanner.still_pending(domain, &eval, tenant).await {
                Ok(count) => still_pending = count,
                Err(e) => {
                    error!(domain = %domain, stage = %release_kind, error = %e, "Pending count failed");
                    released.scan_error = Some(e.to_string());
                }
            }
        }

        let final_stats = self.stats.snapshot(domain, &self.scanner, &eval, tenant).await?;

        let expiring_soon = ExpiringSoonReport {
            processed: expiring.scan_error.is_none(),
            count: expiring.applied,
            errors: expiring.errors,
            error: expiring.scan_error,
        };
        let expired = ExpiredReport {
            processed: expired.scan_error.is_none(),
            expired_count: expired.applied,
            cascade_activated_count: expired.cascade_activated,
            errors: expired.errors,
            error: expired.scan_error,
        };
        let frozen_or_grace = ReleaseReport {
            processed: released.scan_error.is_none(),
            released_count: released.applied,
            still_pending_count: still_pending,
            errors: released.errors,
            error: released.scan_error,
        };

        let success = expiring_soon.processed
            && expired.processed
            && frozen_or_grace.processed
            && expiring_soon.errors.is_empty()
            && expired.errors.is_empty()
            && frozen_or_grace.errors.is_empty();

        let summary = ReconciliationSummary {
            success,
            run_id,
            timestamp: now,
            domain,
            tenant: options.tenant,
            dry_run,
            expiring_soon,
            expired,
            frozen_or_grace,
            initial_stats,
            final_stats,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            run_id = %summary.run_id,
            domain = %domain,
            success = summary.success,
            expiring_soon = summary.expiring_soon.count,
            expired = summary.expired.expired_count,
            renewals_activated = summary.expired.cascade_activated_count,
            released = summary.frozen_or_grace.released_count,
            still_pending = summary.frozen_or_grace.still_pending_count,
            errors = summary.error_count(),
            duration_ms = summary.duration_ms,
            "Lifecycle pass complete"
        );

        Ok(summary)
    }

    /// Current stats for a domain, without running a pass.
    pub async fn stats(&self, domain: LifecycleDomain, tenant: Option<&str>) -> Result<LifecycleStats> {
        let eval = self.evaluator(domain, self.clock.now());
        Ok(self.stats.snapshot(domain, &self.scanner, &eval, tenant).await?)
    }

    pub async fn contract_stats(&self, tenant: Option<&str>) -> Result<LifecycleStats> {
        self.stats(LifecycleDomain::Contracts, tenant).await
    }

    pub async fn subscription_stats(&self, tenant: Option<&str>) -> Result<LifecycleStats> {
        self.stats(LifecycleDomain::Subscriptions, tenant).await
    }

    fn evaluator(&self, domain: LifecycleDomain, now: DateTime<Utc>) -> WindowEvaluator {
        match domain {
            LifecycleDomain::Contracts => WindowEvaluator::new(
                now,
                self.config.contracts.expiring_soon,
                self.config.contracts.grace_period,
            ),
            // The subscription grace period starts at expiry; it does not delay it.
            LifecycleDomain::Subscriptions => WindowEvaluator::new(
                now,
                self.config.subscriptions.expiring_soon,
                chrono::Duration::zero(),
            ),
        }
    }

    /// Scan and process every candidate of one stage.
    async fn run_stage(
        &self,
        domain: LifecycleDomain,
        kind: TransitionKind,
        eval: &WindowEvaluator,
        tenant: Option<&str>,
        dry_run: bool,
    ) -> StageTally {
        let mut tally = StageTally::default();
        let mut cursor: Option<EntityId> = None;

        loop {
            let page = match self.scanner.page(domain, kind, eval, tenant, cursor.clone()).await {
                Ok(page) => page,
                Err(e) => {
                    error!(domain = %domain, stage = %kind, error = %e, "Stage scan failed");
                    tally.scan_error = Some(e.to_string());
                    break;
                }
            };
            let page_len = page.len();

            for entity_id in page {
                tally.scanned += 1;

                if dry_run {
                    info!(domain = %domain, stage = %kind, entity_id = %entity_id, "Dry run: would transition");
                    tally.applied += 1;
                } else {
                    match self.processor.process(domain, kind, &entity_id, eval).await {
                        Ok(outcome) => {
                            if outcome.is_applied() {
                                tally.applied += 1;
                            }
                            if outcome.renewal_activated() {
                                tally.cascade_activated += 1;
                            }
                        }
                        Err(e) => {
                            warn!(domain = %domain, stage = %kind, entity_id = %entity_id, error = %e, "Entity transition failed");
                            tally.errors.push(EntityError {
                                entity_id: entity_id.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }

                cursor = Some(entity_id);
            }

            if page_len < self.scanner.batch_size() {
                break;
            }
        }

        info!(
            domain = %domain,
            stage = %kind,
            scanned = tally.scanned,
            applied = tally.applied,
            errors = tally.errors.len(),
            "Stage complete"
        );
        tally
    }
}
