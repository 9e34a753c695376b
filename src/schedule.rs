//! Cron scheduler for lifecycle passes
//!
//! Each enabled domain gets one cron trigger. Jobs run inline on the
//! scheduler task, so two passes never overlap within one process.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{LifecycleError, Result};
use crate::lifecycle::{LifecycleDomain, Reconciler, RunOptions};

/// Floor on each sleep so a past fire time cannot spin the loop
const MIN_SLEEP: Duration = Duration::from_millis(100);

/// Parsed cron expression
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: cron::Schedule,
}

impl CronTrigger {
    /// Accepts classic 5-field expressions as well as the seconds-first
    /// 6 and 7 field forms.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", expression.trim()),
            6 | 7 => expression.trim().to_string(),
            n => {
                return Err(LifecycleError::Schedule(format!(
                    "'{}' has {} fields, expected 5, 6 or 7",
                    expression, n
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| LifecycleError::Schedule(format!("'{}': {}", expression, e)))?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// A domain bound to its trigger
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub domain: LifecycleDomain,
    pub trigger: CronTrigger,
}

/// Next fire time of one job, for display
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingRun {
    pub domain: LifecycleDomain,
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    jobs: Vec<ScheduledJob>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            reconciler,
            clock,
            jobs: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn add_job(&mut self, domain: LifecycleDomain, trigger: CronTrigger) {
        info!(domain = %domain, schedule = %trigger.expression(), "Lifecycle job scheduled");
        self.jobs.push(ScheduledJob { domain, trigger });
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn upcoming(&self) -> Vec<UpcomingRun> {
        let now = self.clock.now();
        self.jobs
            .iter()
            .map(|job| UpcomingRun {
                domain: job.domain,
                schedule: job.trigger.expression().to_string(),
                next_run: job.trigger.next_after(now),
            })
            .collect()
    }

    /// Stop the run loop after the current job, if any, finishes.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let start = self.clock.now();
        let mut next: Vec<Option<DateTime<Utc>>> =
            self.jobs.iter().map(|job| job.trigger.next_after(start)).collect();

        info!(jobs = self.jobs.len(), "Scheduler started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let now = self.clock.now();
            let wait = match next.iter().flatten().min() {
                Some(earliest) => (*earliest - now).to_std().unwrap_or(MIN_SLEEP).max(MIN_SLEEP),
                None => {
                    warn!("No upcoming fire times, waiting for shutdown");
                    if let Err(e) = shutdown_rx.wait_for(|stop| *stop).await {
                        debug!(error = %e, "Shutdown channel closed");
                    }
                    break;
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => continue,
                _ = tokio::time::sleep(wait) => {}
            }

            let now = self.clock.now();
            for (job, slot) in self.jobs.iter().zip(next.iter_mut()) {
                if slot.is_some_and(|at| at <= now) {
                    self.fire(job).await;
                    *slot = job.trigger.next_after(now);
                }
            }
        }

        info!("Scheduler stopped");
    }

    async fn fire(&self, job: &ScheduledJob) {
        info!(domain = %job.domain, "Scheduled lifecycle pass starting");
        match self.reconciler.run(job.domain, RunOptions::default()).await {
            Ok(summary) if summary.success => {
                info!(domain = %job.domain, run_id = %summary.run_id, transitioned = summary.transitioned(), "Scheduled pass succeeded");
            }
            Ok(summary) => {
                warn!(
                    domain = %job.domain,
                    run_id = %summary.run_id,
                    errors = summary.error_count(),
                    "Scheduled pass finished with errors"
                );
            }
            Err(e) => {
                error!(domain = %job.domain, error = %e, "Scheduled pass failed");
            }
        }
    }
}
