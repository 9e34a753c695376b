//! Processor - one atomic transaction per candidate
//!
//! The scanner's candidate list can be stale by the time a row is processed
//! (another run, a manual freeze). Every transition therefore re-reads the row
//! inside its transaction and re-checks the window predicate before writing;
//! a row that no longer qualifies is reported as `AlreadyApplied`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cascade;
use super::models::*;
use super::notify::{Notice, Notifier};
use super::window::WindowEvaluator;
use crate::error::ProcessingError;
use crate::store::{LifecycleStore, LifecycleTx, TxWork};

/// Default bound on a single entity's transaction
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Processor {
    store: Arc<dyn LifecycleStore>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    /// Length of the grace period stamped on expiring subscriptions
    subscription_grace: chrono::Duration,
}

impl Processor {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
        subscription_grace: chrono::Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            timeout,
            subscription_grace,
        }
    }

    /// Apply `kind` to one entity. Errors stay with the caller; they never
    /// leave a partial write behind.
    pub async fn process(
        &self,
        domain: LifecycleDomain,
        kind: TransitionKind,
        entity_id: &str,
        eval: &WindowEvaluator,
    ) -> Result<TransitionOutcome, ProcessingError> {
        let work = self.work_for(domain, kind, entity_id.to_string(), *eval)?;

        // A transaction cut off here may still commit on the store side; the
        // next pass then finds the row already moved.
        let outcome = match tokio::time::timeout(self.timeout, self.store.run_in_transaction(work)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProcessingError::Timeout {
                    entity_id: entity_id.to_string(),
                    after: self.timeout,
                })
            }
        };

        match &outcome {
            TransitionOutcome::Applied { cascade, .. } => {
                info!(
                    domain = %domain,
                    stage = %kind,
                    entity_id = %entity_id,
                    cascade = ?cascade,
                    "Transition applied"
                );
            }
            TransitionOutcome::AlreadyApplied => {
                debug!(domain = %domain, stage = %kind, entity_id = %entity_id, "Entity no longer a candidate");
            }
        }

        for notice in Notice::for_outcome(domain, entity_id, &outcome, eval.now()) {
            if let Err(e) = self.notifier.notify(notice).await {
                warn!(entity_id = %entity_id, error = %e, "Notification request failed");
            }
        }

        Ok(outcome)
    }

    fn work_for(
        &self,
        domain: LifecycleDomain,
        kind: TransitionKind,
        id: EntityId,
        eval: WindowEvaluator,
    ) -> Result<TxWork, ProcessingError> {
        let grace = self.subscription_grace;
        let work: TxWork = match (domain, kind) {
            (LifecycleDomain::Contracts, TransitionKind::ExpiringSoon) => {
                Box::new(move |tx: &mut dyn LifecycleTx| mark_contract_expiring_soon(tx, &id, &eval))
            }
            (LifecycleDomain::Contracts, TransitionKind::Expired) => {
                Box::new(move |tx: &mut dyn LifecycleTx| expire_contract(tx, &id, &eval))
            }
            (LifecycleDomain::Contracts, TransitionKind::FreezeRelease) => {
                Box::new(move |tx: &mut dyn LifecycleTx| release_freeze(tx, &id, &eval))
            }
            (LifecycleDomain::Subscriptions, TransitionKind::ExpiringSoon) => {
                Box::new(move |tx: &mut dyn LifecycleTx| warn_subscription(tx, &id, &eval))
            }
            (LifecycleDomain::Subscriptions, TransitionKind::Expired) => {
                Box::new(move |tx: &mut dyn LifecycleTx| expire_subscription(tx, &id, &eval, grace))
            }
            (LifecycleDomain::Subscriptions, TransitionKind::GracePeriodOver) => {
                Box::new(move |tx: &mut dyn LifecycleTx| suspend_subscription(tx, &id, &eval))
            }
            (domain, kind) => {
                return Err(ProcessingError::InvariantViolation {
                    entity_id: id,
                    reason: format!("{} has no {} transition", domain, kind),
                })
            }
        };
        Ok(work)
    }
}

// =============================================================================
// CONTRACT TRANSITIONS
// =============================================================================

fn mark_contract_expiring_soon(
    tx: &mut dyn LifecycleTx,
    id: &str,
    eval: &WindowEvaluator,
) -> Result<TransitionOutcome, ProcessingError> {
    let Some(mut contract) = tx.contract(id)? else {
        return Ok(TransitionOutcome::AlreadyApplied);
    };
    if !eval.contract_expiring_soon(&contract) {
        return Ok(TransitionOutcome::AlreadyApplied);
    }

    contract.status = ContractStatus::ExpiringSoon;
    contract.updated_at = eval.now();
    tx.save_contract(&contract)?;
    Ok(TransitionOutcome::applied(TransitionKind::ExpiringSoon))
}

fn expire_contract(
    tx: &mut dyn LifecycleTx,
    id: &str,
    eval: &WindowEvaluator,
) -> Result<TransitionOutcome, ProcessingError> {
    let Some(mut contract) = tx.contract(id)? else {
        return Ok(TransitionOutcome::AlreadyApplied);
    };
    if !eval.contract_expired(&contract) {
        return Ok(TransitionOutcome::AlreadyApplied);
    }

    contract.status = ContractStatus::Expired;
    contract.updated_at = eval.now();
    tx.save_contract(&contract)?;

    let cascade = cascade::resolve_renewal(tx, &contract, eval.now())?;
    Ok(TransitionOutcome::Applied {
        kind: TransitionKind::Expired,
        cascade,
    })
}

fn release_freeze(
    tx: &mut dyn LifecycleTx,
    id: &str,
    eval: &WindowEvaluator,
) -> Result<TransitionOutcome, ProcessingError> {
    let Some(mut contract) = tx.contract(id)? else {
        return Ok(TransitionOutcome::AlreadyApplied);
    };
    if !eval.freeze_release_due(&contract) {
        return Ok(TransitionOutcome::AlreadyApplied);
    }

    contract.status = ContractStatus::Active;
    contract.freeze_start_date = None;
    contract.freeze_end_date = None;
    contract.updated_at = eval.now();
    tx.save_contract(&contract)?;
    Ok(TransitionOutcome::applied(TransitionKind::FreezeRelease))
}

// =============================================================================
// SUBSCRIPTION TRANSITIONS
// =============================================================================

fn warn_subscription(
    tx: &mut dyn LifecycleTx,
    id: &str,
    eval: &WindowEvaluator,
) -> Result<TransitionOutcome, ProcessingError> {
    let Some(mut subscription) = tx.subscription(id)? else {
        return Ok(TransitionOutcome::AlreadyApplied);
    };
    if !eval.subscription_expiring_soon(&subscription) {
        return Ok(TransitionOutcome::AlreadyApplied);
    }

    subscription.metadata.expiration_warning = Some(true);
    subscription.metadata.warning_date = Some(eval.now());
    subscription.updated_at = eval.now();
    tx.save_subscription(&subscription)?;
    Ok(TransitionOutcome::applied(TransitionKind::ExpiringSoon))
}

fn expire_subscription(
    tx: &mut dyn LifecycleTx,
    id: &str,
    eval: &WindowEvaluator,
    grace: chrono::Duration,
) -> Result<TransitionOutcome, ProcessingError> {
    let Some(mut subscription) = tx.subscription(id)? else {
        return Ok(TransitionOutcome::AlreadyApplied);
    };
    if !eval.subscription_expired(&subscription) {
        return Ok(TransitionOutcome::AlreadyApplied);
    }
    if grace < chrono::Duration::zero() {
        return Err(ProcessingError::InvariantViolation {
            entity_id: id.to_string(),
            reason: "grace period length is negative".to_string(),
        });
    }

    let now = eval.now();
    subscription.status = SubscriptionStatus::Expired;
    subscription.metadata.grace_period_start = Some(now);
    subscription.metadata.grace_period_end = Some(now + grace);
    subscription.metadata.expired_at = Some(now);
    subscription.updated_at = now;
    tx.save_subscription(&subscription)?;
    Ok(TransitionOutcome::applied(TransitionKind::Expired))
}

fn suspend_subscription(
    tx: &mut dyn LifecycleTx,
    id: &str,
    eval: &WindowEvaluator,
) -> Result<TransitionOutcome, ProcessingError> {
    let Some(mut subscription) = tx.subscription(id)? else {
        return Ok(TransitionOutcome::AlreadyApplied);
    };
    if !eval.grace_period_over(&subscription) {
        return Ok(TransitionOutcome::AlreadyApplied);
    }
    let metadata = &subscription.metadata;
    if let (Some(start), Some(end)) = (metadata.grace_period_start, metadata.grace_period_end) {
        if end < start {
            return Err(ProcessingError::InvariantViolation {
                entity_id: id.to_string(),
                reason: format!("grace period ends ({}) before it starts ({})", end, start),
            });
        }
    }

    subscription.status = SubscriptionStatus::Inactive;
    subscription.is_active = false;
    subscription.metadata.grace_period_ended = Some(true);
    subscription.metadata.access_suspended = Some(true);
    subscription.updated_at = eval.now();
    tx.save_subscription(&subscription)?;
    Ok(TransitionOutcome::applied(TransitionKind::GracePeriodOver))
}
