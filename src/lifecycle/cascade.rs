//! Cascade resolution for expiring contracts
//!
//! Runs inside the parent's expiration transaction, so the renewal activation
//! and the parent's status change commit or roll back together. Subscriptions
//! have no cascade: grace period handling only touches the subscription row.

use chrono::{DateTime, Utc};
use tracing::info;

use super::models::*;
use crate::error::StoreError;
use crate::store::LifecycleTx;

/// Decide what happens to the most recent renewal of `parent` and apply it.
pub fn resolve_renewal(
    tx: &mut dyn LifecycleTx,
    parent: &Contract,
    now: DateTime<Utc>,
) -> Result<CascadeOutcome, StoreError> {
    let Some(mut renewal) = tx.latest_renewal(&parent.id)? else {
        return Ok(CascadeOutcome::NoRenewal);
    };

    if renewal.status != ContractStatus::Pending {
        info!(
            contract_id = %parent.id,
            renewal_id = %renewal.id,
            status = %renewal.status,
            "Renewal not pending, left untouched"
        );
        return Ok(CascadeOutcome::Ineligible {
            renewal_id: renewal.id,
            status: renewal.status,
        });
    }

    if !renewal.has_confirmed_payment() {
        info!(
            contract_id = %parent.id,
            renewal_id = %renewal.id,
            final_amount = ?renewal.final_amount,
            "Renewal awaiting payment, not activated"
        );
        return Ok(CascadeOutcome::AwaitingPayment {
            renewal_id: renewal.id,
        });
    }

    renewal.status = ContractStatus::Active;
    renewal.updated_at = now;
    tx.save_contract(&renewal)?;

    info!(
        contract_id = %parent.id,
        renewal_id = %renewal.id,
        "Renewal activated"
    );
    Ok(CascadeOutcome::Activated {
        renewal_id: renewal.id,
    })
}
