//! Time window evaluation
//!
//! Pure predicates deciding whether an entity's dates put it in a transition
//! window at a given instant. The scanner builds its filters from the same
//! bounds, and the processor re-checks the predicate inside the transaction.

use chrono::{DateTime, Duration, Utc};

use super::models::*;

/// Window predicates evaluated at a fixed instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEvaluator {
    now: DateTime<Utc>,
    /// Length of the pre-expiration warning window
    expiring_soon: Duration,
    /// How long past `end_date` an entity stays in force before it counts as expired
    expiry_grace: Duration,
}

impl WindowEvaluator {
    pub fn new(now: DateTime<Utc>, expiring_soon: Duration, expiry_grace: Duration) -> Self {
        Self {
            now,
            expiring_soon,
            expiry_grace,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Inclusive `[now, now + window]` range for the warning window
    pub fn expiring_soon_bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.now, self.now + self.expiring_soon)
    }

    /// Entities ending at or before this instant are expired
    pub fn expired_cutoff(&self) -> DateTime<Utc> {
        self.now - self.expiry_grace
    }

    fn in_warning_window(&self, end_date: DateTime<Utc>) -> bool {
        let (from, to) = self.expiring_soon_bounds();
        end_date >= from && end_date <= to
    }

    // =========================================================================
    // CONTRACTS
    // =========================================================================

    pub fn contract_expiring_soon(&self, contract: &Contract) -> bool {
        !contract.is_deleted()
            && contract.status == ContractStatus::Active
            && contract
                .end_date
                .is_some_and(|end| self.in_warning_window(end))
    }

    pub fn contract_expired(&self, contract: &Contract) -> bool {
        !contract.is_deleted()
            && matches!(
                contract.status,
                ContractStatus::Active | ContractStatus::ExpiringSoon
            )
            && contract
                .end_date
                .is_some_and(|end| end <= self.expired_cutoff())
    }

    pub fn freeze_release_due(&self, contract: &Contract) -> bool {
        !contract.is_deleted()
            && contract.status == ContractStatus::Frozen
            && contract
                .freeze_end_date
                .is_some_and(|until| until <= self.now)
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Subscriptions have no expiring_soon status; the warning flag marks them instead.
    pub fn subscription_expiring_soon(&self, subscription: &SubscriptionOrganization) -> bool {
        !subscription.is_deleted()
            && subscription.status == SubscriptionStatus::Active
            && !subscription.metadata.warning_sent()
            && self.in_warning_window(subscription.end_date)
    }

    pub fn subscription_expired(&self, subscription: &SubscriptionOrganization) -> bool {
        !subscription.is_deleted()
            && subscription.status == SubscriptionStatus::Active
            && subscription.end_date <= self.expired_cutoff()
    }

    pub fn grace_period_over(&self, subscription: &SubscriptionOrganization) -> bool {
        !subscription.is_deleted()
            && subscription.status == SubscriptionStatus::Expired
            && subscription
                .metadata
                .grace_period_end
                .is_some_and(|end| end <= self.now)
    }
}
