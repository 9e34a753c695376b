//! Lifecycle store - the repository the engine reconciles against
//!
//! The engine needs three capabilities from persistence:
//! - bounded candidate queries (`find_*`) and counts (`count_*`)
//! - one atomic transaction per entity (`run_in_transaction`)
//!
//! Two implementations ship with the crate:
//! - [`SqliteStore`]: rusqlite-backed, used by the daemon and CLI
//! - [`MemoryStore`]: copy-on-write in-memory store with fault injection, used by tests

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::{ProcessingError, StoreError};
use crate::lifecycle::models::*;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Body of a single-entity transaction. Any `Err` rolls back every write it made.
pub type TxWork =
    Box<dyn FnOnce(&mut dyn LifecycleTx) -> Result<TransitionOutcome, ProcessingError> + Send>;

/// Reads and writes available inside a transaction
pub trait LifecycleTx {
    fn contract(&mut self, id: &str) -> Result<Option<Contract>, StoreError>;

    /// Most recent non-deleted renewal whose `renewal_of` is `parent_id`
    fn latest_renewal(&mut self, parent_id: &str) -> Result<Option<Contract>, StoreError>;

    fn save_contract(&mut self, contract: &Contract) -> Result<(), StoreError>;

    fn subscription(&mut self, id: &str) -> Result<Option<SubscriptionOrganization>, StoreError>;

    fn save_subscription(&mut self, subscription: &SubscriptionOrganization) -> Result<(), StoreError>;
}

/// Repository interface consumed by the engine
#[async_trait::async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Candidate rows matching `filter`, ordered by id
    async fn find_contracts(&self, filter: &ContractFilter) -> Result<Vec<ContractCandidate>, StoreError>;

    async fn count_contracts(&self, filter: &ContractFilter) -> Result<u64, StoreError>;

    /// Candidate rows matching `filter`, ordered by id
    async fn find_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<SubscriptionCandidate>, StoreError>;

    async fn count_subscriptions(&self, filter: &SubscriptionFilter) -> Result<u64, StoreError>;

    /// Run `work` atomically: commit on `Ok`, roll back on `Err`.
    async fn run_in_transaction(&self, work: TxWork) -> Result<TransitionOutcome, ProcessingError>;
}

//=============================================================================
// FILTERS
//=============================================================================

/// Contract query. Every set field narrows the result; ranges are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractFilter {
    /// Empty means any status
    pub statuses: Vec<ContractStatus>,
    pub end_date_from: Option<DateTime<Utc>>,
    pub end_date_to: Option<DateTime<Utc>>,
    /// `freeze_end_date <= x`; rows without a freeze end never match
    pub freeze_end_to: Option<DateTime<Utc>>,
    /// Tenant scope
    pub organization_id: Option<String>,
    pub include_deleted: bool,
    /// Keyset cursor: only ids strictly greater
    pub after_id: Option<EntityId>,
    pub limit: Option<usize>,
}

impl ContractFilter {
    pub fn with_statuses(statuses: &[ContractStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn scoped(mut self, organization_id: Option<&str>) -> Self {
        self.organization_id = organization_id.map(str::to_string);
        self
    }

    pub fn page(mut self, after_id: Option<EntityId>, limit: usize) -> Self {
        self.after_id = after_id;
        self.limit = Some(limit);
        self
    }

    /// Evaluate the filter (except `limit`) against a full row.
    pub fn matches(&self, contract: &Contract) -> bool {
        if !self.include_deleted && contract.is_deleted() {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&contract.status) {
            return false;
        }
        if let Some(org) = &self.organization_id {
            if &contract.organization_id != org {
                return false;
            }
        }
        if let Some(after) = &self.after_id {
            if contract.id.as_str() <= after.as_str() {
                return false;
            }
        }
        if self.end_date_from.is_some() || self.end_date_to.is_some() {
            let Some(end) = contract.end_date else {
                return false;
            };
            if self.end_date_from.is_some_and(|from| end < from) {
                return false;
            }
            if self.end_date_to.is_some_and(|to| end > to) {
                return false;
            }
        }
        if let Some(to) = self.freeze_end_to {
            if !contract.freeze_end_date.is_some_and(|until| until <= to) {
                return false;
            }
        }
        true
    }
}

/// Subscription query. Every set field narrows the result; ranges are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFilter {
    /// Empty means any status
    pub statuses: Vec<SubscriptionStatus>,
    pub end_date_from: Option<DateTime<Utc>>,
    pub end_date_to: Option<DateTime<Utc>>,
    /// `metadata.gracePeriodEnd <= x`; rows without one never match
    pub grace_period_end_to: Option<DateTime<Utc>>,
    /// `Some(false)` excludes rows whose `metadata.expirationWarning` is true
    pub warning_sent: Option<bool>,
    pub organization_id: Option<String>,
    pub include_deleted: bool,
    pub after_id: Option<EntityId>,
    pub limit: Option<usize>,
}

impl SubscriptionFilter {
    pub fn with_statuses(statuses: &[SubscriptionStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn scoped(mut self, organization_id: Option<&str>) -> Self {
        self.organization_id = organization_id.map(str::to_string);
        self
    }

    pub fn page(mut self, after_id: Option<EntityId>, limit: usize) -> Self {
        self.after_id = after_id;
        self.limit = Some(limit);
        self
    }

    /// Evaluate the filter (except `limit`) against a full row.
    pub fn matches(&self, subscription: &SubscriptionOrganization) -> bool {
        if !self.include_deleted && subscription.is_deleted() {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&subscription.status) {
            return false;
        }
        if let Some(org) = &self.organization_id {
            if &subscription.organization_id != org {
                return false;
            }
        }
        if let Some(after) = &self.after_id {
            if subscription.id.as_str() <= after.as_str() {
                return false;
            }
        }
        if self.end_date_from.is_some_and(|from| subscription.end_date < from) {
            return false;
        }
        if self.end_date_to.is_some_and(|to| subscription.end_date > to) {
            return false;
        }
        if let Some(to) = self.grace_period_end_to {
            if !subscription
                .metadata
                .grace_period_end
                .is_some_and(|end| end <= to)
            {
                return false;
            }
        }
        if let Some(sent) = self.warning_sent {
            if subscription.metadata.warning_sent() != sent {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_contract_filter_ranges_are_inclusive() {
        let contract = Contract::new("c-1", "org-1", t0(), t0() + Duration::days(30));
        let mut filter = ContractFilter::with_statuses(&[ContractStatus::Active]);
        filter.end_date_from = Some(t0() + Duration::days(30));
        filter.end_date_to = Some(t0() + Duration::days(30));

        assert!(filter.matches(&contract));

        filter.end_date_to = Some(t0() + Duration::days(29));
        assert!(!filter.matches(&contract));
    }

    #[test]
    fn test_contract_filter_scope_and_cursor() {
        let contract = Contract::new("c-2", "org-1", t0(), t0() + Duration::days(30));

        assert!(ContractFilter::default().scoped(Some("org-1")).matches(&contract));
        assert!(!ContractFilter::default().scoped(Some("org-2")).matches(&contract));
        assert!(ContractFilter::default()
            .page(Some("c-1".to_string()), 10)
            .matches(&contract));
        assert!(!ContractFilter::default()
            .page(Some("c-2".to_string()), 10)
            .matches(&contract));
    }

    #[test]
    fn test_contract_filter_excludes_deleted_by_default() {
        let mut contract = Contract::new("c-1", "org-1", t0(), t0() + Duration::days(30));
        contract.deleted_at = Some(t0());

        assert!(!ContractFilter::default().matches(&contract));
        assert!(ContractFilter {
            include_deleted: true,
            ..Default::default()
        }
        .matches(&contract));
    }

    #[test]
    fn test_subscription_filter_warning_flag() {
        let mut subscription = SubscriptionOrganization::new("s-1", "org-1", t0(), t0() + Duration::days(3));
        let filter = SubscriptionFilter {
            warning_sent: Some(false),
            ..Default::default()
        };

        assert!(filter.matches(&subscription));
        subscription.metadata.expiration_warning = Some(true);
        assert!(!filter.matches(&subscription));
    }
}
