//! Scanner - bounded candidate queries per transition kind
//!
//! Each transition kind maps to one store filter that mirrors the matching
//! [`WindowEvaluator`] predicate, so the candidate set is exactly what the
//! predicate would select. Pages are keyed by id and capped at `batch_size`.

use std::sync::Arc;

use tracing::trace;

use super::models::*;
use super::window::WindowEvaluator;
use crate::error::StoreError;
use crate::store::{ContractFilter, LifecycleStore, SubscriptionFilter};

/// Default rows per scan query
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub struct Scanner {
    store: Arc<dyn LifecycleStore>,
    batch_size: usize,
}

impl Scanner {
    pub fn new(store: Arc<dyn LifecycleStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Contract filter for `kind`, or `None` when the kind has no contract form.
    pub fn contract_filter(
        kind: TransitionKind,
        eval: &WindowEvaluator,
        tenant: Option<&str>,
    ) -> Option<ContractFilter> {
        let filter = match kind {
            TransitionKind::ExpiringSoon => {
                let (from, to) = eval.expiring_soon_bounds();
                ContractFilter {
                    end_date_from: Some(from),
                    end_date_to: Some(to),
                    ..ContractFilter::with_statuses(&[ContractStatus::Active])
                }
            }
            TransitionKind::Expired => ContractFilter {
                end_date_to: Some(eval.expired_cutoff()),
                ..ContractFilter::with_statuses(&[ContractStatus::Active, ContractStatus::ExpiringSoon])
            },
            TransitionKind::FreezeRelease => ContractFilter {
                freeze_end_to: Some(eval.now()),
                ..ContractFilter::with_statuses(&[ContractStatus::Frozen])
            },
            TransitionKind::GracePeriodOver => return None,
        };
        Some(filter.scoped(tenant))
    }

    /// Subscription filter for `kind`, or `None` when the kind has no subscription form.
    pub fn subscription_filter(
        kind: TransitionKind,
        eval: &WindowEvaluator,
        tenant: Option<&str>,
    ) -> Option<SubscriptionFilter> {
        let filter = match kind {
            TransitionKind::ExpiringSoon => {
                let (from, to) = eval.expiring_soon_bounds();
                SubscriptionFilter {
                    end_date_from: Some(from),
                    end_date_to: Some(to),
                    warning_sent: Some(false),
                    ..SubscriptionFilter::with_statuses(&[SubscriptionStatus::Active])
                }
            }
            TransitionKind::Expired => SubscriptionFilter {
                end_date_to: Some(eval.expired_cutoff()),
                ..SubscriptionFilter::with_statuses(&[SubscriptionStatus::Active])
            },
            TransitionKind::GracePeriodOver => SubscriptionFilter {
                grace_period_end_to: Some(eval.now()),
                ..SubscriptionFilter::with_statuses(&[SubscriptionStatus::Expired])
            },
            TransitionKind::FreezeRelease => return None,
        };
        Some(filter.scoped(tenant))
    }

    /// Next page of candidate ids after `after`.
    pub async fn page(
        &self,
        domain: LifecycleDomain,
        kind: TransitionKind,
        eval: &WindowEvaluator,
        tenant: Option<&str>,
        after: Option<EntityId>,
    ) -> Result<Vec<EntityId>, StoreError> {
        let ids: Vec<EntityId> = match domain {
            LifecycleDomain::Contracts => {
                let Some(filter) = Self::contract_filter(kind, eval, tenant) else {
                    return Ok(Vec::new());
                };
                let rows = self
                    .store
                    .find_contracts(&filter.page(after, self.batch_size))
                    .await?;
                for row in &rows {
                    trace!(entity_id = %row.id, status = %row.status, end_date = ?row.end_date, "Contract candidate");
                }
                rows.into_iter().map(|row| row.id).collect()
            }
            LifecycleDomain::Subscriptions => {
                let Some(filter) = Self::subscription_filter(kind, eval, tenant) else {
                    return Ok(Vec::new());
                };
                let rows = self
                    .store
                    .find_subscriptions(&filter.page(after, self.batch_size))
                    .await?;
                for row in &rows {
                    trace!(entity_id = %row.id, status = %row.status, end_date = %row.end_date, "Subscription candidate");
                }
                rows.into_iter().map(|row| row.id).collect()
            }
        };
        Ok(ids)
    }

    /// Number of rows a scan for `kind` would visit right now.
    pub async fn count(
        &self,
        domain: LifecycleDomain,
        kind: TransitionKind,
        eval: &WindowEvaluator,
        tenant: Option<&str>,
    ) -> Result<u64, StoreError> {
        match domain {
            LifecycleDomain::Contracts => match Self::contract_filter(kind, eval, tenant) {
                Some(filter) => self.store.count_contracts(&filter).await,
                None => Ok(0),
            },
            LifecycleDomain::Subscriptions => match Self::subscription_filter(kind, eval, tenant) {
                Some(filter) => self.store.count_subscriptions(&filter).await,
                None => Ok(0),
            },
        }
    }

    /// Frozen contracts (or expired subscriptions) whose release is not yet due.
    pub async fn still_pending(
        &self,
        domain: LifecycleDomain,
        eval: &WindowEvaluator,
        tenant: Option<&str>,
    ) -> Result<u64, StoreError> {
        let (held, kind) = match domain {
            LifecycleDomain::Contracts => (
                self.store
                    .count_contracts(&ContractFilter::with_statuses(&[ContractStatus::Frozen]).scoped(tenant))
                    .await?,
                TransitionKind::FreezeRelease,
            ),
            LifecycleDomain::Subscriptions => (
                self.store
                    .count_subscriptions(
                        &SubscriptionFilter::with_statuses(&[SubscriptionStatus::Expired]).scoped(tenant),
                    )
                    .await?,
                TransitionKind::GracePeriodOver,
            ),
        };
        let due = self.count(domain, kind, eval, tenant).await?;
        Ok(held.saturating_sub(due))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap()
    }

    fn eval() -> WindowEvaluator {
        WindowEvaluator::new(now(), Duration::days(5), Duration::zero())
    }

    #[tokio::test]
    async fn test_page_is_bounded_and_resumable() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store
                .insert_contract(Contract::new(
                    format!("c-{}", i),
                    "org-1",
                    now() - Duration::days(40),
                    now() - Duration::days(1),
                ))
                .await;
        }
        let scanner = Scanner::new(store, 2);

        let first = scanner
            .page(LifecycleDomain::Contracts, TransitionKind::Expired, &eval(), None, None)
            .await
            .unwrap();
        assert_eq!(first, vec!["c-0", "c-1"]);

        let second = scanner
            .page(
                LifecycleDomain::Contracts,
                TransitionKind::Expired,
                &eval(),
                None,
                first.last().cloned(),
            )
            .await
            .unwrap();
        assert_eq!(second, vec!["c-2", "c-3"]);
    }

    #[tokio::test]
    async fn test_tenant_scope_narrows_candidates() {
        let store = Arc::new(MemoryStore::new());
        let end = now() + Duration::days(2);
        store
            .insert_contract(Contract::new("c-1", "org-1", now() - Duration::days(28), end))
            .await;
        store
            .insert_contract(Contract::new("c-2", "org-2", now() - Duration::days(28), end))
            .await;
        let scanner = Scanner::new(store, DEFAULT_BATCH_SIZE);

        let scoped = scanner
            .page(
                LifecycleDomain::Contracts,
                TransitionKind::ExpiringSoon,
                &eval(),
                Some("org-2"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(scoped, vec!["c-2"]);
    }

    #[tokio::test]
    async fn test_filter_mirrors_window_predicate() {
        let eval = eval();
        let contracts = vec![
            Contract::new("a", "org", now() - Duration::days(30), now()),
            Contract::new("b", "org", now() - Duration::days(30), now() + Duration::days(5)),
            Contract::new("c", "org", now() - Duration::days(30), now() + Duration::days(6)),
            Contract::new("d", "org", now() - Duration::days(30), now() - Duration::days(1)),
        ];

        let filter = Scanner::contract_filter(TransitionKind::ExpiringSoon, &eval, None).unwrap();
        for contract in &contracts {
            assert_eq!(filter.matches(contract), eval.contract_expiring_soon(contract), "{}", contract.id);
        }

        let filter = Scanner::contract_filter(TransitionKind::Expired, &eval, None).unwrap();
        for contract in &contracts {
            assert_eq!(filter.matches(contract), eval.contract_expired(contract), "{}", contract.id);
        }
    }

    #[test]
    fn test_kinds_without_domain_form() {
        assert!(Scanner::contract_filter(TransitionKind::GracePeriodOver, &eval(), None).is_none());
        assert!(Scanner::subscription_filter(TransitionKind::FreezeRelease, &eval(), None).is_none());
    }
}
