//! Stats reporter - status counts plus the work a pass would do

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::models::*;
use super::scanner::Scanner;
use super::window::WindowEvaluator;
use crate::error::StoreError;
use crate::store::{ContractFilter, LifecycleStore, SubscriptionFilter};

/// Entities a pass run right now would touch, per stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeedsUpdate {
    pub expiring_soon: u64,
    pub expired: u64,
    /// Freeze releases (contracts) or grace period ends (subscriptions)
    pub released: u64,
    pub total: u64,
}

/// Point-in-time view of one lifecycle domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStats {
    pub active: u64,
    /// Contracts in `expiring_soon`, or active subscriptions already warned
    pub expiring_soon: u64,
    pub expired: u64,
    /// Non-deleted rows in scope
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub needs_update: NeedsUpdate,
}

pub struct StatsReporter {
    store: Arc<dyn LifecycleStore>,
}

impl StatsReporter {
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        Self { store }
    }

    pub async fn snapshot(
        &self,
        domain: LifecycleDomain,
        scanner: &Scanner,
        eval: &WindowEvaluator,
        tenant: Option<&str>,
    ) -> Result<LifecycleStats, StoreError> {
        let mut stats = match domain {
            LifecycleDomain::Contracts => self.contract_counts(tenant).await?,
            LifecycleDomain::Subscriptions => self.subscription_counts(tenant).await?,
        };

        let release_kind = match domain {
            LifecycleDomain::Contracts => TransitionKind::FreezeRelease,
            LifecycleDomain::Subscriptions => TransitionKind::GracePeriodOver,
        };
        let expiring_soon = scanner
            .count(domain, TransitionKind::ExpiringSoon, eval, tenant)
            .await?;
        let expired = scanner.count(domain, TransitionKind::Expired, eval, tenant).await?;
        let released = scanner.count(domain, release_kind, eval, tenant).await?;
        stats.needs_update = NeedsUpdate {
            expiring_soon,
            expired,
            released,
            total: expiring_soon + expired + released,
        };
        Ok(stats)
    }

    async fn contract_counts(&self, tenant: Option<&str>) -> Result<LifecycleStats, StoreError> {
        let mut stats = LifecycleStats::default();
        for status in ContractStatus::ALL {
            let count = self
                .store
                .count_contracts(&ContractFilter::with_statuses(&[status]).scoped(tenant))
                .await?;
            stats.by_status.insert(status.to_string(), count);
            stats.total += count;
            match status {
                ContractStatus::Active => stats.active = count,
                ContractStatus::ExpiringSoon => stats.expiring_soon = count,
                ContractStatus::Expired => stats.expired = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn subscription_counts(&self, tenant: Option<&str>) -> Result<LifecycleStats, StoreError> {
        let mut stats = LifecycleStats::default();
        for status in SubscriptionStatus::ALL {
            let count = self
                .store
                .count_subscriptions(&SubscriptionFilter::with_statuses(&[status]).scoped(tenant))
                .await?;
            stats.by_status.insert(status.to_string(), count);
            stats.total += count;
            match status {
                SubscriptionStatus::Active => stats.active = count,
                SubscriptionStatus::Expired => stats.expired = count,
                _ => {}
            }
        }

        let warned = SubscriptionFilter {
            warning_sent: Some(true),
            ..SubscriptionFilter::with_statuses(&[SubscriptionStatus::Active])
        };
        stats.expiring_soon = self.store.count_subscriptions(&warned.scoped(tenant)).await?;
        Ok(stats)
    }
}
