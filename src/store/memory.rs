//! In-memory lifecycle store
//!
//! Transactions work on a copy of the whole state and swap it in on success,
//! so a failed transaction leaves no trace. Faults can be injected per entity
//! to exercise failure isolation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::trace;

use super::*;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    contracts: BTreeMap<EntityId, Contract>,
    subscriptions: BTreeMap<EntityId, SubscriptionOrganization>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Writes to these ids fail
    failing_writes: HashSet<EntityId>,
    /// Every scan and count fails
    scans_unavailable: bool,
    /// Candidate queries fail, counts still work
    finds_unavailable: bool,
    /// Delay before each transaction body runs
    transaction_delay: Option<Duration>,
}

/// In-memory store keyed by id
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    faults: StdMutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_contract(&self, contract: Contract) {
        self.state
            .lock()
            .await
            .contracts
            .insert(contract.id.clone(), contract);
    }

    pub async fn insert_subscription(&self, subscription: SubscriptionOrganization) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn contract(&self, id: &str) -> Option<Contract> {
        self.state.lock().await.contracts.get(id).cloned()
    }

    pub async fn subscription(&self, id: &str) -> Option<SubscriptionOrganization> {
        self.state.lock().await.subscriptions.get(id).cloned()
    }

    /// Make every transaction writing `id` fail.
    pub fn fail_writes_for(&self, id: impl Into<String>) {
        self.faults().failing_writes.insert(id.into());
    }

    /// Make every scan and count fail.
    pub fn set_scans_unavailable(&self, unavailable: bool) {
        self.faults().scans_unavailable = unavailable;
    }

    /// Make candidate queries fail while counts keep working.
    pub fn set_finds_unavailable(&self, unavailable: bool) {
        self.faults().finds_unavailable = unavailable;
    }

    /// Hold each transaction for `delay` before running its body.
    pub fn set_transaction_delay(&self, delay: Option<Duration>) {
        self.faults().transaction_delay = delay;
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_scans(&self) -> Result<(), StoreError> {
        if self.faults().scans_unavailable {
            return Err(StoreError::Unavailable("memory store scans disabled".to_string()));
        }
        Ok(())
    }

    fn check_finds(&self) -> Result<(), StoreError> {
        self.check_scans()?;
        if self.faults().finds_unavailable {
            return Err(StoreError::Unavailable("memory store candidate queries disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl LifecycleStore for MemoryStore {
    async fn find_contracts(&self, filter: &ContractFilter) -> Result<Vec<ContractCandidate>, StoreError> {
        self.check_finds()?;
        let state = self.state.lock().await;
        let rows = state
            .contracts
            .values()
            .filter(|c| filter.matches(c))
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(Contract::candidate)
            .collect();
        Ok(rows)
    }

    async fn count_contracts(&self, filter: &ContractFilter) -> Result<u64, StoreError> {
        self.check_scans()?;
        let state = self.state.lock().await;
        Ok(state.contracts.values().filter(|c| filter.matches(c)).count() as u64)
    }

    async fn find_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<SubscriptionCandidate>, StoreError> {
        self.check_finds()?;
        let state = self.state.lock().await;
        let rows = state
            .subscriptions
            .values()
            .filter(|s| filter.matches(s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(SubscriptionOrganization::candidate)
            .collect();
        Ok(rows)
    }

    async fn count_subscriptions(&self, filter: &SubscriptionFilter) -> Result<u64, StoreError> {
        self.check_scans()?;
        let state = self.state.lock().await;
        Ok(state.subscriptions.values().filter(|s| filter.matches(s)).count() as u64)
    }

    async fn run_in_transaction(&self, work: TxWork) -> Result<TransitionOutcome, ProcessingError> {
        let delay = self.faults().transaction_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing_writes = self.faults().failing_writes.clone();
        let mut state = self.state.lock().await;

        let mut tx = MemoryTx {
            scratch: state.clone(),
            failing_writes,
        };

        let outcome = work(&mut tx)?;
        *state = tx.scratch;
        trace!(?outcome, "Memory transaction committed");
        Ok(outcome)
    }
}

struct MemoryTx {
    scratch: MemoryState,
    failing_writes: HashSet<EntityId>,
}

impl MemoryTx {
    fn check_write(&self, id: &str) -> Result<(), StoreError> {
        if self.failing_writes.contains(id) {
            return Err(StoreError::Backend(format!("injected write failure for {}", id)));
        }
        Ok(())
    }
}

impl LifecycleTx for MemoryTx {
    fn contract(&mut self, id: &str) -> Result<Option<Contract>, StoreError> {
        Ok(self.scratch.contracts.get(id).cloned())
    }

    fn latest_renewal(&mut self, parent_id: &str) -> Result<Option<Contract>, StoreError> {
        Ok(self
            .scratch
            .contracts
            .values()
            .filter(|c| !c.is_deleted() && c.renewal_of.as_deref() == Some(parent_id))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    fn save_contract(&mut self, contract: &Contract) -> Result<(), StoreError> {
        self.check_write(&contract.id)?;
        match self.scratch.contracts.get_mut(&contract.id) {
            Some(row) => {
                *row = contract.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("contract {} does not exist", contract.id))),
        }
    }

    fn subscription(&mut self, id: &str) -> Result<Option<SubscriptionOrganization>, StoreError> {
        Ok(self.scratch.subscriptions.get(id).cloned())
    }

    fn save_subscription(&mut self, subscription: &SubscriptionOrganization) -> Result<(), StoreError> {
        self.check_write(&subscription.id)?;
        match self.scratch.subscriptions.get_mut(&subscription.id) {
            Some(row) => {
                *row = subscription.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "subscription {} does not exist",
                subscription.id
            ))),
        }
    }
}
