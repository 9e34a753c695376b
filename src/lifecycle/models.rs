//! Lifecycle models - entities, candidates and transition outcomes
//!
//! Shared types for the contract and subscription reconciliation passes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a contract or subscription row
pub type EntityId = String;

//=============================================================================
// CONTRACTS
//=============================================================================

/// Status of a client's membership contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    /// Signed, not yet in force (also used for queued renewals)
    Pending,
    Active,
    /// Inside the pre-expiration warning window
    ExpiringSoon,
    Expired,
    /// Paused between the two freeze dates
    Frozen,
    Cancelled,
}

impl ContractStatus {
    pub const ALL: [ContractStatus; 6] = [
        ContractStatus::Pending,
        ContractStatus::Active,
        ContractStatus::ExpiringSoon,
        ContractStatus::Expired,
        ContractStatus::Frozen,
        ContractStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Pending => "pending",
            ContractStatus::Active => "active",
            ContractStatus::ExpiringSoon => "expiring_soon",
            ContractStatus::Expired => "expired",
            ContractStatus::Frozen => "frozen",
            ContractStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContractStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown contract status '{}'", s))
    }
}

/// A client's membership term.
///
/// A renewal is itself a contract whose `renewal_of` points at the term it
/// succeeds. It carries a `final_amount` only once payment is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: EntityId,
    pub client_id: String,
    pub plan_id: String,
    /// Owning tenant
    pub organization_id: String,
    pub status: ContractStatus,
    pub start_date: DateTime<Utc>,
    /// Always set for non-pending contracts
    pub end_date: Option<DateTime<Utc>>,
    pub freeze_start_date: Option<DateTime<Utc>>,
    pub freeze_end_date: Option<DateTime<Utc>>,
    /// Parent contract when this row is a renewal
    pub renewal_of: Option<EntityId>,
    pub final_amount: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Contract {
    /// Create an active contract for the given term.
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: String::new(),
            plan_id: String::new(),
            organization_id: organization_id.into(),
            status: ContractStatus::Active,
            start_date,
            end_date: Some(end_date),
            freeze_start_date: None,
            freeze_end_date: None,
            renewal_of: None,
            final_amount: None,
            created_at: start_date,
            updated_at: start_date,
            deleted_at: None,
        }
    }

    /// Create a pending renewal that succeeds `parent`.
    pub fn renewal_for(
        parent: &Contract,
        id: impl Into<String>,
        end_date: DateTime<Utc>,
        final_amount: Option<f64>,
    ) -> Self {
        let start = parent.end_date.unwrap_or(parent.start_date);
        Self {
            client_id: parent.client_id.clone(),
            plan_id: parent.plan_id.clone(),
            status: ContractStatus::Pending,
            renewal_of: Some(parent.id.clone()),
            final_amount,
            ..Contract::new(id, parent.organization_id.clone(), start, end_date)
        }
    }

    pub fn with_status(mut self, status: ContractStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self.plan_id = plan_id.into();
        self
    }

    /// Put the contract on hold between the two dates.
    pub fn frozen_between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.status = ContractStatus::Frozen;
        self.freeze_start_date = Some(from);
        self.freeze_end_date = Some(until);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Frozen only while both freeze dates are set
    pub fn has_freeze_window(&self) -> bool {
        self.freeze_start_date.is_some() && self.freeze_end_date.is_some()
    }

    /// `final_amount > 0` stands in for "payment confirmed"; there is no payment field.
    pub fn has_confirmed_payment(&self) -> bool {
        matches!(self.final_amount, Some(amount) if amount > 0.0)
    }

    pub fn candidate(&self) -> ContractCandidate {
        ContractCandidate {
            id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            status: self.status,
            end_date: self.end_date,
            freeze_end_date: self.freeze_end_date,
        }
    }
}

/// Essential fields returned by a contract scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractCandidate {
    pub id: EntityId,
    pub organization_id: String,
    pub status: ContractStatus,
    pub end_date: Option<DateTime<Utc>>,
    pub freeze_end_date: Option<DateTime<Utc>>,
}

//=============================================================================
// SUBSCRIPTIONS
//=============================================================================

/// Status of an organization's billing subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    /// Past its end date, inside the grace period
    Expired,
    /// Grace period over, access suspended
    Inactive,
    Cancelled,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 4] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Inactive,
        SubscriptionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown subscription status '{}'", s))
    }
}

/// Transition bookkeeping stashed on a subscription.
///
/// Unknown keys written by other parts of the system are kept in `extra` and
/// written back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMetadata {
    /// Set once per term; suppresses repeat warnings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_warning: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_ended: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_suspended: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SubscriptionMetadata {
    pub fn warning_sent(&self) -> bool {
        self.expiration_warning == Some(true)
    }

    pub fn access_suspended(&self) -> bool {
        self.access_suspended == Some(true)
    }
}

/// An organization's billing subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionOrganization {
    pub id: EntityId,
    pub organization_id: String,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
    pub metadata: SubscriptionMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SubscriptionOrganization {
    /// Create an active subscription for the given term.
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            status: SubscriptionStatus::Active,
            start_date,
            end_date,
            is_active: true,
            metadata: SubscriptionMetadata::default(),
            created_at: start_date,
            updated_at: start_date,
            deleted_at: None,
        }
    }

    /// Expired subscription whose grace period runs between the two instants.
    pub fn in_grace_period(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.status = SubscriptionStatus::Expired;
        self.metadata.grace_period_start = Some(start);
        self.metadata.grace_period_end = Some(end);
        self.metadata.expired_at = Some(start);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn candidate(&self) -> SubscriptionCandidate {
        SubscriptionCandidate {
            id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            status: self.status,
            end_date: self.end_date,
            grace_period_end: self.metadata.grace_period_end,
        }
    }
}

/// Essential fields returned by a subscription scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionCandidate {
    pub id: EntityId,
    pub organization_id: String,
    pub status: SubscriptionStatus,
    pub end_date: DateTime<Utc>,
    pub grace_period_end: Option<DateTime<Utc>>,
}

//=============================================================================
// TRANSITIONS
//=============================================================================

/// The two lifecycle domains a pass can reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleDomain {
    Contracts,
    Subscriptions,
}

impl fmt::Display for LifecycleDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleDomain::Contracts => f.write_str("contracts"),
            LifecycleDomain::Subscriptions => f.write_str("subscriptions"),
        }
    }
}

/// Time-driven transitions, in the order a pass applies them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    ExpiringSoon,
    Expired,
    /// Contracts: frozen -> active
    FreezeRelease,
    /// Subscriptions: expired -> inactive
    GracePeriodOver,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionKind::ExpiringSoon => "expiring_soon",
            TransitionKind::Expired => "expired",
            TransitionKind::FreezeRelease => "freeze_release",
            TransitionKind::GracePeriodOver => "grace_period_over",
        };
        f.write_str(name)
    }
}

/// What the cascade did alongside a contract expiration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum CascadeOutcome {
    /// Transition kind has no cascade
    NotApplicable,
    NoRenewal,
    Activated { renewal_id: EntityId },
    /// Renewal exists but payment is not confirmed; left untouched
    AwaitingPayment { renewal_id: EntityId },
    /// Renewal is not pending (already active, cancelled...); left untouched
    Ineligible {
        renewal_id: EntityId,
        status: ContractStatus,
    },
}

/// Result of processing one candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TransitionOutcome {
    Applied {
        kind: TransitionKind,
        cascade: CascadeOutcome,
    },
    /// Entity left the source state before the write (concurrent run or manual action)
    AlreadyApplied,
}

impl TransitionOutcome {
    pub fn applied(kind: TransitionKind) -> Self {
        TransitionOutcome::Applied {
            kind,
            cascade: CascadeOutcome::NotApplicable,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }

    pub fn renewal_activated(&self) -> bool {
        matches!(
            self,
            TransitionOutcome::Applied {
                cascade: CascadeOutcome::Activated { .. },
                ..
            }
        )
    }
}

/// A per-entity failure recorded in a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityError {
    pub entity_id: EntityId,
    pub error: String,
}
