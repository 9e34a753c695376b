//! Notification requests emitted after a transition commits
//!
//! Delivery (email, push) lives outside the engine. The engine only asks a
//! [`Notifier`] to send something; a failed request is logged and the
//! committed transition stands.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::models::*;

/// What the recipient is being told
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    ContractExpiringSoon,
    ContractExpired,
    ContractFreezeReleased,
    RenewalActivated,
    SubscriptionExpiringSoon,
    SubscriptionGracePeriodStarted,
    SubscriptionAccessSuspended,
}

/// A single notification request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub kind: NoticeKind,
    pub entity_id: EntityId,
    /// Renewal contract for `RenewalActivated`
    pub related_id: Option<EntityId>,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn new(kind: NoticeKind, entity_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            related_id: None,
            at,
        }
    }

    /// Notices owed for a committed outcome. `AlreadyApplied` owes nothing.
    pub fn for_outcome(
        domain: LifecycleDomain,
        entity_id: &str,
        outcome: &TransitionOutcome,
        at: DateTime<Utc>,
    ) -> Vec<Notice> {
        let TransitionOutcome::Applied { kind, cascade } = outcome else {
            return Vec::new();
        };

        let primary = match (domain, kind) {
            (LifecycleDomain::Contracts, TransitionKind::ExpiringSoon) => NoticeKind::ContractExpiringSoon,
            (LifecycleDomain::Contracts, TransitionKind::Expired) => NoticeKind::ContractExpired,
            (LifecycleDomain::Contracts, TransitionKind::FreezeRelease) => NoticeKind::ContractFreezeReleased,
            (LifecycleDomain::Subscriptions, TransitionKind::ExpiringSoon) => {
                NoticeKind::SubscriptionExpiringSoon
            }
            (LifecycleDomain::Subscriptions, TransitionKind::Expired) => {
                NoticeKind::SubscriptionGracePeriodStarted
            }
            (LifecycleDomain::Subscriptions, TransitionKind::GracePeriodOver) => {
                NoticeKind::SubscriptionAccessSuspended
            }
            _ => return Vec::new(),
        };

        let mut notices = vec![Notice::new(primary, entity_id, at)];
        if let CascadeOutcome::Activated { renewal_id } = cascade {
            notices.push(Notice {
                related_id: Some(renewal_id.clone()),
                ..Notice::new(NoticeKind::RenewalActivated, entity_id, at)
            });
        }
        notices
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Sink for notification requests
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: Notice) -> Result<(), NotifyError>;
}

/// Emits each notice as a tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: Notice) -> Result<(), NotifyError> {
        info!(
            kind = ?notice.kind,
            entity_id = %notice.entity_id,
            related_id = ?notice.related_id,
            "Notification requested"
        );
        Ok(())
    }
}

/// Keeps every notice in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records nothing and fails every request
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|n| n.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn count(&self, kind: NoticeKind) -> usize {
        self.notices().iter().filter(|n| n.kind == kind).count()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: Notice) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError(format!("refused {:?} for {}", notice.kind, notice.entity_id)));
        }
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice);
        Ok(())
    }
}
