//! Error types for the lifecycle engine
//!
//! Three tiers, matching how far a failure is allowed to travel:
//! - [`ProcessingError`]: one entity failed, recorded in its stage and skipped
//! - [`StoreError`] from a scan: the stage reports `processed: false`
//! - [`LifecycleError`]: the whole pass failed and the caller must retry

use std::time::Duration;

/// Failures raised by a lifecycle store implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database error
    #[error("Backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A row holds a value outside the domain (unknown status, bad timestamp)
    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// The store cannot be reached at all
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A blocking store task panicked or was cancelled
    #[error("Store task failed: {0}")]
    TaskJoin(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::TaskJoin(e.to_string())
    }
}

/// Failure of a single entity transition. Never aborts a stage.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The transaction failed and was rolled back
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The transaction did not finish within the configured bound
    #[error("Transaction for {entity_id} timed out after {}ms", .after.as_millis())]
    Timeout { entity_id: String, after: Duration },

    /// The entity is in the source state but its data cannot support the transition
    #[error("Invariant violated for {entity_id}: {reason}")]
    InvariantViolation { entity_id: String, reason: String },
}

/// Fatal errors that escape a reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Store unreachable for the whole invocation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid or exhausted schedule
    #[error("Schedule error: {0}")]
    Schedule(String),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
