use async_trait::async_trait;
use thiserror::Error;

use crate::model::NetBatch;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Outcome of an atomic toggle against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The marker was mutated; an event must be emitted.
    Applied,
    /// The pair was already in the requested state; nothing changed.
    AlreadyInState,
}

/// The shared cache contract: per-user marker hashes plus the atomic
/// check-and-mutate used by the toggle gateway.
///
/// The check-then-write for a single (user, item) pair executes as one
/// indivisible operation (a server-side script for Redis, a per-user
/// critical section for the in-memory variant) so two concurrent toggles
/// for the same pair can never both observe "not liked".
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Atomic like: fails with `AlreadyInState` if the marker exists,
    /// otherwise records a provisional increment and sets the marker to
    /// `expire_at` (epoch millis).
    async fn toggle_like(
        &self,
        user_id: i64,
        item_id: i64,
        expire_at: i64,
    ) -> Result<ToggleOutcome, StorageError>;

    /// Atomic unlike: fails with `AlreadyInState` if no marker exists,
    /// otherwise records a provisional decrement and removes the marker.
    async fn toggle_unlike(&self, user_id: i64, item_id: i64) -> Result<ToggleOutcome, StorageError>;

    /// Read one marker's expiry millis, `None` if absent.
    async fn marker(&self, user_id: i64, item_id: i64) -> Result<Option<i64>, StorageError>;

    /// Multi-get by field list for batch existence queries. Result is
    /// positionally aligned with `item_ids`.
    async fn markers(
        &self,
        user_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<Option<i64>>, StorageError>;

    /// Remove a marker outside the toggle protocol (publish compensation,
    /// lazy eviction). Removing an absent marker is not an error.
    async fn remove_marker(&self, user_id: i64, item_id: i64) -> Result<(), StorageError>;

    /// Restore a marker outside the toggle protocol (compensation for a
    /// failed unlike-publish).
    async fn restore_marker(
        &self,
        user_id: i64,
        item_id: i64,
        expire_at: i64,
    ) -> Result<(), StorageError>;

    /// All users with at least one marker present (reconciliation scan).
    async fn marked_users(&self) -> Result<Vec<i64>, StorageError>;

    /// All item ids marked for one user.
    async fn marked_items(&self, user_id: i64) -> Result<Vec<i64>, StorageError>;
}

/// The durable store contract: authoritative like records and item counters.
///
/// `apply` is the only mutator and commits the whole [`NetBatch`] in one
/// transaction: the batched counter-delta statement, the combined delete,
/// and the chunked inserts either all land or none do.
#[async_trait]
pub trait LikeStore: Send + Sync {
    /// Transactionally apply a consumed batch's net effect.
    ///
    /// Must be idempotent for re-applied batches: inserts are
    /// existence-tolerant and deletes tolerate missing rows.
    async fn apply(&self, batch: &NetBatch) -> Result<(), StorageError>;

    /// Authoritative existence check for one (user, item) pair.
    async fn has_like(&self, user_id: i64, item_id: i64) -> Result<bool, StorageError>;

    /// All item ids recorded as liked by one user (reconciliation scan).
    async fn liked_items(&self, user_id: i64) -> Result<Vec<i64>, StorageError>;

    /// Current counter value for one item (0 if never touched).
    async fn like_count(&self, item_id: i64) -> Result<i64, StorageError>;
}
