//! In-memory backends for tests and single-node runs.
//!
//! [`InMemoryMarkerStore`] is the lock-based toggle variant: without a
//! server-side script it serializes all mutating calls for a user through a
//! per-user mutex registry before the read-check-then-write sequence. That
//! guarantee holds within one process only; multi-instance deployments need
//! the Redis script path.
//!
//! [`InMemoryLikeStore`] applies batches under a single mutex so an apply is
//! observed all-or-nothing, mirroring the SQL transaction. It can be primed
//! to fail, which the pipeline tests use to exercise redelivery and
//! dead-lettering.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::traits::{LikeStore, MarkerStore, StorageError, ToggleOutcome};
use crate::keys;
use crate::model::{now_millis, LikeKey, LikeRecord, NetBatch};

#[derive(Default)]
pub struct InMemoryMarkerStore {
    /// user_id → (item_id → expiry millis)
    markers: DashMap<i64, HashMap<i64, i64>>,
    /// pending key → (field → signed count)
    pending: DashMap<String, HashMap<String, i64>>,
    /// Per-user critical sections for the toggle protocol
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl InMemoryMarkerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn bump_pending(&self, user_id: i64, item_id: i64, delta: i64) {
        let key = keys::pending_key(&keys::time_slice(now_millis()));
        let field = format!("{user_id}:{item_id}");
        *self.pending.entry(key).or_default().entry(field).or_insert(0) += delta;
    }

    /// Provisional counter value for one pair in the current time slice.
    #[must_use]
    pub fn pending_count(&self, user_id: i64, item_id: i64) -> i64 {
        let key = keys::pending_key(&keys::time_slice(now_millis()));
        let field = format!("{user_id}:{item_id}");
        self.pending
            .get(&key)
            .and_then(|fields| fields.get(&field).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MarkerStore for InMemoryMarkerStore {
    async fn toggle_like(
        &self,
        user_id: i64,
        item_id: i64,
        expire_at: i64,
    ) -> Result<ToggleOutcome, StorageError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut entry = self.markers.entry(user_id).or_default();
        if entry.contains_key(&item_id) {
            return Ok(ToggleOutcome::AlreadyInState);
        }
        entry.insert(item_id, expire_at);
        drop(entry);

        self.bump_pending(user_id, item_id, 1);
        Ok(ToggleOutcome::Applied)
    }

    async fn toggle_unlike(
        &self,
        user_id: i64,
        item_id: i64,
    ) -> Result<ToggleOutcome, StorageError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let mut entry = self.markers.entry(user_id).or_default();
        if entry.remove(&item_id).is_none() {
            return Ok(ToggleOutcome::AlreadyInState);
        }
        drop(entry);

        self.bump_pending(user_id, item_id, -1);
        Ok(ToggleOutcome::Applied)
    }

    async fn marker(&self, user_id: i64, item_id: i64) -> Result<Option<i64>, StorageError> {
        Ok(self
            .markers
            .get(&user_id)
            .and_then(|items| items.get(&item_id).copied()))
    }

    async fn markers(
        &self,
        user_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<Option<i64>>, StorageError> {
        let entry = self.markers.get(&user_id);
        Ok(item_ids
            .iter()
            .map(|item_id| entry.as_ref().and_then(|items| items.get(item_id).copied()))
            .collect())
    }

    async fn remove_marker(&self, user_id: i64, item_id: i64) -> Result<(), StorageError> {
        if let Some(mut items) = self.markers.get_mut(&user_id) {
            items.remove(&item_id);
        }
        Ok(())
    }

    async fn restore_marker(
        &self,
        user_id: i64,
        item_id: i64,
        expire_at: i64,
    ) -> Result<(), StorageError> {
        self.markers
            .entry(user_id)
            .or_default()
            .insert(item_id, expire_at);
        Ok(())
    }

    async fn marked_users(&self) -> Result<Vec<i64>, StorageError> {
        Ok(self
            .markers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect())
    }

    async fn marked_items(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        Ok(self
            .markers
            .get(&user_id)
            .map(|items| items.keys().copied().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryLikeStore {
    records: DashMap<(i64, i64), LikeRecord>,
    counters: DashMap<i64, i64>,
    /// Serializes applies so a batch lands all-or-nothing
    apply_lock: Mutex<()>,
    /// When non-zero, the next applies fail (fault injection for tests)
    fail_applies: AtomicU32,
}

impl InMemoryLikeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `apply` fail with a backend error.
    pub fn fail_next_applies(&self, n: u32) {
        self.fail_applies.store(n, Ordering::SeqCst);
    }

    /// Total record count across all users.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl LikeStore for InMemoryLikeStore {
    async fn apply(&self, batch: &NetBatch) -> Result<(), StorageError> {
        let _guard = self.apply_lock.lock().await;

        let remaining = self.fail_applies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_applies.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Backend("injected apply failure".into()));
        }

        for (item_id, delta) in &batch.counter_deltas {
            *self.counters.entry(*item_id).or_insert(0) += delta;
        }
        for LikeKey { user_id, item_id } in &batch.removals {
            self.records.remove(&(*user_id, *item_id));
        }
        for record in &batch.inserts {
            self.records
                .entry((record.user_id, record.item_id))
                .or_insert_with(|| record.clone());
        }

        Ok(())
    }

    async fn has_like(&self, user_id: i64, item_id: i64) -> Result<bool, StorageError> {
        Ok(self.records.contains_key(&(user_id, item_id)))
    }

    async fn liked_items(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        let mut items: Vec<i64> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.key().1)
            .collect();
        items.sort_unstable();
        Ok(items)
    }

    async fn like_count(&self, item_id: i64) -> Result<i64, StorageError> {
        Ok(self.counters.get(&item_id).map(|c| *c).unwrap_or(0))
    }
}
