//! Core data types for the like engine.
//!
//! A [`ToggleEvent`] is the unit that flows through the pipeline: emitted by
//! the gateway after a successful cache mutation, carried by the broker, and
//! folded into a [`NetBatch`] by the consumer before the durable apply.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Direction of a toggle: a like increments, an unlike decrements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToggleKind {
    #[serde(rename = "INCR")]
    Incr,
    #[serde(rename = "DECR")]
    Decr,
}

/// Identity of one (user, item) like relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LikeKey {
    pub user_id: i64,
    pub item_id: i64,
}

impl LikeKey {
    #[must_use]
    pub fn new(user_id: i64, item_id: i64) -> Self {
        Self { user_id, item_id }
    }

    /// Routing key for the broker. All events for one pair must share it so
    /// the subscription observes them in order.
    #[must_use]
    pub fn routing_key(&self) -> String {
        format!("{}:{}", self.user_id, self.item_id)
    }
}

/// An immutable toggle event.
///
/// Serialized as JSON on the wire:
/// `{"user_id":1,"item_id":100,"type":"INCR","event_time":1767084657058}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleEvent {
    pub user_id: i64,
    pub item_id: i64,
    #[serde(rename = "type")]
    pub kind: ToggleKind,
    /// Epoch millis at emission. Groups are sorted by this before the
    /// net-effect fold, so it must be monotone per key for a single emitter.
    pub event_time: i64,
}

impl ToggleEvent {
    #[must_use]
    pub fn new(user_id: i64, item_id: i64, kind: ToggleKind) -> Self {
        Self {
            user_id,
            item_id,
            kind,
            event_time: now_millis(),
        }
    }

    #[must_use]
    pub fn key(&self) -> LikeKey {
        LikeKey::new(self.user_id, self.item_id)
    }
}

/// A durable like record. At most one row exists per (user_id, item_id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeRecord {
    pub user_id: i64,
    pub item_id: i64,
    /// Epoch millis when the record was created.
    pub created_at: i64,
}

impl LikeRecord {
    #[must_use]
    pub fn new(user_id: i64, item_id: i64) -> Self {
        Self {
            user_id,
            item_id,
            created_at: now_millis(),
        }
    }
}

/// Three-way read result for like state.
///
/// `NotLiked` is an explicit sentinel, distinct from `Unknown` (absent), so a
/// confirmed-negative answer does not trigger repeated fallback queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeStatus {
    /// No local knowledge; the caller must fall back to a slower tier.
    Unknown,
    Liked,
    NotLiked,
}

/// The net effect of one consumed batch, ready for a single-transaction apply.
///
/// Produced by [`net_effects`](crate::consumer::net_effects): one signed delta
/// per touched item, the records to insert for net likes, and the keys to
/// delete for net unlikes.
#[derive(Debug, Default, Clone)]
pub struct NetBatch {
    /// item_id → signed like-count delta.
    pub counter_deltas: HashMap<i64, i64>,
    /// New records for net-INCR groups.
    pub inserts: Vec<LikeRecord>,
    /// Keys to remove for net-DECR groups.
    pub removals: Vec<LikeKey>,
}

impl NetBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counter_deltas.is_empty() && self.inserts.is_empty() && self.removals.is_empty()
    }
}
