//! Process-local mirror of hot marker entries.
//!
//! Optional fast path for a single serving process: toggles write through
//! to both the mirror and the shared cache, reads prefer the mirror and
//! fall back to the shared cache and then the durable store. The three-way
//! [`LikeStatus`] keeps "confirmed not liked" distinct from "never seen",
//! so confirmed negatives stop hitting the fallback tiers.

use dashmap::DashMap;
use tracing::debug;

use crate::model::LikeStatus;

#[derive(Debug, Clone, Copy)]
enum MirrorEntry {
    Liked { expires_at: i64 },
    NotLiked,
}

pub struct MirrorCache {
    entries: DashMap<(i64, i64), MirrorEntry>,
    max_entries: usize,
}

impl MirrorCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Local answer for one pair. An expired local "liked" degrades to
    /// `Unknown` (and is dropped) so the caller re-reads the shared cache,
    /// which owns the lazy-expiry policy.
    pub fn status(&self, user_id: i64, item_id: i64, now_millis: i64) -> LikeStatus {
        let key = (user_id, item_id);
        match self.entries.get(&key).map(|entry| *entry) {
            None => LikeStatus::Unknown,
            Some(MirrorEntry::NotLiked) => LikeStatus::NotLiked,
            Some(MirrorEntry::Liked { expires_at }) if expires_at < now_millis => {
                self.entries.remove(&key);
                LikeStatus::Unknown
            }
            Some(MirrorEntry::Liked { .. }) => LikeStatus::Liked,
        }
    }

    pub fn note_liked(&self, user_id: i64, item_id: i64, expires_at: i64) {
        self.insert((user_id, item_id), MirrorEntry::Liked { expires_at });
    }

    pub fn note_not_liked(&self, user_id: i64, item_id: i64) {
        self.insert((user_id, item_id), MirrorEntry::NotLiked);
    }

    pub fn forget(&self, user_id: i64, item_id: i64) {
        self.entries.remove(&(user_id, item_id));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&self, key: (i64, i64), entry: MirrorEntry) {
        // Coarse capacity bound: a full mirror is cleared rather than
        // tracked per-entry. It is a shadow of the shared cache, so losing
        // it only costs fallback reads.
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            debug!(capacity = self.max_entries, "Mirror cache full, clearing");
            self.entries.clear();
        }
        self.entries.insert(key, entry);
    }
}
