//! Toggle gateway: the synchronous like/unlike/has-liked surface.
//!
//! `like` and `unlike` run one atomic check-and-mutate against the shared
//! cache and answer definitively: domain errors (`AlreadyLiked`,
//! `NotLiked`, validation failures) are surfaced directly and never retried.
//! After a successful mutation the matching toggle event is handed to the
//! emitter; the caller does not wait for (or learn about) the publish.
//!
//! `has_liked` reads the marker and applies the lazy-expiry policy: an
//! expired marker answers "not liked" immediately and schedules a
//! best-effort background eviction of the stale field (read repair; the
//! cache does not enforce TTL itself).

use std::sync::Arc;
use thiserror::Error;

use crate::emitter::EventEmitter;
use crate::eviction::EvictionQueue;
use crate::mirror::MirrorCache;
use crate::model::{now_millis, LikeStatus, ToggleEvent, ToggleKind};
use crate::storage::traits::{LikeStore, MarkerStore, StorageError, ToggleOutcome};

/// Domain errors surfaced synchronously to the caller.
#[derive(Error, Debug)]
pub enum ToggleError {
    #[error("Already liked")]
    AlreadyLiked,
    #[error("Not liked")]
    NotLiked,
    #[error("Invalid request")]
    InvalidRequest,
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A toggle request as it arrives from the (external) transport layer.
///
/// `user_id` is the session-resolved identity; `None` means the caller was
/// not authenticated. `item_id` comes from the request body and may be
/// missing or nonsense.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToggleRequest {
    pub user_id: Option<i64>,
    pub item_id: Option<i64>,
}

impl ToggleRequest {
    #[must_use]
    pub fn new(user_id: i64, item_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            item_id: Some(item_id),
        }
    }
}

pub struct ToggleGateway {
    markers: Arc<dyn MarkerStore>,
    store: Arc<dyn LikeStore>,
    emitter: Arc<EventEmitter>,
    evictions: EvictionQueue,
    mirror: Option<Arc<MirrorCache>>,
    marker_ttl_millis: i64,
}

impl ToggleGateway {
    pub fn new(
        markers: Arc<dyn MarkerStore>,
        store: Arc<dyn LikeStore>,
        emitter: Arc<EventEmitter>,
        evictions: EvictionQueue,
        mirror: Option<Arc<MirrorCache>>,
        marker_ttl_millis: i64,
    ) -> Self {
        Self {
            markers,
            store,
            emitter,
            evictions,
            mirror,
            marker_ttl_millis,
        }
    }

    fn validate(request: &ToggleRequest) -> Result<(i64, i64), ToggleError> {
        let user_id = request.user_id.ok_or(ToggleError::NotAuthenticated)?;
        let item_id = request.item_id.ok_or(ToggleError::InvalidRequest)?;
        if user_id <= 0 || item_id <= 0 {
            return Err(ToggleError::InvalidRequest);
        }
        Ok((user_id, item_id))
    }

    /// Like an item. Fails with [`ToggleError::AlreadyLiked`] if the marker
    /// already exists; otherwise the marker is set atomically and an INCR
    /// event is emitted.
    pub async fn like(&self, request: &ToggleRequest) -> Result<(), ToggleError> {
        let (user_id, item_id) = Self::validate(request)?;
        let expire_at = now_millis() + self.marker_ttl_millis;

        match self.markers.toggle_like(user_id, item_id, expire_at).await? {
            ToggleOutcome::AlreadyInState => {
                crate::metrics::record_toggle("like", "already_liked");
                Err(ToggleError::AlreadyLiked)
            }
            ToggleOutcome::Applied => {
                if let Some(mirror) = &self.mirror {
                    mirror.note_liked(user_id, item_id, expire_at);
                }
                let _ = self
                    .emitter
                    .emit(ToggleEvent::new(user_id, item_id, ToggleKind::Incr), expire_at);
                crate::metrics::record_toggle("like", "success");
                Ok(())
            }
        }
    }

    /// Unlike an item. Fails with [`ToggleError::NotLiked`] if no marker
    /// exists; otherwise the marker is removed atomically and a DECR event
    /// is emitted.
    pub async fn unlike(&self, request: &ToggleRequest) -> Result<(), ToggleError> {
        let (user_id, item_id) = Self::validate(request)?;
        // Fresh expiry hint in case a failed publish restores the marker
        let expire_at = now_millis() + self.marker_ttl_millis;

        match self.markers.toggle_unlike(user_id, item_id).await? {
            ToggleOutcome::AlreadyInState => {
                crate::metrics::record_toggle("unlike", "not_liked");
                Err(ToggleError::NotLiked)
            }
            ToggleOutcome::Applied => {
                if let Some(mirror) = &self.mirror {
                    mirror.note_not_liked(user_id, item_id);
                }
                let _ = self
                    .emitter
                    .emit(ToggleEvent::new(user_id, item_id, ToggleKind::Decr), expire_at);
                crate::metrics::record_toggle("unlike", "success");
                Ok(())
            }
        }
    }

    /// Whether `user_id` currently likes `item_id`.
    ///
    /// Read order: mirror (if enabled) → shared cache marker → durable
    /// store. Only the cold path (no marker at all) touches the store.
    pub async fn has_liked(&self, user_id: i64, item_id: i64) -> Result<bool, ToggleError> {
        if user_id <= 0 || item_id <= 0 {
            return Err(ToggleError::InvalidRequest);
        }
        let now = now_millis();

        if let Some(mirror) = &self.mirror {
            match mirror.status(user_id, item_id, now) {
                LikeStatus::Liked => return Ok(true),
                LikeStatus::NotLiked => return Ok(false),
                LikeStatus::Unknown => {}
            }
        }

        match self.markers.marker(user_id, item_id).await? {
            None => {
                // Never cached for this pair: the store is authoritative
                let liked = self.store.has_like(user_id, item_id).await?;
                if let Some(mirror) = &self.mirror {
                    if liked {
                        mirror.note_liked(user_id, item_id, now + self.marker_ttl_millis);
                    } else {
                        mirror.note_not_liked(user_id, item_id);
                    }
                }
                Ok(liked)
            }
            Some(expire_at) if expire_at < now => {
                // Stale marker: answer now, clean up later
                self.evictions.schedule(user_id, item_id);
                if let Some(mirror) = &self.mirror {
                    mirror.note_not_liked(user_id, item_id);
                }
                Ok(false)
            }
            Some(expire_at) => {
                if let Some(mirror) = &self.mirror {
                    mirror.note_liked(user_id, item_id, expire_at);
                }
                Ok(true)
            }
        }
    }

    /// Batch variant of [`has_liked`](Self::has_liked) for annotating item
    /// listings. One marker multi-get covers the cached pairs; only pairs
    /// with no marker at all fall back to the store.
    pub async fn has_liked_many(
        &self,
        user_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<bool>, ToggleError> {
        if user_id <= 0 || item_ids.iter().any(|id| *id <= 0) {
            return Err(ToggleError::InvalidRequest);
        }
        let now = now_millis();
        let markers = self.markers.markers(user_id, item_ids).await?;

        let mut results = Vec::with_capacity(item_ids.len());
        for (item_id, marker) in item_ids.iter().zip(markers) {
            let liked = match marker {
                Some(expire_at) if expire_at < now => {
                    self.evictions.schedule(user_id, *item_id);
                    false
                }
                Some(_) => true,
                None => self.store.has_like(user_id, *item_id).await?,
            };
            results.push(liked);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::storage::memory::{InMemoryLikeStore, InMemoryMarkerStore};
    use std::time::Duration;

    struct Fixture {
        gateway: ToggleGateway,
        markers: Arc<InMemoryMarkerStore>,
        store: Arc<InMemoryLikeStore>,
    }

    fn fixture(mirror: Option<Arc<MirrorCache>>) -> Fixture {
        let markers = Arc::new(InMemoryMarkerStore::new());
        let store = Arc::new(InMemoryLikeStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let emitter = Arc::new(EventEmitter::new(
            broker,
            Arc::clone(&markers) as Arc<dyn MarkerStore>,
            "t".into(),
        ));
        let (evictions, _handle) =
            EvictionQueue::spawn(Arc::clone(&markers) as Arc<dyn MarkerStore>, 16);
        let gateway = ToggleGateway::new(
            Arc::clone(&markers) as Arc<dyn MarkerStore>,
            Arc::clone(&store) as Arc<dyn LikeStore>,
            emitter,
            evictions,
            mirror,
            30 * 24 * 3600 * 1000,
        );
        Fixture {
            gateway,
            markers,
            store,
        }
    }

    #[tokio::test]
    async fn like_then_like_again_is_rejected() {
        let f = fixture(None);
        let request = ToggleRequest::new(1, 100);

        f.gateway.like(&request).await.unwrap();
        assert!(matches!(
            f.gateway.like(&request).await,
            Err(ToggleError::AlreadyLiked)
        ));
    }

    #[tokio::test]
    async fn unlike_without_like_is_rejected() {
        let f = fixture(None);
        assert!(matches!(
            f.gateway.unlike(&ToggleRequest::new(1, 100)).await,
            Err(ToggleError::NotLiked)
        ));
    }

    #[tokio::test]
    async fn toggles_strictly_alternate() {
        let f = fixture(None);
        let request = ToggleRequest::new(1, 100);

        f.gateway.like(&request).await.unwrap();
        f.gateway.unlike(&request).await.unwrap();
        f.gateway.like(&request).await.unwrap();
        f.gateway.unlike(&request).await.unwrap();
        assert!(matches!(
            f.gateway.unlike(&request).await,
            Err(ToggleError::NotLiked)
        ));
    }

    #[tokio::test]
    async fn validation_errors() {
        let f = fixture(None);

        assert!(matches!(
            f.gateway
                .like(&ToggleRequest { user_id: None, item_id: Some(100) })
                .await,
            Err(ToggleError::NotAuthenticated)
        ));
        assert!(matches!(
            f.gateway
                .like(&ToggleRequest { user_id: Some(1), item_id: None })
                .await,
            Err(ToggleError::InvalidRequest)
        ));
        assert!(matches!(
            f.gateway.like(&ToggleRequest::new(1, -5)).await,
            Err(ToggleError::InvalidRequest)
        ));
        assert!(matches!(
            f.gateway.has_liked(0, 100).await,
            Err(ToggleError::InvalidRequest)
        ));
    }

    #[tokio::test]
    async fn has_liked_reads_live_marker() {
        let f = fixture(None);
        f.gateway.like(&ToggleRequest::new(1, 100)).await.unwrap();
        assert!(f.gateway.has_liked(1, 100).await.unwrap());
        assert!(!f.gateway.has_liked(1, 200).await.unwrap());
    }

    #[tokio::test]
    async fn has_liked_falls_back_to_store_when_uncached() {
        let f = fixture(None);
        // Record exists durably but no marker is cached (e.g. expired away)
        f.store
            .apply(&crate::model::NetBatch {
                inserts: vec![crate::model::LikeRecord::new(1, 100)],
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(f.gateway.has_liked(1, 100).await.unwrap());
    }

    #[tokio::test]
    async fn expired_marker_reads_false_and_is_evicted() {
        let f = fixture(None);
        // Plant a marker that expired long ago
        f.markers.restore_marker(1, 100, 1).await.unwrap();

        assert!(!f.gateway.has_liked(1, 100).await.unwrap());

        // Eviction is asynchronous; poll for the field to disappear
        for _ in 0..50 {
            if f.markers.marker(1, 100).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.markers.marker(1, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn has_liked_many_mixes_cache_and_store() {
        let f = fixture(None);
        // 100: live marker; 200: expired marker; 300: store only; 400: nothing
        f.markers.restore_marker(1, 100, i64::MAX).await.unwrap();
        f.markers.restore_marker(1, 200, 1).await.unwrap();
        f.store
            .apply(&crate::model::NetBatch {
                inserts: vec![crate::model::LikeRecord::new(1, 300)],
                ..Default::default()
            })
            .await
            .unwrap();

        let results = f
            .gateway
            .has_liked_many(1, &[100, 200, 300, 400])
            .await
            .unwrap();
        assert_eq!(results, vec![true, false, true, false]);
    }

    #[tokio::test]
    async fn mirror_caches_confirmed_negative() {
        let mirror = Arc::new(MirrorCache::new(64));
        let f = fixture(Some(Arc::clone(&mirror)));

        assert!(!f.gateway.has_liked(1, 100).await.unwrap());
        assert_eq!(mirror.status(1, 100, now_millis()), LikeStatus::NotLiked);

        // Second read is answered locally even if the marker store would now
        // say otherwise
        f.markers.restore_marker(1, 100, i64::MAX).await.unwrap();
        assert!(!f.gateway.has_liked(1, 100).await.unwrap());
    }

    #[tokio::test]
    async fn mirror_write_through_on_toggle() {
        let mirror = Arc::new(MirrorCache::new(64));
        let f = fixture(Some(Arc::clone(&mirror)));
        let request = ToggleRequest::new(1, 100);

        f.gateway.like(&request).await.unwrap();
        assert_eq!(mirror.status(1, 100, now_millis()), LikeStatus::Liked);

        f.gateway.unlike(&request).await.unwrap();
        assert_eq!(mirror.status(1, 100, now_millis()), LikeStatus::NotLiked);
    }
}
