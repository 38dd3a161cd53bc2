//! Lazy marker eviction.
//!
//! `has_liked` detects expired markers on read but must not block on their
//! removal. Eviction hints go into a bounded queue drained by one background
//! task; when the queue is full the hint is dropped. Eviction is best-effort
//! by contract: correctness rests on the expiry comparison at read time, not
//! on the stale field ever disappearing.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::LikeKey;
use crate::storage::traits::MarkerStore;

#[derive(Clone)]
pub struct EvictionQueue {
    tx: mpsc::Sender<LikeKey>,
}

impl EvictionQueue {
    /// Spawn the drainer task; the returned handle stops when every queue
    /// clone is dropped.
    pub fn spawn(markers: Arc<dyn MarkerStore>, depth: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<LikeKey>(depth.max(1));
        let handle = tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                match markers.remove_marker(key.user_id, key.item_id).await {
                    Ok(()) => crate::metrics::record_eviction("evicted"),
                    Err(e) => {
                        crate::metrics::record_eviction("error");
                        debug!(
                            user_id = key.user_id,
                            item_id = key.item_id,
                            error = %e,
                            "Lazy marker eviction failed"
                        );
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Queue an expired marker for removal. Never blocks; a full queue
    /// drops the hint.
    pub fn schedule(&self, user_id: i64, item_id: i64) {
        if self.tx.try_send(LikeKey::new(user_id, item_id)).is_err() {
            crate::metrics::record_eviction("dropped");
            debug!(user_id, item_id, "Eviction queue full, dropping hint");
        }
    }
}
