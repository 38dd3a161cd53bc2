//! Reconciliation job: the consistency backstop between cache and store.
//!
//! A publish that was never compensated, or an apply that died after its
//! retry budget, leaves a pair liked in the cache but absent from the
//! store. Each pass scans every user with markers, diffs the cached item
//! set against the stored one, and re-emits a compensating INCR event per
//! drifted pair through the ordinary pipeline. The consumer's idempotent
//! apply heals the store without any direct mutation from here.
//!
//! Per-user failures are isolated: one bad user is logged and the scan
//! moves on. The schedule interval bounds the maximum staleness window.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::emitter::EventEmitter;
use crate::model::{ToggleEvent, ToggleKind};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{LikeStore, MarkerStore, StorageError};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub users_scanned: usize,
    pub users_failed: usize,
    /// Compensating events successfully re-emitted.
    pub events_emitted: usize,
}

pub struct Reconciler {
    markers: Arc<dyn MarkerStore>,
    store: Arc<dyn LikeStore>,
    emitter: Arc<EventEmitter>,
}

impl Reconciler {
    pub fn new(
        markers: Arc<dyn MarkerStore>,
        store: Arc<dyn LikeStore>,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        Self {
            markers,
            store,
            emitter,
        }
    }

    /// Run one full pass over every user with cache markers.
    pub async fn run_once(&self) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::default();

        let users = match self.markers.marked_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "Reconciliation aborted: cannot enumerate marked users");
                return report;
            }
        };

        for user_id in users {
            match self.reconcile_user(user_id).await {
                Ok(emitted) => {
                    report.users_scanned += 1;
                    report.events_emitted += emitted;
                }
                Err(e) => {
                    report.users_failed += 1;
                    warn!(user_id, error = %e, "Reconciliation failed for user, continuing scan");
                }
            }
        }

        let elapsed = started.elapsed();
        crate::metrics::record_reconcile(report.users_scanned, report.events_emitted, elapsed);
        info!(
            users_scanned = report.users_scanned,
            users_failed = report.users_failed,
            events_emitted = report.events_emitted,
            elapsed_ms = elapsed.as_millis() as u64,
            "Reconciliation pass complete"
        );
        report
    }

    /// Diff one user's cached markers against the store and emit a
    /// compensating INCR per (cache-has, store-lacks) pair.
    async fn reconcile_user(&self, user_id: i64) -> Result<usize, StorageError> {
        let cached: HashSet<i64> = retry("reconcile_marked_items", &RetryConfig::query(), || {
            self.markers.marked_items(user_id)
        })
        .await?
        .into_iter()
        .collect();

        if cached.is_empty() {
            return Ok(0);
        }

        let stored: HashSet<i64> = retry("reconcile_liked_items", &RetryConfig::query(), || {
            self.store.liked_items(user_id)
        })
        .await?
        .into_iter()
        .collect();

        let mut emitted = 0;
        for item_id in cached.difference(&stored) {
            let event = ToggleEvent::new(user_id, *item_id, ToggleKind::Incr);
            match self.emitter.publish(&event).await {
                Ok(()) => emitted += 1,
                Err(e) => {
                    // Leave it for the next pass rather than failing the user
                    warn!(
                        user_id,
                        item_id = *item_id,
                        error = %e,
                        "Compensation event publish failed"
                    );
                }
            }
        }

        Ok(emitted)
    }
}
