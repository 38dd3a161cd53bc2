// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch consumer: folds toggle events into net effects and applies them.
//!
//! Each delivered batch is processed as one transactional unit:
//!
//! 1. Group events by (user, item).
//! 2. Sort each group by event time; an even-sized group cancels out
//!    entirely, an odd-sized group nets to its last event. This parity rule
//!    holds because the gateway's guard makes toggles strictly alternate
//!    per key.
//! 3. Fold the surviving groups into a [`NetBatch`]: per-item counter
//!    deltas, record inserts, record removals.
//! 4. Apply the whole batch in one store transaction, then ack. On failure
//!    the transaction rolls back and the batch is nacked; the broker's
//!    backoff policy redelivers it, and exhausted messages route to the
//!    dead-letter topic.
//!
//! The fold itself is a pure function, [`net_effects`], tested in isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::broker::{Delivery, EventSubscription};
use crate::model::{LikeKey, LikeRecord, NetBatch, ToggleEvent, ToggleKind};
use crate::storage::traits::LikeStore;

/// Compute the net durable effect of a multiset of toggle events.
///
/// Even-sized groups are discarded; odd-sized groups contribute exactly the
/// chronologically last event's effect. Insert and removal lists come out
/// sorted so the generated SQL is deterministic.
#[must_use]
pub fn net_effects(events: &[ToggleEvent]) -> NetBatch {
    let mut groups: HashMap<LikeKey, Vec<&ToggleEvent>> = HashMap::new();
    for event in events {
        groups.entry(event.key()).or_default().push(event);
    }

    let mut batch = NetBatch::default();
    for (key, mut group) in groups {
        // Stable sort: events with equal timestamps keep arrival order
        group.sort_by_key(|e| e.event_time);
        if group.len() % 2 == 0 {
            continue;
        }
        let Some(last) = group.last() else { continue };
        match last.kind {
            ToggleKind::Incr => {
                *batch.counter_deltas.entry(key.item_id).or_insert(0) += 1;
                batch.inserts.push(LikeRecord::new(key.user_id, key.item_id));
            }
            ToggleKind::Decr => {
                *batch.counter_deltas.entry(key.item_id).or_insert(0) -= 1;
                batch.removals.push(key);
            }
        }
    }

    batch.inserts.sort_by_key(|r| (r.user_id, r.item_id));
    batch.removals.sort_unstable();
    batch
}

/// Consumes toggle-event batches from a shared subscription and applies
/// their net effect to the durable store.
pub struct BatchConsumer {
    store: Arc<dyn LikeStore>,
    subscription: Box<dyn EventSubscription>,
    batch_size: usize,
    poll: Duration,
}

impl BatchConsumer {
    pub fn new(
        store: Arc<dyn LikeStore>,
        subscription: Box<dyn EventSubscription>,
        batch_size: usize,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            subscription,
            batch_size: batch_size.max(1),
            poll,
        }
    }

    /// Consume until the shutdown signal flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.batch_size, "Batch consumer running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                batch = self.subscription.next_batch(self.batch_size, self.poll) => {
                    match batch {
                        Ok(deliveries) if deliveries.is_empty() => {}
                        Ok(deliveries) => self.process(deliveries).await,
                        Err(e) => {
                            error!(error = %e, "Subscription poll failed, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        info!("Batch consumer stopped");
    }

    /// Process one delivered batch as a transactional unit.
    async fn process(&mut self, deliveries: Vec<Delivery>) {
        let batch_id = uuid::Uuid::new_v4();
        crate::metrics::record_consumer_batch(deliveries.len());

        let events: Vec<ToggleEvent> =
            deliveries.iter().map(|d| d.event.clone()).collect();
        let net = net_effects(&events);

        if net.is_empty() {
            // All groups cancelled out; nothing to persist
            debug!(batch_id = %batch_id, events = events.len(), "Batch nets to zero, acking");
            self.finish(&deliveries, true).await;
            return;
        }

        let started = Instant::now();
        match self.store.apply(&net).await {
            Ok(()) => {
                crate::metrics::record_apply("success", started.elapsed());
                debug!(
                    batch_id = %batch_id,
                    events = events.len(),
                    items_touched = net.counter_deltas.len(),
                    inserts = net.inserts.len(),
                    removals = net.removals.len(),
                    "Batch applied"
                );
                self.finish(&deliveries, true).await;
            }
            Err(e) => {
                crate::metrics::record_apply("error", started.elapsed());
                error!(
                    batch_id = %batch_id,
                    events = events.len(),
                    error = %e,
                    "Batch apply failed, nacking for redelivery"
                );
                self.finish(&deliveries, false).await;
            }
        }
    }

    async fn finish(&mut self, deliveries: &[Delivery], success: bool) {
        let result = if success {
            self.subscription.ack(deliveries).await
        } else {
            self.subscription.nack(deliveries).await
        };
        if let Err(e) = result {
            // The broker's ack-timeout policy recovers these deliveries
            error!(error = %e, "Failed to settle batch with broker");
        }
    }
}
