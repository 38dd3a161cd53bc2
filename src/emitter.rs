//! Event emitter: publishes toggle events after a successful cache mutation.
//!
//! Publication is at-least-once and best-effort. The caller has already
//! received a definitive answer from the cache mutation, so a publish
//! failure never surfaces to them; instead the emitter compensates the
//! cache (deleting the marker for a failed like-publish, restoring it for
//! a failed unlike-publish) so the cache never advertises a state the
//! event stream will not propagate. A crash between cache commit and
//! publish leaves a true gap, which the reconciliation job closes.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::broker::{BrokerError, EventBroker};
use crate::model::{ToggleEvent, ToggleKind};
use crate::storage::traits::MarkerStore;

pub struct EventEmitter {
    broker: Arc<dyn EventBroker>,
    markers: Arc<dyn MarkerStore>,
    topic: String,
}

impl EventEmitter {
    pub fn new(broker: Arc<dyn EventBroker>, markers: Arc<dyn MarkerStore>, topic: String) -> Self {
        Self {
            broker,
            markers,
            topic,
        }
    }

    /// Publish on a spawned task; the caller does not wait.
    ///
    /// `marker_expiry` is the expiry hint to restore should an
    /// unlike-publish fail (the original hint was lost with the marker; the
    /// restored one is freshly computed by the gateway).
    pub fn emit(self: &Arc<Self>, event: ToggleEvent, marker_expiry: i64) -> JoinHandle<()> {
        let emitter = Arc::clone(self);
        tokio::spawn(async move {
            match emitter.publish(&event).await {
                Ok(()) => crate::metrics::record_publish("success"),
                Err(e) => {
                    crate::metrics::record_publish("error");
                    error!(
                        user_id = event.user_id,
                        item_id = event.item_id,
                        kind = ?event.kind,
                        error = %e,
                        "Toggle event publish failed, compensating cache"
                    );
                    emitter.compensate(&event, marker_expiry).await;
                }
            }
        })
    }

    /// Awaited publish, used directly by the reconciliation job's
    /// compensation events.
    pub async fn publish(&self, event: &ToggleEvent) -> Result<(), BrokerError> {
        self.broker
            .publish(&self.topic, &event.key().routing_key(), event)
            .await
    }

    /// Revert the cache mutation whose event never made it out.
    async fn compensate(&self, event: &ToggleEvent, marker_expiry: i64) {
        let result = match event.kind {
            ToggleKind::Incr => {
                self.markers
                    .remove_marker(event.user_id, event.item_id)
                    .await
            }
            ToggleKind::Decr => {
                self.markers
                    .restore_marker(event.user_id, event.item_id, marker_expiry)
                    .await
            }
        };
        if let Err(e) = result {
            // Cache and store now disagree; the reconciliation job heals it
            error!(
                user_id = event.user_id,
                item_id = event.item_id,
                error = %e,
                "Cache compensation failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::storage::memory::InMemoryMarkerStore;
    use crate::storage::traits::{MarkerStore, ToggleOutcome};
    use async_trait::async_trait;

    /// Broker double whose publishes always fail.
    struct DeadBroker;

    #[async_trait]
    impl EventBroker for DeadBroker {
        async fn publish(
            &self,
            _topic: &str,
            _routing_key: &str,
            _event: &ToggleEvent,
        ) -> Result<(), BrokerError> {
            Err(BrokerError::Publish("broker unavailable".into()))
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _subscription: &str,
            _options: crate::broker::SubscribeOptions,
        ) -> Result<Box<dyn crate::broker::EventSubscription>, BrokerError> {
            Err(BrokerError::Subscribe("broker unavailable".into()))
        }
    }

    #[tokio::test]
    async fn successful_publish_leaves_marker_alone() {
        let broker = Arc::new(InMemoryBroker::new());
        let markers = Arc::new(InMemoryMarkerStore::new());
        markers.toggle_like(1, 100, i64::MAX).await.unwrap();

        let emitter = Arc::new(EventEmitter::new(
            broker,
            Arc::clone(&markers) as Arc<dyn MarkerStore>,
            "t".into(),
        ));
        emitter
            .emit(ToggleEvent::new(1, 100, ToggleKind::Incr), i64::MAX)
            .await
            .unwrap();

        assert!(markers.marker(1, 100).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_like_publish_removes_marker() {
        let markers = Arc::new(InMemoryMarkerStore::new());
        markers.toggle_like(1, 100, i64::MAX).await.unwrap();
        assert_eq!(
            markers.toggle_like(1, 100, i64::MAX).await.unwrap(),
            ToggleOutcome::AlreadyInState
        );

        let emitter = Arc::new(EventEmitter::new(
            Arc::new(DeadBroker),
            Arc::clone(&markers) as Arc<dyn MarkerStore>,
            "t".into(),
        ));
        emitter
            .emit(ToggleEvent::new(1, 100, ToggleKind::Incr), i64::MAX)
            .await
            .unwrap();

        // Compensation rolled the like back; the pair can be liked again
        assert!(markers.marker(1, 100).await.unwrap().is_none());
        assert_eq!(
            markers.toggle_like(1, 100, i64::MAX).await.unwrap(),
            ToggleOutcome::Applied
        );
    }

    #[tokio::test]
    async fn failed_unlike_publish_restores_marker() {
        let markers = Arc::new(InMemoryMarkerStore::new());
        markers.toggle_like(1, 100, 7_777).await.unwrap();
        markers.toggle_unlike(1, 100).await.unwrap();
        assert!(markers.marker(1, 100).await.unwrap().is_none());

        let emitter = Arc::new(EventEmitter::new(
            Arc::new(DeadBroker),
            Arc::clone(&markers) as Arc<dyn MarkerStore>,
            "t".into(),
        ));
        emitter
            .emit(ToggleEvent::new(1, 100, ToggleKind::Decr), 8_888)
            .await
            .unwrap();

        assert_eq!(markers.marker(1, 100).await.unwrap(), Some(8_888));
    }
}
