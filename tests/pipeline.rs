//! End-to-end pipeline tests over the in-memory backends.
//!
//! No external services required: the in-memory marker store, like store,
//! and broker exercise the same trait contracts as Redis/SQL/a real broker.
//!
//! # Test Organization
//! - `happy_*` - Normal operation: toggle flows, batch netting, reconciliation
//! - `failure_*` - Failure scenarios: publish loss, apply faults, dead-letters

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use like_engine::{
    BatchConsumer, BrokerError, EventBroker, EventEmitter, EventSubscription, InMemoryBroker,
    InMemoryLikeStore, InMemoryMarkerStore, LikeEngine, LikeEngineConfig, LikeStore, MarkerStore,
    SubscribeOptions, ToggleError, ToggleEvent, ToggleGateway, ToggleKind, ToggleRequest,
};

// =============================================================================
// Helpers
// =============================================================================

const TOPIC: &str = "like-toggles";
const SUBSCRIPTION: &str = "like-apply";
const DLQ: &str = "like-toggles-dlq";

fn fast_options() -> SubscribeOptions {
    SubscribeOptions {
        nack_backoff: Duration::from_millis(10),
        nack_backoff_max: Duration::from_millis(50),
        ack_timeout: Duration::from_secs(5),
        ack_timeout_backoff: Duration::from_millis(10),
        max_redeliveries: 3,
        dead_letter_topic: Some(DLQ.into()),
    }
}

fn fast_config() -> LikeEngineConfig {
    LikeEngineConfig {
        consumer_poll_ms: 10,
        nack_backoff_ms: 10,
        nack_backoff_max_ms: 50,
        ..Default::default()
    }
}

/// Spawn a consumer over an already-created subscription; returns the
/// shutdown trigger and the task handle.
fn spawn_consumer(
    store: Arc<dyn LikeStore>,
    subscription: Box<dyn EventSubscription>,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = BatchConsumer::new(store, subscription, 500, Duration::from_millis(10));
    let handle = tokio::spawn(consumer.run(shutdown_rx));
    (shutdown_tx, handle)
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

struct Pipeline {
    engine: LikeEngine,
    gateway: Arc<ToggleGateway>,
    markers: Arc<InMemoryMarkerStore>,
    store: Arc<InMemoryLikeStore>,
}

async fn started_pipeline() -> Pipeline {
    let markers = Arc::new(InMemoryMarkerStore::new());
    let store = Arc::new(InMemoryLikeStore::new());
    let mut engine = LikeEngine::with_backends(
        fast_config(),
        Arc::clone(&markers) as Arc<dyn MarkerStore>,
        Arc::clone(&store) as Arc<dyn LikeStore>,
        Arc::new(InMemoryBroker::new()),
    );
    engine.start().await.expect("engine start");
    let gateway = engine.gateway().expect("gateway after start");
    Pipeline {
        engine,
        gateway,
        markers,
        store,
    }
}

// =============================================================================
// Happy Path
// =============================================================================

/// Scenario A: like → SUCCESS (counter 0→1), like again → ALREADY_LIKED,
/// unlike → SUCCESS (counter →0), unlike again → NOT_LIKED.
#[tokio::test]
async fn happy_toggle_lifecycle_counts() {
    let mut p = started_pipeline().await;
    let request = ToggleRequest::new(1, 100);

    p.gateway.like(&request).await.unwrap();
    {
        let store = Arc::clone(&p.store);
        wait_for(move || {
            let store = Arc::clone(&store);
            async move { store.like_count(100).await.unwrap() == 1 }
        })
        .await;
    }
    assert!(p.store.has_like(1, 100).await.unwrap());

    assert!(matches!(
        p.gateway.like(&request).await,
        Err(ToggleError::AlreadyLiked)
    ));
    assert_eq!(p.store.like_count(100).await.unwrap(), 1);

    p.gateway.unlike(&request).await.unwrap();
    {
        let store = Arc::clone(&p.store);
        wait_for(move || {
            let store = Arc::clone(&store);
            async move { store.like_count(100).await.unwrap() == 0 }
        })
        .await;
    }
    assert!(!p.store.has_like(1, 100).await.unwrap());

    assert!(matches!(
        p.gateway.unlike(&request).await,
        Err(ToggleError::NotLiked)
    ));

    p.engine.shutdown().await;
}

/// Scenario B: a batch of INCR@t1, DECR@t2, INCR@t3 for one pair nets to
/// the last event: one +1 delta, one inserted record, no deletion.
#[tokio::test]
async fn happy_batch_nets_to_last_event() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryLikeStore::new());

    let subscription = broker
        .subscribe(TOPIC, SUBSCRIPTION, fast_options())
        .await
        .unwrap();

    // All three queued before the consumer starts: one delivered batch
    for (kind, t) in [
        (ToggleKind::Incr, 1),
        (ToggleKind::Decr, 2),
        (ToggleKind::Incr, 3),
    ] {
        let event = ToggleEvent {
            user_id: 2,
            item_id: 5,
            kind,
            event_time: t,
        };
        broker
            .publish(TOPIC, &event.key().routing_key(), &event)
            .await
            .unwrap();
    }

    let (shutdown, handle) =
        spawn_consumer(Arc::clone(&store) as Arc<dyn LikeStore>, subscription);

    {
        let store = Arc::clone(&store);
        wait_for(move || {
            let store = Arc::clone(&store);
            async move { store.has_like(2, 5).await.unwrap() }
        })
        .await;
    }
    assert_eq!(store.like_count(5).await.unwrap(), 1);
    assert_eq!(store.record_count(), 1);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

/// A like/unlike pair in one batch cancels: no record, counter untouched.
#[tokio::test]
async fn happy_even_batch_is_a_no_op() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryLikeStore::new());

    let subscription = broker
        .subscribe(TOPIC, SUBSCRIPTION, fast_options())
        .await
        .unwrap();

    for (kind, t) in [(ToggleKind::Incr, 1), (ToggleKind::Decr, 2)] {
        let event = ToggleEvent {
            user_id: 1,
            item_id: 100,
            kind,
            event_time: t,
        };
        broker
            .publish(TOPIC, &event.key().routing_key(), &event)
            .await
            .unwrap();
    }

    let (shutdown, handle) =
        spawn_consumer(Arc::clone(&store) as Arc<dyn LikeStore>, subscription);

    // Give the consumer ample time to (not) act
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.like_count(100).await.unwrap(), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

/// Uniqueness under concurrency: many racing likes, exactly one record.
#[tokio::test]
async fn happy_concurrent_likes_yield_one_record() {
    let mut p = started_pipeline().await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let gateway = Arc::clone(&p.gateway);
        handles.push(tokio::spawn(async move {
            gateway.like(&ToggleRequest::new(1, 100)).await.is_ok()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    {
        let store = Arc::clone(&p.store);
        wait_for(move || {
            let store = Arc::clone(&store);
            async move { store.has_like(1, 100).await.unwrap() }
        })
        .await;
    }
    assert_eq!(p.store.record_count(), 1);
    assert_eq!(p.store.like_count(100).await.unwrap(), 1);

    p.engine.shutdown().await;
}

/// Reconciliation convergence: arbitrary cache/store drift heals after one
/// pass plus consumer processing.
#[tokio::test]
async fn happy_reconciliation_heals_drift() {
    let mut p = started_pipeline().await;

    // Simulate lost publishes: markers exist with nothing durable behind them
    p.markers.restore_marker(1, 100, i64::MAX).await.unwrap();
    p.markers.restore_marker(1, 200, i64::MAX).await.unwrap();
    p.markers.restore_marker(2, 300, i64::MAX).await.unwrap();

    let report = p.engine.reconcile_now().await.unwrap();
    assert_eq!(report.users_scanned, 2);
    assert_eq!(report.events_emitted, 3);

    {
        let store = Arc::clone(&p.store);
        wait_for(move || {
            let store = Arc::clone(&store);
            async move {
                store.has_like(1, 100).await.unwrap()
                    && store.has_like(1, 200).await.unwrap()
                    && store.has_like(2, 300).await.unwrap()
            }
        })
        .await;
    }

    // Cache and store now agree for every scanned pair
    for (user_id, item_id) in [(1, 100), (1, 200), (2, 300)] {
        assert!(p.markers.marker(user_id, item_id).await.unwrap().is_some());
        assert!(p.store.has_like(user_id, item_id).await.unwrap());
    }

    // A second pass finds nothing left to repair
    let report = p.engine.reconcile_now().await.unwrap();
    assert_eq!(report.events_emitted, 0);

    p.engine.shutdown().await;
}

// =============================================================================
// Failure Scenarios
// =============================================================================

/// Broker double whose publishes always fail.
struct DeadBroker;

#[async_trait::async_trait]
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
        _options: SubscribeOptions,
    ) -> Result<Box<dyn EventSubscription>, BrokerError> {
        Err(BrokerError::Subscribe("broker unavailable".into()))
    }
}

/// A failed like-publish is invisible to the caller but compensated in the
/// cache, leaving the pair likeable again.
#[tokio::test]
async fn failure_publish_loss_compensates_cache() {
    let markers = Arc::new(InMemoryMarkerStore::new());
    let store = Arc::new(InMemoryLikeStore::new());
    let emitter = Arc::new(EventEmitter::new(
        Arc::new(DeadBroker),
        Arc::clone(&markers) as Arc<dyn MarkerStore>,
        TOPIC.into(),
    ));
    let (evictions, _eviction_task) = like_engine::EvictionQueue::spawn(
        Arc::clone(&markers) as Arc<dyn MarkerStore>,
        16,
    );
    let gateway = ToggleGateway::new(
        Arc::clone(&markers) as Arc<dyn MarkerStore>,
        Arc::clone(&store) as Arc<dyn LikeStore>,
        emitter,
        evictions,
        None,
        30 * 24 * 3600 * 1000,
    );

    // Caller sees success; the publish failure is handled behind their back
    gateway.like(&ToggleRequest::new(1, 100)).await.unwrap();

    {
        let markers = Arc::clone(&markers);
        wait_for(move || {
            let markers = Arc::clone(&markers);
            async move { markers.marker(1, 100).await.unwrap().is_none() }
        })
        .await;
    }

    // Marker rolled back: liking again succeeds instead of ALREADY_LIKED
    gateway.like(&ToggleRequest::new(1, 100)).await.unwrap();
}

/// Transient apply faults: the batch is nacked and redelivered until the
/// store recovers; exactly one record results.
#[tokio::test]
async fn failure_transient_apply_retries_until_success() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryLikeStore::new());
    store.fail_next_applies(2);

    let subscription = broker
        .subscribe(TOPIC, SUBSCRIPTION, fast_options())
        .await
        .unwrap();

    let event = ToggleEvent::new(1, 100, ToggleKind::Incr);
    broker
        .publish(TOPIC, &event.key().routing_key(), &event)
        .await
        .unwrap();

    let (shutdown, handle) =
        spawn_consumer(Arc::clone(&store) as Arc<dyn LikeStore>, subscription);

    {
        let store = Arc::clone(&store);
        wait_for(move || {
            let store = Arc::clone(&store);
            async move { store.has_like(1, 100).await.unwrap() }
        })
        .await;
    }
    assert_eq!(store.record_count(), 1);
    assert_eq!(store.like_count(100).await.unwrap(), 1);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

/// A batch that exhausts its retry budget routes to the dead-letter topic
/// and never partially commits.
#[tokio::test]
async fn failure_exhausted_retries_dead_letter() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryLikeStore::new());
    store.fail_next_applies(100);

    let options = SubscribeOptions {
        max_redeliveries: 1,
        ..fast_options()
    };
    let subscription = broker.subscribe(TOPIC, SUBSCRIPTION, options).await.unwrap();
    let mut dlq_subscription = broker
        .subscribe(DLQ, "operator", fast_options())
        .await
        .unwrap();

    let event = ToggleEvent::new(1, 100, ToggleKind::Incr);
    broker
        .publish(TOPIC, &event.key().routing_key(), &event)
        .await
        .unwrap();

    let (shutdown, handle) =
        spawn_consumer(Arc::clone(&store) as Arc<dyn LikeStore>, subscription);

    // The poisoned event surfaces on the dead-letter subscription
    let mut dead = Vec::new();
    for _ in 0..400 {
        dead = dlq_subscription
            .next_batch(10, Duration::from_millis(10))
            .await
            .unwrap();
        if !dead.is_empty() {
            break;
        }
    }
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].event.item_id, 100);

    // Nothing ever committed durably
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.like_count(100).await.unwrap(), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}
