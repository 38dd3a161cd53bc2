// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! [`LikeEngine`] owns the components and their lifecycle:
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown
//! ```
//!
//! `start()` builds the backends from configuration (Redis/SQL when URLs
//! are set, in-memory otherwise), wires the gateway → emitter → broker →
//! consumer pipeline, and spawns the background tasks (batch consumer,
//! dead-letter drain, lazy eviction). `run()` drives the reconciliation
//! schedule until `shutdown()`.
//!
//! # Example
//!
//! ```rust,no_run
//! use like_engine::{LikeEngine, LikeEngineConfig, ToggleRequest};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = LikeEngine::new(LikeEngineConfig::default());
//! engine.start().await?;
//!
//! let gateway = engine.gateway().expect("started");
//! gateway.like(&ToggleRequest::new(1, 100)).await?;
//! assert!(gateway.has_liked(1, 100).await?);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::{BrokerError, EventBroker, InMemoryBroker, SubscribeOptions};
use crate::config::LikeEngineConfig;
use crate::consumer::BatchConsumer;
use crate::emitter::EventEmitter;
use crate::eviction::EvictionQueue;
use crate::gateway::ToggleGateway;
use crate::mirror::MirrorCache;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::storage::memory::{InMemoryLikeStore, InMemoryMarkerStore};
use crate::storage::redis::RedisMarkerStore;
use crate::storage::sql::SqlLikeStore;
use crate::storage::traits::{LikeStore, MarkerStore, StorageError};

/// Engine lifecycle state, broadcast to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Connecting,
    Ready,
    Running,
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("Engine not started")]
    NotStarted,
}

pub struct LikeEngine {
    config: LikeEngineConfig,

    state: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    broker: Arc<dyn EventBroker>,
    markers: Option<Arc<dyn MarkerStore>>,
    store: Option<Arc<dyn LikeStore>>,
    gateway: Option<Arc<ToggleGateway>>,
    reconciler: Option<Arc<Reconciler>>,

    /// Consumer and dead-letter drain; exit via the shutdown signal
    tasks: Vec<JoinHandle<()>>,
    /// Eviction drainer; aborted on shutdown (its queue lives in the gateway)
    eviction_task: Option<JoinHandle<()>>,
}

impl LikeEngine {
    /// Create an engine with an in-process broker. Call
    /// [`start()`](Self::start) to connect backends.
    #[must_use]
    pub fn new(config: LikeEngineConfig) -> Self {
        Self::with_broker(config, Arc::new(InMemoryBroker::new()))
    }

    /// Create an engine bound to an external broker adapter.
    #[must_use]
    pub fn with_broker(config: LikeEngineConfig, broker: Arc<dyn EventBroker>) -> Self {
        let (state, state_rx) = watch::channel(EngineState::Created);
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            config,
            state,
            state_rx,
            shutdown,
            shutdown_rx,
            broker,
            markers: None,
            store: None,
            gateway: None,
            reconciler: None,
            tasks: Vec::new(),
            eviction_task: None,
        }
    }

    /// Inject storage backends (tests, exotic deployments). Overrides the
    /// URL-based selection in `start()`.
    pub fn with_backends(
        config: LikeEngineConfig,
        markers: Arc<dyn MarkerStore>,
        store: Arc<dyn LikeStore>,
        broker: Arc<dyn EventBroker>,
    ) -> Self {
        let mut engine = Self::with_broker(config, broker);
        engine.markers = Some(markers);
        engine.store = Some(store);
        engine
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// The toggle gateway, available once `start()` has succeeded.
    #[must_use]
    pub fn gateway(&self) -> Option<Arc<ToggleGateway>> {
        self.gateway.clone()
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            nack_backoff: Duration::from_millis(self.config.nack_backoff_ms),
            nack_backoff_max: Duration::from_millis(self.config.nack_backoff_max_ms),
            ack_timeout: Duration::from_millis(self.config.ack_timeout_ms),
            ack_timeout_backoff: Duration::from_millis(self.config.ack_timeout_backoff_ms),
            max_redeliveries: self.config.max_redeliveries,
            dead_letter_topic: Some(self.config.dead_letter_topic.clone()),
        }
    }

    /// Connect backends and spawn the pipeline tasks.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        info!("Starting like engine");
        let _ = self.state.send(EngineState::Connecting);

        let markers: Arc<dyn MarkerStore> = match self.markers.take() {
            Some(injected) => injected,
            None => match &self.config.redis_url {
                Some(url) => {
                    let store = RedisMarkerStore::new(url).await?;
                    info!("Connected Redis marker store");
                    Arc::new(store)
                }
                None => {
                    info!("No redis_url configured, using in-memory marker store");
                    Arc::new(InMemoryMarkerStore::new())
                }
            },
        };

        let store: Arc<dyn LikeStore> = match self.store.take() {
            Some(injected) => injected,
            None => match &self.config.sql_url {
                Some(url) => {
                    let store = SqlLikeStore::new(url, self.config.insert_chunk_size).await?;
                    info!("Connected SQL like store");
                    Arc::new(store)
                }
                None => {
                    info!("No sql_url configured, using in-memory like store");
                    Arc::new(InMemoryLikeStore::new())
                }
            },
        };

        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(&self.broker),
            Arc::clone(&markers),
            self.config.topic.clone(),
        ));

        let (evictions, eviction_task) =
            EvictionQueue::spawn(Arc::clone(&markers), self.config.eviction_queue_depth);
        self.eviction_task = Some(eviction_task);

        let mirror = self
            .config
            .mirror_enabled
            .then(|| Arc::new(MirrorCache::new(self.config.mirror_max_entries)));

        self.gateway = Some(Arc::new(ToggleGateway::new(
            Arc::clone(&markers),
            Arc::clone(&store),
            Arc::clone(&emitter),
            evictions,
            mirror,
            self.config.marker_ttl_millis(),
        )));

        // Batch consumer on the shared apply subscription
        let subscription = self
            .broker
            .subscribe(
                &self.config.topic,
                &self.config.subscription,
                self.subscribe_options(),
            )
            .await?;
        let consumer = BatchConsumer::new(
            Arc::clone(&store),
            subscription,
            self.config.consumer_batch_size,
            Duration::from_millis(self.config.consumer_poll_ms),
        );
        self.tasks.push(tokio::spawn(consumer.run(self.shutdown_rx.clone())));

        self.spawn_dead_letter_drain().await?;

        self.reconciler = Some(Arc::new(Reconciler::new(
            Arc::clone(&markers),
            Arc::clone(&store),
            emitter,
        )));

        self.markers = Some(markers);
        self.store = Some(store);

        let _ = self.state.send(EngineState::Ready);
        info!("Like engine ready");
        Ok(())
    }

    /// Dead-lettered events are surfaced to logs for out-of-band handling;
    /// they are never auto-retried.
    async fn spawn_dead_letter_drain(&mut self) -> Result<(), EngineError> {
        let mut subscription = self
            .broker
            .subscribe(
                &self.config.dead_letter_topic,
                "dead-letter-drain",
                SubscribeOptions {
                    dead_letter_topic: None,
                    ..SubscribeOptions::default()
                },
            )
            .await?;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let poll = Duration::from_millis(self.config.consumer_poll_ms);

        self.tasks.push(tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    batch = subscription.next_batch(64, poll) => {
                        match batch {
                            Ok(deliveries) if deliveries.is_empty() => {}
                            Ok(deliveries) => {
                                crate::metrics::record_dead_letters(deliveries.len());
                                for delivery in &deliveries {
                                    error!(
                                        message_id = delivery.message_id,
                                        user_id = delivery.event.user_id,
                                        item_id = delivery.event.item_id,
                                        kind = ?delivery.event.kind,
                                        "Dead-lettered toggle event requires operator attention"
                                    );
                                }
                                if let Err(e) = subscription.ack(&deliveries).await {
                                    error!(error = %e, "Failed to ack dead-letter batch");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Dead-letter poll failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    /// Drive the reconciliation schedule until shutdown. The first pass
    /// runs one full interval after this call.
    pub async fn run(&self) {
        let _ = self.state.send(EngineState::Running);
        info!(
            interval_secs = self.config.reconcile_interval_secs,
            "Like engine running"
        );

        let period = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        let mut reconcile_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = reconcile_interval.tick() => {
                    if let Some(reconciler) = &self.reconciler {
                        reconciler.run_once().await;
                    }
                }
            }
        }
    }

    /// Run a reconciliation pass immediately (operational tooling, tests).
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, EngineError> {
        let reconciler = self.reconciler.as_ref().ok_or(EngineError::NotStarted)?;
        Ok(reconciler.run_once().await)
    }

    /// Signal shutdown and wait for the pipeline tasks to stop.
    pub async fn shutdown(&mut self) {
        info!("Shutting down like engine");
        let _ = self.state.send(EngineState::ShuttingDown);
        let _ = self.shutdown.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Pipeline task ended abnormally");
            }
        }
        // The eviction drainer blocks on its queue (held by the gateway);
        // stop it directly
        if let Some(task) = self.eviction_task.take() {
            task.abort();
        }
        info!("Like engine shutdown complete");
    }
}
