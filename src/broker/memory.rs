//! In-process broker implementing the [`EventBroker`] contract.
//!
//! Topics fan out to named subscriptions; handles attached to the same
//! subscription compete for messages. Redelivery (nack backoff, ack
//! timeout) and dead-letter routing follow [`SubscribeOptions`].
//!
//! Delivery is key-ordered: a message is held back while an earlier message
//! for the same routing key is in flight or awaiting its redelivery delay,
//! so competing consumers can never observe one pair's events out of order.
//!
//! Messages published to a topic with no subscription are retained and
//! adopted by the first subscription created on that topic; later
//! subscriptions start from the present.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{BrokerError, Delivery, EventBroker, EventSubscription, SubscribeOptions};
use crate::model::ToggleEvent;

struct QueuedMessage {
    id: u64,
    key: String,
    event: ToggleEvent,
    redeliveries: u32,
    /// Earliest instant this message may be delivered (redelivery backoff).
    not_before: Instant,
}

struct InFlightMessage {
    key: String,
    event: ToggleEvent,
    redeliveries: u32,
    /// Past this instant the delivery counts as abandoned.
    deadline: Instant,
}

#[derive(Default)]
struct SubscriptionState {
    queue: Mutex<VecDeque<QueuedMessage>>,
    inflight: Mutex<HashMap<u64, InFlightMessage>>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerInner {
    /// topic → subscription name → shared state
    topics: DashMap<String, DashMap<String, Arc<SubscriptionState>>>,
    /// Retained messages for topics nobody subscribed to yet
    backlog: DashMap<String, VecDeque<(String, ToggleEvent)>>,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn enqueue(&self, topic: &str, key: &str, event: &ToggleEvent) {
        if let Some(subs) = self.topics.get(topic) {
            if !subs.is_empty() {
                for sub in subs.iter() {
                    let msg = QueuedMessage {
                        id: self.next_id.fetch_add(1, Ordering::SeqCst),
                        key: key.to_string(),
                        event: event.clone(),
                        redeliveries: 0,
                        not_before: Instant::now(),
                    };
                    sub.value().queue.lock().push_back(msg);
                    sub.value().notify.notify_waiters();
                }
                return;
            }
        }
        self.backlog
            .entry(topic.to_string())
            .or_default()
            .push_back((key.to_string(), event.clone()));
    }
}

/// Cheaply cloneable; clones share the same topics and subscriptions.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        event: &ToggleEvent,
    ) -> Result<(), BrokerError> {
        self.inner.enqueue(topic, routing_key, event);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: SubscribeOptions,
    ) -> Result<Box<dyn EventSubscription>, BrokerError> {
        let state = self
            .inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_insert_with(|| Arc::new(SubscriptionState::default()))
            .clone();

        // First subscription on the topic adopts the retained backlog
        if let Some((_, backlog)) = self.inner.backlog.remove(topic) {
            let mut queue = state.queue.lock();
            for (key, event) in backlog {
                queue.push_back(QueuedMessage {
                    id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
                    key,
                    event,
                    redeliveries: 0,
                    not_before: Instant::now(),
                });
            }
        }

        Ok(Box::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            state,
            options,
        }))
    }
}

pub struct InMemorySubscription {
    inner: Arc<BrokerInner>,
    state: Arc<SubscriptionState>,
    options: SubscribeOptions,
}

impl InMemorySubscription {
    /// Pop up to `max` deliverable messages, registering them in flight.
    ///
    /// A key is skipped while any earlier message for it is in flight or
    /// still waiting out its redelivery delay; everything behind a skipped
    /// key stays behind it, which is what preserves per-key order under
    /// competing consumers.
    fn try_take(&self, max: usize) -> Vec<Delivery> {
        if max == 0 {
            return Vec::new();
        }

        let mut queue = self.state.queue.lock();
        let mut inflight = self.state.inflight.lock();
        let now = Instant::now();

        let mut blocked: HashSet<String> =
            inflight.values().map(|m| m.key.clone()).collect();
        let mut taken = Vec::new();
        let mut rest = VecDeque::with_capacity(queue.len());

        while let Some(msg) = queue.pop_front() {
            let deliverable =
                taken.len() < max && msg.not_before <= now && !blocked.contains(&msg.key);
            if deliverable {
                inflight.insert(
                    msg.id,
                    InFlightMessage {
                        key: msg.key.clone(),
                        event: msg.event.clone(),
                        redeliveries: msg.redeliveries,
                        deadline: now + self.options.ack_timeout,
                    },
                );
                taken.push(Delivery {
                    message_id: msg.id,
                    event: msg.event,
                    redeliveries: msg.redeliveries,
                });
            } else {
                blocked.insert(msg.key.clone());
                rest.push_back(msg);
            }
        }

        *queue = rest;
        taken
    }

    /// Pull abandoned deliveries (past their ack deadline) back into the
    /// queue under the ack-timeout backoff policy.
    fn requeue_timed_out(&self) {
        let now = Instant::now();
        let mut expired: Vec<u64> = self
            .state
            .inflight
            .lock()
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable();
        debug!(count = expired.len(), "Redelivering deliveries past ack deadline");
        self.requeue(&expired, false);
    }

    /// Requeue (or dead-letter) in-flight messages by id.
    ///
    /// Lock order matters: the in-flight map is released before the queue is
    /// touched, mirroring `try_take`'s queue-then-inflight order.
    fn requeue(&self, ids: &[u64], is_nack: bool) {
        let mut removed = Vec::with_capacity(ids.len());
        {
            let mut inflight = self.state.inflight.lock();
            for id in ids {
                if let Some(msg) = inflight.remove(id) {
                    removed.push((*id, msg));
                }
            }
        }

        let mut requeued = Vec::new();
        for (id, msg) in removed {
            let redeliveries = msg.redeliveries + 1;
            if redeliveries > self.options.max_redeliveries {
                match &self.options.dead_letter_topic {
                    Some(dlq) => {
                        warn!(
                            message_id = id,
                            key = %msg.key,
                            redeliveries = msg.redeliveries,
                            dead_letter_topic = %dlq,
                            "Message exhausted redeliveries, dead-lettering"
                        );
                        self.inner.enqueue(dlq, &msg.key, &msg.event);
                    }
                    None => {
                        warn!(
                            message_id = id,
                            key = %msg.key,
                            redeliveries = msg.redeliveries,
                            "Message exhausted redeliveries, dropping (no dead-letter topic)"
                        );
                    }
                }
                continue;
            }

            let backoff = if is_nack {
                let doublings = i32::try_from(redeliveries.saturating_sub(1).min(32)).unwrap_or(32);
                std::cmp::min(
                    self.options.nack_backoff.mul_f64(f64::powi(2.0, doublings)),
                    self.options.nack_backoff_max,
                )
            } else {
                self.options.ack_timeout_backoff
            };

            requeued.push(QueuedMessage {
                id,
                key: msg.key,
                event: msg.event,
                redeliveries,
                not_before: Instant::now() + backoff,
            });
        }

        if !requeued.is_empty() {
            let mut queue = self.state.queue.lock();
            // Front-push in reverse keeps the requeued messages in their
            // original relative order, ahead of anything newer for the key
            for msg in requeued.into_iter().rev() {
                queue.push_front(msg);
            }
        }
        self.state.notify.notify_waiters();
    }
}

#[async_trait]
impl EventSubscription for InMemorySubscription {
    async fn next_batch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            self.requeue_timed_out();
            let batch = self.try_take(max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Short nap bounds the wait for redelivery due-times; the notify
            // cuts latency for fresh publishes
            let nap = std::cmp::min(deadline - now, Duration::from_millis(5));
            tokio::select! {
                () = self.state.notify.notified() => {}
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&mut self, deliveries: &[Delivery]) -> Result<(), BrokerError> {
        {
            let mut inflight = self.state.inflight.lock();
            for delivery in deliveries {
                inflight.remove(&delivery.message_id);
            }
        }
        // Acked keys are no longer blocked; wake competing consumers
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, deliveries: &[Delivery]) -> Result<(), BrokerError> {
        let ids: Vec<u64> = deliveries.iter().map(|d| d.message_id).collect();
        self.requeue(&ids, true);
        Ok(())
    }
}
