// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message broker contract.
//!
//! The engine never talks to a broker's transport directly; it consumes this
//! publish / subscribe / ack contract. [`InMemoryBroker`] implements it
//! in-process for tests and single-node runs; a production deployment binds
//! an adapter over its broker of choice.
//!
//! # Ordering requirement
//!
//! The consumer's net-effect fold is only correct if all events for one
//! (user, item) pair are observed in publish order by a single logical
//! consumer pass. Publishers therefore pass a routing key
//! (`"{user_id}:{item_id}"`), and an implementation MUST NOT deliver a key's
//! message while an earlier message for the same key is unacknowledged or
//! awaiting redelivery. For Pulsar-style brokers this maps to a key-shared
//! subscription; [`InMemoryBroker`] enforces it directly.

pub mod memory;

pub use memory::InMemoryBroker;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::model::ToggleEvent;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Broker backend error: {0}")]
    Backend(String),
}

/// One delivered message. Acknowledge (or negatively acknowledge) through
/// the subscription it came from.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: u64,
    pub event: ToggleEvent,
    /// Redelivery count; 0 on first delivery.
    pub redeliveries: u32,
}

/// Redelivery and dead-letter policy for one subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Initial redelivery delay after a negative acknowledgement; doubles
    /// per redelivery up to `nack_backoff_max`.
    pub nack_backoff: Duration,
    pub nack_backoff_max: Duration,
    /// Deadline for acknowledging a delivery before it is considered
    /// abandoned (consumer crash mid-processing).
    pub ack_timeout: Duration,
    /// Redelivery delay after an ack timeout (separate from nack backoff).
    pub ack_timeout_backoff: Duration,
    /// Redeliveries after which a message routes to the dead-letter topic.
    pub max_redeliveries: u32,
    /// `None` drops exhausted messages instead of dead-lettering them.
    pub dead_letter_topic: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            nack_backoff: Duration::from_secs(1),
            nack_backoff_max: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(30),
            ack_timeout_backoff: Duration::from_secs(5),
            max_redeliveries: 3,
            dead_letter_topic: None,
        }
    }
}

#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Publish one event. `routing_key` must be identical for every event of
    /// a given (user, item) pair; ordering is only guaranteed per key.
    async fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        event: &ToggleEvent,
    ) -> Result<(), BrokerError>;

    /// Attach to a shared subscription. Handles attached to the same
    /// (topic, subscription) pair compete for messages.
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: SubscribeOptions,
    ) -> Result<Box<dyn EventSubscription>, BrokerError>;
}

#[async_trait]
pub trait EventSubscription: Send + Sync {
    /// Wait up to `wait` for messages; return between 1 and `max` of them,
    /// or an empty batch on timeout.
    async fn next_batch(&mut self, max: usize, wait: Duration)
        -> Result<Vec<Delivery>, BrokerError>;

    /// Acknowledge processed deliveries; they will not be redelivered.
    async fn ack(&mut self, deliveries: &[Delivery]) -> Result<(), BrokerError>;

    /// Negatively acknowledge deliveries for backoff redelivery (or
    /// dead-lettering once the retry budget is exhausted).
    async fn nack(&mut self, deliveries: &[Delivery]) -> Result<(), BrokerError>;
}
