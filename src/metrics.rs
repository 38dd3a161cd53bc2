// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for like-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The parent process is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `like_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: like, unlike, has_liked
//! - `status`: success, already_liked, not_liked, rejected, error

use metrics::{counter, histogram};
use std::time::Duration;

/// Record a gateway toggle operation outcome
pub fn record_toggle(operation: &str, status: &str) {
    counter!(
        "like_engine_toggles_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a toggle event publish outcome
pub fn record_publish(status: &str) {
    counter!(
        "like_engine_publishes_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record the size of a consumed batch
pub fn record_consumer_batch(count: usize) {
    histogram!("like_engine_consumer_batch_size").record(count as f64);
}

/// Record a durable apply attempt
pub fn record_apply(status: &str, duration: Duration) {
    counter!(
        "like_engine_applies_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "like_engine_apply_seconds",
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record dead-lettered events observed by the drain task
pub fn record_dead_letters(count: usize) {
    counter!("like_engine_dead_letters_total").increment(count as u64);
}

/// Record a completed reconciliation pass
pub fn record_reconcile(users_scanned: usize, events_emitted: usize, duration: Duration) {
    counter!("like_engine_reconcile_passes_total").increment(1);
    counter!("like_engine_reconcile_repairs_total").increment(events_emitted as u64);
    histogram!("like_engine_reconcile_seconds").record(duration.as_secs_f64());
    histogram!("like_engine_reconcile_users").record(users_scanned as f64);
}

/// Record a lazy marker eviction outcome
pub fn record_eviction(status: &str) {
    counter!(
        "like_engine_evictions_total",
        "status" => status.to_string()
    )
    .increment(1);
}
