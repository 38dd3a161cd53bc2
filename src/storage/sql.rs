// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL like store: the durable ground truth.
//!
//! Two tables, mutated only through [`apply`](crate::storage::traits::LikeStore::apply):
//!
//! ```sql
//! CREATE TABLE like_records (
//!   user_id    BIGINT NOT NULL,
//!   item_id    BIGINT NOT NULL,
//!   created_at BIGINT NOT NULL,   -- epoch millis
//!   PRIMARY KEY (user_id, item_id)
//! );
//! CREATE TABLE item_counters (
//!   item_id    BIGINT NOT NULL PRIMARY KEY,
//!   like_count BIGINT NOT NULL DEFAULT 0
//! );
//! ```
//!
//! The composite primary key enforces the at-most-one-record invariant;
//! inserts are existence-tolerant (`INSERT IGNORE` / `ON CONFLICT DO
//! NOTHING` family) so re-applying a delivered batch cannot duplicate rows.
//!
//! ## sqlx `Any` driver notes
//!
//! The `Any` driver spans MySQL and SQLite from one code path; the few
//! dialect differences (upsert syntax, WAL pragmas) branch on `is_sqlite`.

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{LikeStore, StorageError};
use crate::model::{LikeKey, LikeRecord, NetBatch};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlLikeStore {
    pool: AnyPool,
    is_sqlite: bool,
    insert_chunk: usize,
}

impl SqlLikeStore {
    /// Connect with startup-mode retry and initialize the schema.
    ///
    /// `insert_chunk` bounds the rows per insert statement (MySQL packet
    /// limits); 500 is the conventional value.
    pub async fn new(connection_string: &str, insert_chunk: usize) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        // An in-memory SQLite database exists per connection; more than one
        // pooled connection would each see their own empty database.
        let max_connections = if connection_string.contains(":memory:") { 1 } else { 20 };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            insert_chunk: insert_chunk.max(1),
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// WAL mode: concurrent reads during writes, single fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {e}")))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {e}")))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS like_records (
                user_id    BIGINT NOT NULL,
                item_id    BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                PRIMARY KEY (user_id, item_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS item_counters (
                item_id    BIGINT NOT NULL PRIMARY KEY,
                like_count BIGINT NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    /// One batched upsert applying every item's signed delta.
    async fn apply_counter_deltas(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Any>,
        deltas: &std::collections::HashMap<i64, i64>,
    ) -> Result<(), StorageError> {
        if deltas.is_empty() {
            return Ok(());
        }

        // Sorted for a deterministic statement (and stable lock order)
        let mut entries: Vec<(i64, i64)> = deltas.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_unstable();

        let placeholders: Vec<&str> = entries.iter().map(|_| "(?, ?)").collect();
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO item_counters (item_id, like_count) VALUES {} \
                 ON CONFLICT(item_id) DO UPDATE SET like_count = like_count + excluded.like_count",
                placeholders.join(", ")
            )
        } else {
            format!(
                "INSERT INTO item_counters (item_id, like_count) VALUES {} \
                 ON DUPLICATE KEY UPDATE like_count = like_count + VALUES(like_count)",
                placeholders.join(", ")
            )
        };

        let mut query = sqlx::query(&sql);
        for (item_id, delta) in &entries {
            query = query.bind(item_id).bind(delta);
        }
        query
            .execute(&mut **tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    /// One batched delete over the combined (user, item) predicate.
    async fn apply_removals(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Any>,
        removals: &[LikeKey],
    ) -> Result<(), StorageError> {
        if removals.is_empty() {
            return Ok(());
        }

        let predicates: Vec<&str> = removals
            .iter()
            .map(|_| "(user_id = ? AND item_id = ?)")
            .collect();
        let sql = format!(
            "DELETE FROM like_records WHERE {}",
            predicates.join(" OR ")
        );

        let mut query = sqlx::query(&sql);
        for key in removals {
            query = query.bind(key.user_id).bind(key.item_id);
        }
        query
            .execute(&mut **tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    /// Chunked existence-tolerant inserts.
    async fn apply_inserts(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Any>,
        inserts: &[LikeRecord],
    ) -> Result<(), StorageError> {
        for chunk in inserts.chunks(self.insert_chunk) {
            let placeholders: Vec<&str> = chunk.iter().map(|_| "(?, ?, ?)").collect();
            let sql = if self.is_sqlite {
                format!(
                    "INSERT OR IGNORE INTO like_records (user_id, item_id, created_at) VALUES {}",
                    placeholders.join(", ")
                )
            } else {
                format!(
                    "INSERT IGNORE INTO like_records (user_id, item_id, created_at) VALUES {}",
                    placeholders.join(", ")
                )
            };

            let mut query = sqlx::query(&sql);
            for record in chunk {
                query = query
                    .bind(record.user_id)
                    .bind(record.item_id)
                    .bind(record.created_at);
            }
            query
                .execute(&mut **tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl LikeStore for SqlLikeStore {
    async fn apply(&self, batch: &NetBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        self.apply_counter_deltas(&mut tx, &batch.counter_deltas).await?;
        self.apply_removals(&mut tx, &batch.removals).await?;
        self.apply_inserts(&mut tx, &batch.inserts).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn has_like(&self, user_id: i64, item_id: i64) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM like_records WHERE user_id = ? AND item_id = ? LIMIT 1")
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn liked_items(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        let rows = sqlx::query("SELECT item_id FROM like_records WHERE user_id = ? ORDER BY item_id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let item_id: i64 = row
                .try_get("item_id")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            items.push(item_id);
        }
        Ok(items)
    }

    async fn like_count(&self, item_id: i64) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT like_count FROM item_counters WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => row
                .try_get("like_count")
                .map_err(|e| StorageError::Backend(e.to_string())),
            None => Ok(0),
        }
    }
}
