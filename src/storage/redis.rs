//! Redis marker store: the shared cache fast path.
//!
//! Per-user marker hashes hold item-id fields whose value is an expiry hint
//! (epoch millis) rather than an enforced TTL; staleness is detected on read
//! and repaired lazily. The like/unlike check-and-mutate runs as a Lua script
//! so concurrent toggles for one pair serialize inside a single evaluation.
//!
//! Script contract (shared with any other cache implementation):
//! - `KEYS[1]` - provisional counter key (`like:pending:{slice}`)
//! - `KEYS[2]` - user marker key (`like:user:{user_id}`)
//! - `ARGV`   - user id, item id, expiry millis (like only)
//! - returns `-1` = already in target state, `1` = success

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::traits::{MarkerStore, StorageError, ToggleOutcome};
use crate::keys;
use crate::model::now_millis;
use crate::resilience::retry::{retry, RetryConfig};

/// Script return: the pair was already in the requested state.
const SCRIPT_ALREADY: i64 = -1;
/// Script return: marker and provisional counter were mutated.
const SCRIPT_OK: i64 = 1;

const LIKE_SCRIPT: &str = r#"
local pendingKey = KEYS[1]
local markerKey = KEYS[2]
local userId = ARGV[1]
local itemId = ARGV[2]
local expireAt = ARGV[3]

if redis.call('HEXISTS', markerKey, itemId) == 1 then
    return -1
end

local field = userId .. ':' .. itemId
local pending = tonumber(redis.call('HGET', pendingKey, field) or 0)
redis.call('HSET', pendingKey, field, pending + 1)
redis.call('HSET', markerKey, itemId, expireAt)

return 1
"#;

const UNLIKE_SCRIPT: &str = r#"
local pendingKey = KEYS[1]
local markerKey = KEYS[2]
local userId = ARGV[1]
local itemId = ARGV[2]

if redis.call('HEXISTS', markerKey, itemId) ~= 1 then
    return -1
end

local field = userId .. ':' .. itemId
local pending = tonumber(redis.call('HGET', pendingKey, field) or 0)
redis.call('HSET', pendingKey, field, pending - 1)
redis.call('HDEL', markerKey, itemId)

return 1
"#;

pub struct RedisMarkerStore {
    connection: ConnectionManager,
    like_script: Script,
    unlike_script: Script,
}

impl RedisMarkerStore {
    /// Connect with startup-mode retry (fails fast on bad config).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            like_script: Script::new(LIKE_SCRIPT),
            unlike_script: Script::new(UNLIKE_SCRIPT),
        })
    }

    /// Get a clone of the connection manager (cheap, shares the pool).
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    fn decode_outcome(code: i64) -> Result<ToggleOutcome, StorageError> {
        match code {
            SCRIPT_OK => Ok(ToggleOutcome::Applied),
            SCRIPT_ALREADY => Ok(ToggleOutcome::AlreadyInState),
            other => Err(StorageError::Backend(format!(
                "unexpected toggle script return: {other}"
            ))),
        }
    }
}

#[async_trait]
impl MarkerStore for RedisMarkerStore {
    async fn toggle_like(
        &self,
        user_id: i64,
        item_id: i64,
        expire_at: i64,
    ) -> Result<ToggleOutcome, StorageError> {
        let mut conn = self.connection.clone();
        let slice = keys::time_slice(now_millis());
        let code: i64 = self
            .like_script
            .key(keys::pending_key(&slice))
            .key(keys::user_marker_key(user_id))
            .arg(user_id)
            .arg(item_id)
            .arg(expire_at)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::decode_outcome(code)
    }

    async fn toggle_unlike(
        &self,
        user_id: i64,
        item_id: i64,
    ) -> Result<ToggleOutcome, StorageError> {
        let mut conn = self.connection.clone();
        let slice = keys::time_slice(now_millis());
        let code: i64 = self
            .unlike_script
            .key(keys::pending_key(&slice))
            .key(keys::user_marker_key(user_id))
            .arg(user_id)
            .arg(item_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::decode_outcome(code)
    }

    async fn marker(&self, user_id: i64, item_id: i64) -> Result<Option<i64>, StorageError> {
        let mut conn = self.connection.clone();
        conn.hget(keys::user_marker_key(user_id), item_id)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn markers(
        &self,
        user_id: i64,
        item_ids: &[i64],
    ) -> Result<Vec<Option<i64>>, StorageError> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        // redis-rs promotes a multi-field HGET to HMGET
        let values: Vec<Option<i64>> = conn
            .hget(keys::user_marker_key(user_id), item_ids.to_vec())
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(values)
    }

    async fn remove_marker(&self, user_id: i64, item_id: i64) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .hdel(keys::user_marker_key(user_id), item_id)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn restore_marker(
        &self,
        user_id: i64,
        item_id: i64,
        expire_at: i64,
    ) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn
            .hset(keys::user_marker_key(user_id), item_id, expire_at)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn marked_users(&self) -> Result<Vec<i64>, StorageError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", keys::USER_MARKER_PREFIX);
        let mut users = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(&pattern)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        while let Some(key) = iter.next_item().await {
            if let Some(user_id) = keys::user_id_from_marker_key(&key) {
                users.push(user_id);
            }
        }
        Ok(users)
    }

    async fn marked_items(&self, user_id: i64) -> Result<Vec<i64>, StorageError> {
        let mut conn = self.connection.clone();
        conn.hkeys(keys::user_marker_key(user_id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}
