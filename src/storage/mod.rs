//! Storage backends: the shared cache (marker) and durable (record) tiers.

pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;

pub use memory::{InMemoryLikeStore, InMemoryMarkerStore};
pub use redis::RedisMarkerStore;
pub use sql::SqlLikeStore;
pub use traits::{LikeStore, MarkerStore, StorageError, ToggleOutcome};
