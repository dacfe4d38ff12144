//! Store client for the external key-value service.
//!
//! The ingester treats the store as a remote service exposing a fixed set of
//! primitives; everything it persists fits the schema below. [`RedisStore`]
//! is the production client, [`MemoryStore`] backs tests and Redis-less runs.
//!
//! Schema (key → value):
//!
//! * `feed:url:<url>` — feed id (registration idempotency)
//! * `feed:<id>` — JSON feed record (etag, expires, channel info)
//! * `feed:<id>:items` — sorted set of item keys, scored by item date
//! * `feed:<id>:delay` — current backoff delay in ms (`0` when healthy)
//! * `item:<guid>` — JSON item record
//! * `item:<guid>:feeds` — set of feed ids referencing the item
//! * `feeds` — sorted set of feed ids, scored by next-expiry timestamp
//! * `feeds:next_id` — id allocator

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(#[from] ::redis::RedisError),

    /// An operation hit a key holding a different data kind.
    #[error("wrong value kind at key {0}")]
    WrongKind(String),
}

/// A write queued into an atomic [`Store::batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set { key: String, value: String },
    Zadd { key: String, score: i64, member: String },
}

/// The primitive operations the external store exposes.
///
/// Scores and numeric values are epoch milliseconds throughout.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Replace the value at `key`, returning the previous one.
    async fn getset(&self, key: &str, value: &str) -> Result<Option<String>, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    /// Members with `min <= score <= max`, in score order.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomically increment the integer at `key`, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Apply every operation as one atomic unit: all or nothing.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;
}

// ============================================================================
// Key builders
// ============================================================================

/// Feed ids are opaque to callers; in keys they render as decimal integers.
pub type FeedId = u64;

pub(crate) fn feed_url_key(url: &str) -> String {
    format!("feed:url:{url}")
}

pub(crate) fn feed_key(id: FeedId) -> String {
    format!("feed:{id}")
}

pub(crate) fn feed_items_key(id: FeedId) -> String {
    format!("feed:{id}:items")
}

pub(crate) fn feed_delay_key(id: FeedId) -> String {
    format!("feed:{id}:delay")
}

pub(crate) fn item_key(guid: &str) -> String {
    format!("item:{guid}")
}

pub(crate) fn item_feeds_key(guid: &str) -> String {
    format!("item:{guid}:feeds")
}

/// Global schedule: feed ids scored by next-expiry timestamp.
pub(crate) const SCHEDULE_KEY: &str = "feeds";
pub(crate) const NEXT_ID_KEY: &str = "feeds:next_id";
