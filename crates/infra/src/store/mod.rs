//! Store backends (streams, sorted sets, hashes, strings).
//!
//! [`StoreBackend`] is the raw wire capability set used by the lifecycle
//! engine. Backends perform exactly one round trip per call and never retry;
//! retries, timeouts, metrics and recovery are layered on top by
//! [`ResilientStoreClient`](crate::client::ResilientStoreClient).
//!
//! ## Backends
//!
//! - [`RedisBackend`](redis_store::RedisBackend): Redis via an async connection
//!   manager, with Lua scripts for the multi-step operations
//! - [`InMemoryBackend`]: single-process emulation for tests/dev

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use taskrelay_core::EntryId;

pub mod error;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;
#[cfg(feature = "redis")]
pub(crate) mod scripts;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use redis_store::RedisBackend;

/// Field/value pairs of a stream entry, in append order.
pub type Fields = Vec<(String, String)>;

/// A stream entry as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Result of an idempotent consumer-group creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// Where a group read starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadStart {
    /// Entries never delivered to the group (`>`).
    New,
    /// Entries already delivered to this consumer but not acknowledged (`0`).
    Pending,
}

/// Bounded consumer-group read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroupRequest {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub count: usize,
    /// Block for at most this long when nothing is available
    pub block: Option<Duration>,
    pub start: ReadStart,
}

impl ReadGroupRequest {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        count: usize,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            count,
            block: None,
            start: ReadStart::New,
        }
    }

    pub fn blocking(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }

    pub fn pending(mut self) -> Self {
        self.start = ReadStart::Pending;
        self.block = None;
        self
    }
}

/// Pending-entry summary for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    pub lowest: Option<EntryId>,
    pub highest: Option<EntryId>,
    /// Pending count per consumer
    pub consumers: Vec<(String, u64)>,
}

/// One delivered-but-unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// Atomic move of one entry between streams.
///
/// Executed as a single store-side step: if `entry_id` still exists in
/// `from`, it is acknowledged for every group in `ack_groups`, deleted, and
/// `fields` are appended to `to` (trimmed to about `max_len`, key TTL refreshed
/// to `ttl`). If the entry is already gone nothing happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveEntry {
    pub from: String,
    pub to: String,
    pub entry_id: EntryId,
    pub ack_groups: Vec<String>,
    pub fields: Fields,
    pub max_len: usize,
    pub ttl: Duration,
}

/// Raw store capabilities.
///
/// Every method is a single round trip (or a single atomic script).
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    async fn ping(&self) -> StoreResult<()>;

    /// Drop and re-establish the underlying connection.
    async fn reconnect(&self) -> StoreResult<()>;

    // -- strings / keys -------------------------------------------------

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Set only if absent, with expiry. Returns whether the value was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Delete `key` only if it holds `expected` (atomic script).
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining time to live; `None` if the key is missing or persistent.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    // -- hashes ---------------------------------------------------------

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Delete `field` only if it holds `expected` (atomic script).
    async fn hdel_if_eq(&self, key: &str, field: &str, expected: &str) -> StoreResult<bool>;

    // -- sorted sets ----------------------------------------------------

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;

    /// Remove many members in one round trip; returns how many existed.
    async fn zrem(&self, key: &str, members: &[String]) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    // -- streams --------------------------------------------------------

    /// Atomically create `stream` with a seed entry and TTL if it does not
    /// exist. Returns whether it was created.
    async fn create_stream_if_absent(&self, stream: &str, ttl: Duration) -> StoreResult<bool>;

    /// Create a consumer group (creating the stream if needed).
    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<GroupCreation>;

    async fn xadd(&self, stream: &str, fields: &Fields, max_len: Option<usize>) -> StoreResult<EntryId>;

    async fn xlen(&self, stream: &str) -> StoreResult<u64>;

    /// Ascending range; `None` bounds mean the stream's first/last entry.
    async fn xrange(
        &self,
        stream: &str,
        start: Option<EntryId>,
        end: Option<EntryId>,
        count: Option<usize>,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// The newest `count` entries, newest first.
    async fn xrevrange(&self, stream: &str, count: usize) -> StoreResult<Vec<StreamEntry>>;

    async fn xread_group(&self, request: &ReadGroupRequest) -> StoreResult<Vec<StreamEntry>>;

    async fn xack(&self, stream: &str, group: &str, ids: &[EntryId]) -> StoreResult<u64>;

    async fn xdel(&self, stream: &str, ids: &[EntryId]) -> StoreResult<u64>;

    async fn xpending(&self, stream: &str, group: &str) -> StoreResult<PendingSummary>;

    async fn xpending_entries(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>>;

    /// Transfer pending entries idle for at least `min_idle` to `consumer`.
    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> StoreResult<Vec<StreamEntry>>;

    /// See [`MoveEntry`]. Returns the new entry id, or `None` if the source
    /// entry no longer existed.
    async fn move_entry(&self, request: &MoveEntry) -> StoreResult<Option<EntryId>>;
}
