//! Stream transport contract.
//!
//! The delivery core depends on a Redis-like stream with consumer groups
//! only through this narrow interface: append, group reads, self-pending
//! reads, claims, acks, pending summaries, and key discovery.
//!
//! Implementations:
//! - `InMemoryTransport`: single-process transport for standalone use and tests
//! - `RedisStreamTransport` (feature: redis): Redis Streams

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryTransport;
#[cfg(feature = "redis")]
pub use redis::RedisStreamTransport;

use std::time::Duration;

use async_trait::async_trait;

// ============================================================================
// Wire entry layout
// ============================================================================

/// Fixed indexed fields present in every stream entry.
pub mod fields {
    /// Producer-side correlation id, used by storage strategies for
    /// out-of-band addressing. The authoritative message id is the
    /// transport-assigned entry id.
    pub const MESSAGE_ID: &str = "MessageId";
    /// Invoked operation name.
    pub const OPERATION: &str = "Operation";
    /// Unix seconds, second precision.
    pub const PRODUCED_AT: &str = "ProducedAt";
    /// Constant protocol tag; entries carrying another tag are foreign.
    pub const CHANNEL_TYPE: &str = "ChannelType";
    /// `original` or `copy`.
    pub const ORIGIN: &str = "Origin";
    /// Reserved key for the serialized metadata side-channel blob.
    pub const META_SLOT: &str = "meta";
}

/// Protocol tag written into every entry's `ChannelType` field.
pub const CHANNEL_TYPE_TAG: &str = "KEELSON_V1";

/// Sentinel id returned when the transport reports no id for an append.
pub const ZERO_MESSAGE_ID: &str = "0-0";

/// Transport-assigned, opaque message id; monotonic within a shard.
pub type MessageId = String;

/// Ordered, extensible key/value field list of one stream entry.
///
/// Fixed fields, storage hints, and trace-propagation fields all share this
/// one list; consumers look fields up by key and need not distinguish who
/// appended them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFields(Vec<(String, String)>);

impl EntryFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn extend(&mut self, other: EntryFields) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for EntryFields {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: MessageId,
    pub fields: EntryFields,
}

/// One consumer's slice of a group's pending-entries summary.
#[derive(Debug, Clone)]
pub struct PendingConsumer {
    pub consumer: String,
    pub pending: usize,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================================================
// Contract
// ============================================================================

/// Append/read/claim/ack contract over a log-structured stream with
/// consumer groups.
///
/// Implementations must be safe for concurrent use: one connection is
/// shared by every shard subscription of a process.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append an entry to the stream under `key` and return the assigned id.
    ///
    /// The append must have strong/master-write semantics: a read issued
    /// after this call returns sees the entry.
    async fn append(&self, key: &str, entry_fields: &EntryFields) -> Result<MessageId>;

    /// Create the consumer group if it does not exist yet (idempotent).
    async fn create_group_if_absent(&self, key: &str, group: &str) -> Result<()>;

    /// Read up to `count` new messages for `consumer` in `group`.
    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Read up to `count` of this consumer's own still-pending (unacked)
    /// entries, oldest first.
    async fn read_self_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Per-consumer pending counts for the whole group.
    async fn pending_summary(&self, key: &str, group: &str) -> Result<Vec<PendingConsumer>>;

    /// Up to `count` pending message ids owned by `owner`, oldest first.
    async fn pending_ids(
        &self,
        key: &str,
        group: &str,
        owner: &str,
        count: usize,
    ) -> Result<Vec<MessageId>>;

    /// Claim `ids` for `consumer` when they have been idle at least
    /// `min_idle`. Returns the entries actually claimed (ids not pending or
    /// not idle enough are silently skipped).
    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>>;

    /// Durably mark one entry consumed for `group`.
    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<()>;

    /// Stream keys starting with `prefix` (shard discovery).
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Best-effort release of claimed-but-unprocessed entries back to the
    /// group.
    ///
    /// Redis-like streams expose no "unclaim" primitive; the default is a
    /// no-op and redelivery relies on idle-timeout reclaim by peers.
    /// Transports that can requeue eagerly may override.
    async fn release(&self, _key: &str, _group: &str, _ids: &[MessageId]) -> Result<()> {
        Ok(())
    }
}
