//! Data model for announcements and stream addressing.
//!
//! This module contains:
//! - `StreamAddress`: environment/partition/shard triplet naming a stream
//! - `Metadata`: immutable per-message record
//! - `Bucket`: named byte segments of a payload
//! - `Announcement`: the unit of delivery

mod announcement;
mod bucket;
mod metadata;

pub use announcement::Announcement;
pub use bucket::{Bucket, BucketCategories, BucketCategory};
pub use metadata::{Metadata, MetadataError, Origin};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical address of a stream: `env:partition:shard`.
///
/// A partition groups shards a consumer may fan out over; a shard is one
/// physically ordered sequence. The shard component may be empty, in which
/// case the address names the whole partition and consumers discover the
/// shards beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamAddress {
    /// Deployment environment prefix (empty for none).
    pub env: String,
    /// Partition name.
    pub partition: String,
    /// Shard name (empty when addressing a whole partition).
    pub shard: String,
}

impl StreamAddress {
    /// Address a single shard under a partition.
    pub fn new(partition: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            env: String::new(),
            partition: partition.into(),
            shard: shard.into(),
        }
    }

    /// Address a whole partition (shards discovered at subscribe time).
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            env: String::new(),
            partition: partition.into(),
            shard: String::new(),
        }
    }

    /// Set the environment prefix.
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    /// Replace the shard component.
    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = shard.into();
        self
    }

    /// True when the address names a partition rather than a single shard.
    pub fn is_partition_only(&self) -> bool {
        self.shard.is_empty()
    }

    /// Logical uri: `partition` or `partition:shard` (no environment).
    pub fn uri(&self) -> String {
        if self.shard.is_empty() {
            self.partition.clone()
        } else {
            format!("{}:{}", self.partition, self.shard)
        }
    }

    /// Physical stream key on the transport: the uri with the optional
    /// environment prefix.
    pub fn key(&self) -> String {
        if self.env.is_empty() {
            self.uri()
        } else {
            format!("{}:{}", self.env, self.uri())
        }
    }

    /// Key prefix matching every shard of this partition.
    pub fn shard_prefix(&self) -> String {
        if self.env.is_empty() {
            format!("{}:", self.partition)
        } else {
            format!("{}:{}:", self.env, self.partition)
        }
    }

    /// Resolve a discovered shard key back to a shard-level address.
    ///
    /// Returns `None` when the key does not belong to this partition.
    pub fn resolve_shard_key(&self, key: &str) -> Option<StreamAddress> {
        let shard = key.strip_prefix(&self.shard_prefix())?;
        if shard.is_empty() {
            return None;
        }
        Some(StreamAddress {
            env: self.env.clone(),
            partition: self.partition.clone(),
            shard: shard.to_string(),
        })
    }
}

impl fmt::Display for StreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}
