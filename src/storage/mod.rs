//! Pluggable payload storage strategies.
//!
//! A producer fans each bucket of an announcement across the registered
//! strategies; each strategy persists what it handles and returns small
//! key/value hints that ride along in the stream entry. The consumer side
//! runs the mirror chain to rebuild the bucket from those hints.
//!
//! Strategies:
//! - `InlineStorageStrategy` - bucket values embedded in the entry itself
//!   (the built-in default; always functional)
//! - `FilesystemStorageStrategy` - content-addressed out-of-band storage
//!
//! Strategy selection is chain-of-responsibility over bucket categories;
//! see [`chain`] for the filtering decorators.

pub mod chain;
mod filesystem;
mod inline;

pub use chain::{FilteredConsumerStrategy, FilteredProducerStrategy};
pub use filesystem::FilesystemStorageStrategy;
pub use inline::InlineStorageStrategy;

use async_trait::async_trait;

use crate::model::{Bucket, BucketCategory, Metadata};
use crate::transport::EntryFields;

/// Errors that can occur during storage strategy operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to save bucket: {0}")]
    Save(String),

    #[error("failed to load bucket: {0}")]
    Load(String),

    #[error("payload integrity check failed for hint {hint}: expected {expected}, got {actual}")]
    Integrity {
        hint: String,
        expected: String,
        actual: String,
    },

    #[error("malformed storage hint {hint}: {reason}")]
    MalformedHint { hint: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage strategy operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Producer-side persist half of a storage strategy.
///
/// `save_bucket` persists the bucket wherever the backend lives (or
/// no-ops in dry-run style backends) and returns the hint fields the
/// consumer side needs to fetch the data back. Hints are appended to the
/// stream entry verbatim.
#[async_trait]
pub trait ProducerStorageStrategy: Send + Sync {
    /// Stable name, used in logs.
    fn name(&self) -> &str;

    async fn save_bucket(
        &self,
        id: &str,
        bucket: &Bucket,
        category: BucketCategory,
        metadata: &Metadata,
    ) -> Result<EntryFields>;
}

/// Consumer-side load half of a storage strategy.
///
/// `load_bucket` rebuilds the keys this strategy is responsible for and
/// chains them onto `prev` so several strategies can each contribute
/// different keys of one bucket.
#[async_trait]
pub trait ConsumerStorageStrategy: Send + Sync {
    /// Stable name, used in logs.
    fn name(&self) -> &str;

    async fn load_bucket(
        &self,
        metadata: &Metadata,
        prev: Bucket,
        category: BucketCategory,
        hints: &EntryFields,
    ) -> Result<Bucket>;
}
