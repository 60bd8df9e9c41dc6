//! Built-in inline storage strategy.
//!
//! Embeds bucket values directly in the stream entry as base64 fields, so
//! the system is functional with zero registered strategies.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;

use super::{
    ConsumerStorageStrategy, ProducerStorageStrategy, Result, StorageError,
};
use crate::model::{Bucket, BucketCategory, Metadata};
use crate::transport::EntryFields;

/// Hint field key for one inline-stored segment: `{cat}~{segment key}`.
fn hint_key(category: BucketCategory, segment: &str) -> String {
    format!("{}~{}", category.hint_prefix(), segment)
}

/// Same-entry storage: values travel inside the stream entry itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineStorageStrategy;

impl InlineStorageStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProducerStorageStrategy for InlineStorageStrategy {
    fn name(&self) -> &str {
        "inline"
    }

    async fn save_bucket(
        &self,
        _id: &str,
        bucket: &Bucket,
        category: BucketCategory,
        _metadata: &Metadata,
    ) -> Result<EntryFields> {
        let mut hints = EntryFields::new();
        for (key, value) in bucket.iter() {
            hints.push(hint_key(category, key), BASE64.encode(value));
        }
        Ok(hints)
    }
}

#[async_trait]
impl ConsumerStorageStrategy for InlineStorageStrategy {
    fn name(&self) -> &str {
        "inline"
    }

    async fn load_bucket(
        &self,
        _metadata: &Metadata,
        prev: Bucket,
        category: BucketCategory,
        hints: &EntryFields,
    ) -> Result<Bucket> {
        let prefix = format!("{}~", category.hint_prefix());
        let mut bucket = prev;
        for (field, value) in hints.iter() {
            if let Some(segment) = field.strip_prefix(&prefix) {
                let bytes = BASE64.decode(value).map_err(|e| StorageError::MalformedHint {
                    hint: field.to_string(),
                    reason: e.to_string(),
                })?;
                bucket = bucket.with(segment, Bytes::from(bytes));
            }
        }
        Ok(bucket)
    }
}
