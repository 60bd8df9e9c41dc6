//! Chain-of-responsibility over storage strategies.
//!
//! A `Filtered*Strategy` narrows a plain strategy to a category bitmask;
//! the producer decorator additionally supports a key-level predicate so a
//! single bucket's keys can fan out across more than one backend (e.g.
//! sensitive keys to one store, everything else to another). Matching is
//! independent per category. When zero strategies match a category the
//! built-in inline strategy takes over, so the chain is always functional.

use std::sync::Arc;

use tracing::debug;

use super::{
    ConsumerStorageStrategy, InlineStorageStrategy, ProducerStorageStrategy, Result,
};
use crate::model::{Bucket, BucketCategories, BucketCategory, Metadata};
use crate::transport::EntryFields;

type KeyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Producer-side strategy narrowed by category and (optionally) by key.
#[derive(Clone)]
pub struct FilteredProducerStrategy {
    inner: Arc<dyn ProducerStorageStrategy>,
    categories: BucketCategories,
    key_filter: Option<KeyPredicate>,
}

impl FilteredProducerStrategy {
    pub fn new(inner: Arc<dyn ProducerStorageStrategy>, categories: BucketCategories) -> Self {
        Self {
            inner,
            categories,
            key_filter: None,
        }
    }

    /// Restrict this strategy to bucket keys satisfying `predicate`.
    pub fn with_key_filter(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.key_filter = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, category: BucketCategory) -> bool {
        self.categories.contains(category.flag())
    }

    async fn save(
        &self,
        id: &str,
        bucket: &Bucket,
        category: BucketCategory,
        metadata: &Metadata,
    ) -> Result<EntryFields> {
        let narrowed;
        let bucket = match &self.key_filter {
            Some(pred) => {
                narrowed = bucket.filter_keys(|k| pred(k));
                &narrowed
            }
            None => bucket,
        };
        self.inner.save_bucket(id, bucket, category, metadata).await
    }
}

/// Consumer-side strategy narrowed by category.
#[derive(Clone)]
pub struct FilteredConsumerStrategy {
    inner: Arc<dyn ConsumerStorageStrategy>,
    categories: BucketCategories,
}

impl FilteredConsumerStrategy {
    pub fn new(inner: Arc<dyn ConsumerStorageStrategy>, categories: BucketCategories) -> Self {
        Self { inner, categories }
    }

    pub fn matches(&self, category: BucketCategory) -> bool {
        self.categories.contains(category.flag())
    }
}

/// Run the producer chain for one category, falling back to the inline
/// default when nothing matches. Hints from every matching strategy are
/// concatenated.
pub(crate) async fn save_bucket(
    strategies: &[FilteredProducerStrategy],
    id: &str,
    bucket: &Bucket,
    category: BucketCategory,
    metadata: &Metadata,
) -> Result<EntryFields> {
    let mut matched = false;
    let mut hints = EntryFields::new();
    for strategy in strategies.iter().filter(|s| s.matches(category)) {
        matched = true;
        hints.extend(strategy.save(id, bucket, category, metadata).await?);
    }
    if !matched {
        debug!(
            category = ?category,
            "No storage strategy matched; using inline default"
        );
        hints = InlineStorageStrategy::new()
            .save_bucket(id, bucket, category, metadata)
            .await?;
    }
    Ok(hints)
}

/// Run the consumer chain for one category, each matching strategy
/// contributing onto the bucket built so far; inline default when nothing
/// matches.
pub(crate) async fn load_bucket(
    strategies: &[FilteredConsumerStrategy],
    metadata: &Metadata,
    category: BucketCategory,
    hints: &EntryFields,
) -> Result<Bucket> {
    let mut matched = false;
    let mut bucket = Bucket::new();
    for strategy in strategies.iter().filter(|s| s.matches(category)) {
        matched = true;
        bucket = strategy
            .inner
            .load_bucket(metadata, bucket, category, hints)
            .await?;
    }
    if !matched {
        bucket = InlineStorageStrategy::new()
            .load_bucket(metadata, bucket, category, hints)
            .await?;
    }
    Ok(bucket)
}
