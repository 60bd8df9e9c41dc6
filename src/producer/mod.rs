//! Producer side: plans, segmentation, interception, and the send channel.
//!
//! A [`ProducerBuilder`] is refined through copy-on-write `with_*` calls
//! and finalized once into an immutable plan owned by the
//! [`ProducerChannel`].

mod channel;

pub use channel::ProducerChannel;

use std::sync::Arc;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use bytes::Bytes;

use crate::model::{Bucket, Metadata, StreamAddress};
use crate::resilience;
use crate::storage::{FilteredProducerStrategy, StorageError};
use crate::transport::{StreamTransport, TransportError};

/// Errors that can occur while producing.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage strategy error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to serialize metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("segmentation strategy failed: {0}")]
    Segmentation(String),

    #[error("interceptor '{name}' failed: {message}")]
    Interceptor { name: String, message: String },
}

/// Result type for producer operations.
pub type Result<T> = std::result::Result<T, ProducerError>;

/// Producer-side logic splitting or enriching the named byte segments of
/// an operation before they are persisted.
///
/// Strategies run in registration order; each receives the bucket the
/// previous one produced.
pub trait SegmentationStrategy: Send + Sync {
    fn segment(&self, operation: &str, segments: Bucket) -> Result<Bucket>;
}

/// Producer-side interceptor attaching opaque bytes to every announcement.
///
/// The bytes are stored in the `InterceptorsData` bucket under
/// [`ProducerInterceptor::name`] and handed back to the consumer-side
/// interceptor of the same name.
#[async_trait]
pub trait ProducerInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn intercept(&self, metadata: &Metadata, segments: &Bucket) -> Result<Bytes>;
}

/// Immutable configuration snapshot consumed by [`ProducerChannel`].
#[derive(Clone)]
pub(crate) struct ProducerPlan {
    pub(crate) transport: Arc<dyn StreamTransport>,
    pub(crate) address: StreamAddress,
    pub(crate) strategies: Arc<Vec<FilteredProducerStrategy>>,
    pub(crate) segmentations: Arc<Vec<Arc<dyn SegmentationStrategy>>>,
    pub(crate) interceptors: Arc<Vec<Arc<dyn ProducerInterceptor>>>,
    pub(crate) send_policy: ExponentialBuilder,
}

/// Builder for a producer channel.
///
/// Every `with_*` transition consumes the builder and returns a new one;
/// unchanged substructure is shared (`Arc`ed lists), never mutated after
/// the channel is built.
#[derive(Clone)]
pub struct ProducerBuilder {
    plan: ProducerPlan,
}

impl ProducerBuilder {
    pub fn new(transport: Arc<dyn StreamTransport>, address: StreamAddress) -> Self {
        Self {
            plan: ProducerPlan {
                transport,
                address,
                strategies: Arc::new(Vec::new()),
                segmentations: Arc::new(Vec::new()),
                interceptors: Arc::new(Vec::new()),
                send_policy: resilience::send_backoff(),
            },
        }
    }

    /// Set the environment prefix.
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.plan.address = self.plan.address.with_env(env);
        self
    }

    /// Register a storage strategy (appended to the chain).
    pub fn with_storage_strategy(mut self, strategy: FilteredProducerStrategy) -> Self {
        let mut strategies = (*self.plan.strategies).clone();
        strategies.push(strategy);
        self.plan.strategies = Arc::new(strategies);
        self
    }

    /// Register a segmentation strategy (applied in registration order).
    pub fn with_segmentation(mut self, strategy: Arc<dyn SegmentationStrategy>) -> Self {
        let mut segmentations = (*self.plan.segmentations).clone();
        segmentations.push(strategy);
        self.plan.segmentations = Arc::new(segmentations);
        self
    }

    /// Register a producer interceptor (applied in registration order).
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ProducerInterceptor>) -> Self {
        let mut interceptors = (*self.plan.interceptors).clone();
        interceptors.push(interceptor);
        self.plan.interceptors = Arc::new(interceptors);
        self
    }

    /// Override the append retry policy (default: 3 retries).
    pub fn with_send_policy(mut self, policy: ExponentialBuilder) -> Self {
        self.plan.send_policy = policy;
        self
    }

    /// Finalize into a channel. The plan is immutable from here on.
    pub fn build(self) -> ProducerChannel {
        ProducerChannel::new(self.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    #[test]
    fn test_builder_transitions_share_substructure() {
        let transport = Arc::new(InMemoryTransport::new());
        let base = ProducerBuilder::new(transport, StreamAddress::new("Kids", "HappySocks"));

        let with_env = base.clone().with_env("prod");
        assert_eq!(base.plan.address.env, "");
        assert_eq!(with_env.plan.address.env, "prod");
        // Untouched lists are shared, not copied.
        assert!(Arc::ptr_eq(
            &base.plan.strategies,
            &with_env.plan.strategies
        ));
    }
}
