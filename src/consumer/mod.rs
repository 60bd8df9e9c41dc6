//! Consumer side: subscription plans, the competing-consumers channel,
//! and the per-message delivery state machine.
//!
//! A [`ConsumerBuilder`] is refined through copy-on-write `with_*` calls
//! and finalized once by [`ConsumerBuilder::subscribe`], which spawns one
//! subscription task per shard and returns a [`Subscription`] handle.

mod ack;
mod channel;
mod subscription;

pub use ack::Ack;
pub use subscription::{live_subscriptions, OperationRouter, Subscription};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{Announcement, MetadataError, StreamAddress};
use crate::resilience;
use crate::storage::{FilteredConsumerStrategy, StorageError};
use crate::transport::{MessageId, StreamTransport, TransportError};

/// Boxed error handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur on the consumer side.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage strategy error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("entry {id} is missing required field {field}")]
    MissingField { field: &'static str, id: MessageId },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("no handler recognized operation '{operation}'")]
    NotHandled { operation: String },

    #[error("delivery cancelled")]
    Cancelled,
}

/// Result type for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

// ============================================================================
// Policies
// ============================================================================

/// When a message is durably marked consumed relative to handler execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckBehavior {
    /// Ack right after a successful invocation; cancel on failure.
    #[default]
    OnSucceed,
    /// Ack exactly once regardless of outcome (suppressed under
    /// [`PartialConsumerBehavior::Sequential`]).
    OnFinally,
}

/// What to do when no registered handler recognized the operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialConsumerBehavior {
    /// Log critical and surface a processing failure.
    #[default]
    ThrowIfNotHandled,
    /// Treat as handled so an unrecognized operation never blocks the shard.
    Loose,
    /// Like `Loose`, but defers finally-acks to preserve strict in-order
    /// semantics around partial failures.
    Sequential,
}

/// Handler fan-out policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerBehavior {
    /// Invoke every handler in parallel; success is "at least one
    /// recognized the operation".
    #[default]
    All,
    /// Try handlers in registration order; first recognition wins.
    Once,
}

// ============================================================================
// Configuration surface
// ============================================================================

/// Peer-claim trigger configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaimOptions {
    /// Consecutive empty batches before scanning peers for stale entries.
    pub empty_batch_threshold: u32,
    /// Minimum idle time before another consumer's pending entry may be
    /// claimed.
    pub min_idle: Duration,
    /// Pending ids fetched per peer and claim attempt.
    pub page_size: usize,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            empty_batch_threshold: 3,
            min_idle: Duration::from_secs(10),
            page_size: 16,
        }
    }
}

/// Adaptive idle-backoff configuration: delays grow monotonically from
/// `initial` by `factor` up to `max` while the shard stays empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdleOptions {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for IdleOptions {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1),
            factor: 2,
            max: Duration::from_secs(5),
        }
    }
}

/// Full consumer configuration surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Messages requested per stream read.
    pub batch_size: usize,
    pub claim: ClaimOptions,
    pub idle: IdleOptions,
    /// Stop after this many deliveries; 0 means unlimited.
    pub max_messages: u64,
    pub ack_behavior: AckBehavior,
    pub partial_behavior: PartialConsumerBehavior,
    pub consumer_behavior: ConsumerBehavior,
    /// Keep the subscription registered process-wide until disposed.
    pub keep_alive: bool,
    /// Consumer group name.
    pub group: String,
    /// Consumer name; a random identifier is generated when absent.
    pub consumer_name: Option<String>,
    /// Producer spans younger than this are adopted as span parents;
    /// older ones are only linked.
    pub trace_parent_window: Duration,
    /// Pause between shard-discovery scans under a partition subscription.
    pub discovery_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            claim: ClaimOptions::default(),
            idle: IdleOptions::default(),
            max_messages: 0,
            ack_behavior: AckBehavior::default(),
            partial_behavior: PartialConsumerBehavior::default(),
            consumer_behavior: ConsumerBehavior::default(),
            keep_alive: true,
            group: "keelson".to_string(),
            consumer_name: None,
            trace_parent_window: Duration::from_secs(300),
            discovery_interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Handler seams
// ============================================================================

/// Business-logic handler for delivered announcements.
///
/// `handle` returns `Ok(true)` iff it recognized and executed the
/// operation; `Ok(false)` routes into the partial-consumption policy.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, announcement: &Announcement) -> std::result::Result<bool, BoxError>;
}

/// Consumer-side interceptor observing each delivery together with the
/// bytes its producer-side counterpart attached (empty if absent).
/// Interceptors observe; they do not transform routing.
#[async_trait]
pub trait ConsumerInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn intercept(&self, announcement: &Announcement, data: Bytes);
}

// ============================================================================
// Plan & builder
// ============================================================================

/// Immutable subscription snapshot shared by every shard task.
pub(crate) struct ConsumerPlan {
    pub(crate) transport: Arc<dyn StreamTransport>,
    pub(crate) address: StreamAddress,
    pub(crate) options: ConsumerOptions,
    /// Resolved consumer name (random identifier unless configured).
    pub(crate) consumer_name: String,
    pub(crate) strategies: Arc<Vec<FilteredConsumerStrategy>>,
    pub(crate) interceptors: Arc<Vec<Arc<dyn ConsumerInterceptor>>>,
    pub(crate) handlers: Arc<Vec<Arc<dyn OperationHandler>>>,
    pub(crate) handler_policy: ExponentialBuilder,
    pub(crate) cancellation: CancellationToken,
}

/// Builder for a subscription.
///
/// Every `with_*` transition consumes the builder and returns a new one;
/// the finalized plan is immutable.
pub struct ConsumerBuilder {
    transport: Arc<dyn StreamTransport>,
    address: StreamAddress,
    options: ConsumerOptions,
    strategies: Arc<Vec<FilteredConsumerStrategy>>,
    interceptors: Arc<Vec<Arc<dyn ConsumerInterceptor>>>,
    handlers: Arc<Vec<Arc<dyn OperationHandler>>>,
    handler_policy: ExponentialBuilder,
    cancellation: CancellationToken,
}

impl ConsumerBuilder {
    pub fn new(transport: Arc<dyn StreamTransport>, address: StreamAddress) -> Self {
        Self {
            transport,
            address,
            options: ConsumerOptions::default(),
            strategies: Arc::new(Vec::new()),
            interceptors: Arc::new(Vec::new()),
            handlers: Arc::new(Vec::new()),
            handler_policy: resilience::handler_backoff(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the environment prefix.
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.address = self.address.with_env(env);
        self
    }

    /// Replace the whole configuration surface.
    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the consumer group name.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.options.group = group.into();
        self
    }

    /// Set an explicit consumer name (defaults to a random identifier).
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.options.consumer_name = Some(name.into());
        self
    }

    /// Register a consumer-side storage strategy (appended to the chain).
    pub fn with_storage_strategy(mut self, strategy: FilteredConsumerStrategy) -> Self {
        let mut strategies = (*self.strategies).clone();
        strategies.push(strategy);
        self.strategies = Arc::new(strategies);
        self
    }

    /// Register a consumer interceptor (run in registration order).
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ConsumerInterceptor>) -> Self {
        let mut interceptors = (*self.interceptors).clone();
        interceptors.push(interceptor);
        self.interceptors = Arc::new(interceptors);
        self
    }

    /// Register a handler (fan-out governed by `ConsumerBehavior`).
    pub fn with_handler(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Override the handler retry policy (default: 3 retries, doubling
    /// full seconds).
    pub fn with_handler_policy(mut self, policy: ExponentialBuilder) -> Self {
        self.handler_policy = policy;
        self
    }

    /// Link the subscription to an external cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Finalize the plan and start the subscription.
    ///
    /// Spawns one task per shard (plus a discovery task for partition
    /// subscriptions) and returns immediately with the handle.
    pub async fn subscribe(self) -> Result<Subscription> {
        let consumer_name = self
            .options
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("keelson-{}", Uuid::new_v4()));

        let plan = Arc::new(ConsumerPlan {
            transport: self.transport,
            address: self.address,
            options: self.options,
            consumer_name,
            strategies: self.strategies,
            interceptors: self.interceptors,
            handlers: self.handlers,
            handler_policy: self.handler_policy,
            // Linked child: cancelling the caller's token stops the
            // subscription, disposing never cancels the caller's token.
            cancellation: self.cancellation.child_token(),
        });

        Ok(subscription::start(plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    #[test]
    fn test_options_defaults() {
        let options = ConsumerOptions::default();
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.claim.empty_batch_threshold, 3);
        assert_eq!(options.ack_behavior, AckBehavior::OnSucceed);
        assert_eq!(
            options.partial_behavior,
            PartialConsumerBehavior::ThrowIfNotHandled
        );
        assert_eq!(options.consumer_behavior, ConsumerBehavior::All);
        assert!(options.keep_alive);
        assert!(options.consumer_name.is_none());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: ConsumerOptions = serde_json::from_str(
            r#"{
                "batch_size": 1,
                "group": "socks",
                "ack_behavior": "onfinally",
                "partial_behavior": "sequential",
                "consumer_behavior": "once"
            }"#,
        )
        .unwrap();
        assert_eq!(options.batch_size, 1);
        assert_eq!(options.group, "socks");
        assert_eq!(options.ack_behavior, AckBehavior::OnFinally);
        assert_eq!(options.partial_behavior, PartialConsumerBehavior::Sequential);
        assert_eq!(options.consumer_behavior, ConsumerBehavior::Once);
        // Unspecified fields keep their defaults.
        assert_eq!(options.claim.page_size, 16);
    }

    #[test]
    fn test_builder_shares_untouched_lists() {
        let transport = Arc::new(InMemoryTransport::new());
        let base = ConsumerBuilder::new(transport, StreamAddress::partition("Kids"));
        let handlers_before = Arc::clone(&base.handlers);
        let refined = base.with_group("socks");
        assert!(Arc::ptr_eq(&handlers_before, &refined.handlers));
        assert_eq!(refined.options.group, "socks");
    }
}
