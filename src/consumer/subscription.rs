//! Per-subscription delivery state machine.
//!
//! One [`EventFlow`] exists per `subscribe` call. For each delivered
//! message it runs interceptors, invokes the registered handlers under
//! the plan's retry policy, applies the partial-consumption and
//! acknowledgment policies, and enforces the max-messages quota.
//!
//! Per-message states: Delivered -> Intercepted -> Invoked ->
//! {Acked | Cancelled | Rethrown}. Subscription states: Active ->
//! Disposing -> Disposed (idempotent).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::ack::Ack;
use super::{
    AckBehavior, BoxError, ConsumerBehavior, ConsumerError, ConsumerPlan, OperationHandler,
    PartialConsumerBehavior, Result,
};
use crate::model::Announcement;
use crate::resilience;

// ============================================================================
// Keep-alive registry
// ============================================================================

/// Process-wide registry of live subscriptions.
///
/// Owners that drop their [`Subscription`] handle while `keep_alive` is
/// set leave the flow registered here until it is explicitly disposed;
/// the registry is the explicit ownership record, not an ambient
/// collection.
static LIVE: LazyLock<Mutex<HashMap<u64, Arc<EventFlow>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn keepalive_register(flow: Arc<EventFlow>) -> u64 {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    LIVE.lock()
        .expect("keep-alive registry lock poisoned")
        .insert(handle, flow);
    handle
}

fn keepalive_release(handle: u64) {
    LIVE.lock()
        .expect("keep-alive registry lock poisoned")
        .remove(&handle);
}

/// Number of live (undisposed, keep-alive) subscriptions in this process.
pub fn live_subscriptions() -> usize {
    LIVE.lock()
        .expect("keep-alive registry lock poisoned")
        .len()
}

// ============================================================================
// Dispatch table
// ============================================================================

type Route = Arc<dyn Fn(Announcement) -> BoxFuture<'static, std::result::Result<(), BoxError>>
        + Send
        + Sync>;

/// Explicit operation-name dispatch table.
///
/// Routes are registered once at subscription setup; delivery is a map
/// lookup, no runtime reflection. An operation with no route reports
/// "not recognized" so the partial-consumption policy decides.
#[derive(Default)]
pub struct OperationRouter {
    routes: HashMap<String, Vec<Route>>,
}

impl OperationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed closure for `operation`. Multiple routes per
    /// operation run in registration order.
    pub fn on<F, Fut>(mut self, operation: impl Into<String>, f: F) -> Self
    where
        F: Fn(Announcement) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let route: Route = Arc::new(move |announcement| Box::pin(f(announcement)));
        self.routes.entry(operation.into()).or_default().push(route);
        self
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[async_trait]
impl OperationHandler for OperationRouter {
    async fn handle(&self, announcement: &Announcement) -> std::result::Result<bool, BoxError> {
        match self.routes.get(&announcement.metadata.operation) {
            Some(routes) => {
                for route in routes {
                    route(announcement.clone()).await?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// Delivery state machine
// ============================================================================

pub(crate) struct EventFlow {
    plan: Arc<ConsumerPlan>,
    consumed: AtomicU64,
    disposed: AtomicBool,
    completion_tx: watch::Sender<bool>,
    keepalive: Mutex<Option<u64>>,
}

impl EventFlow {
    fn new(plan: Arc<ConsumerPlan>) -> Arc<Self> {
        let (completion_tx, _) = watch::channel(false);
        Arc::new(Self {
            plan,
            consumed: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            completion_tx,
            keepalive: Mutex::new(None),
        })
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Deliver one `(announcement, ack)` pair through the state machine.
    pub(crate) async fn on_message(&self, announcement: Announcement, ack: Ack) -> Result<()> {
        let options = &self.plan.options;
        let operation = announcement.metadata.operation.clone();
        let uri = announcement.metadata.uri();
        let message_id = announcement.metadata.message_id.clone();

        // Quota gate: past the limit the subscription shuts down cleanly
        // and the delivery is cancelled so the entry stays reclaimable.
        let seen = self.consumed.fetch_add(1, Ordering::SeqCst) + 1;
        if options.max_messages != 0 && seen > options.max_messages {
            warn!(
                uri = %uri,
                message_id = %message_id,
                max_messages = options.max_messages,
                "Max-messages quota exceeded, disposing subscription"
            );
            self.dispose().await;
            ack.cancel().await;
            return Err(ConsumerError::Cancelled);
        }

        // Interceptors observe with their own previously-stored bytes.
        for interceptor in self.plan.interceptors.iter() {
            let data = announcement
                .interceptors_data
                .get(interceptor.name())
                .cloned()
                .unwrap_or_default();
            interceptor.intercept(&announcement, data).await;
        }

        let outcome = self.invoke_with_retry(&announcement).await;

        let result = match outcome {
            Ok(()) => {
                if options.ack_behavior == AckBehavior::OnSucceed {
                    if let Err(e) = ack.ack().await {
                        warn!(uri = %uri, message_id = %message_id, error = %e, "Ack failed");
                    }
                }
                #[cfg(feature = "otel")]
                crate::metrics::CONSUMED_TOTAL.add(
                    1,
                    &[
                        crate::metrics::uri_attr(&uri),
                        crate::metrics::operation_attr(&operation),
                    ],
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    uri = %uri,
                    message_id = %message_id,
                    operation = %operation,
                    error = %e,
                    "Delivery failed"
                );
                if options.ack_behavior != AckBehavior::OnFinally {
                    ack.cancel().await;
                }
                Err(e)
            }
        };

        // Finally-ack, suppressed in sequential mode where acking out of
        // band would break strict in-order semantics around failures.
        if options.ack_behavior == AckBehavior::OnFinally
            && options.partial_behavior != PartialConsumerBehavior::Sequential
        {
            if let Err(e) = ack.ack().await {
                warn!(uri = %uri, message_id = %message_id, error = %e, "Finally-ack failed");
            }
        }

        result
    }

    /// Invoke the handler fan-out under the plan's retry policy.
    ///
    /// Handler errors are retried; "no handler recognized the operation"
    /// is not an error and routes straight into the partial-consumption
    /// policy.
    async fn invoke_with_retry(&self, announcement: &Announcement) -> Result<()> {
        let operation = &announcement.metadata.operation;
        let token = &self.plan.cancellation;
        let mut last_error = None;

        for (attempt, delay) in
            resilience::attempts(self.plan.handler_policy.clone()).enumerate()
        {
            if attempt > 0 {
                warn!(
                    attempt,
                    operation = %operation,
                    "Retrying handler invocation"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(ConsumerError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.invoke_once(announcement).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    return match self.plan.options.partial_behavior {
                        PartialConsumerBehavior::ThrowIfNotHandled => {
                            error!(
                                operation = %operation,
                                uri = %announcement.metadata.uri(),
                                message_id = %announcement.metadata.message_id,
                                "No handler recognized the operation"
                            );
                            Err(ConsumerError::NotHandled {
                                operation: operation.clone(),
                            })
                        }
                        PartialConsumerBehavior::Loose | PartialConsumerBehavior::Sequential => {
                            debug!(operation = %operation, "Unrecognized operation treated as handled");
                            Ok(())
                        }
                    };
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        operation = %operation,
                        error = %e,
                        "Handler invocation failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ConsumerError::Handler("handler retries exhausted".to_string())))
    }

    /// One fan-out pass over the registered handlers.
    async fn invoke_once(&self, announcement: &Announcement) -> Result<bool> {
        match self.plan.options.consumer_behavior {
            ConsumerBehavior::Once => {
                for handler in self.plan.handlers.iter() {
                    if handler
                        .handle(announcement)
                        .await
                        .map_err(|e| ConsumerError::Handler(e.to_string()))?
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConsumerBehavior::All => {
                let invocations = self.plan.handlers.iter().map(|h| h.handle(announcement));
                let results = futures::future::join_all(invocations).await;

                let mut recognized = false;
                let mut first_error = None;
                for result in results {
                    match result {
                        Ok(true) => recognized = true,
                        Ok(false) => {}
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(ConsumerError::Handler(e.to_string()));
                            }
                        }
                    }
                }
                if recognized {
                    // Success is "at least one recognized it".
                    Ok(true)
                } else if let Some(e) = first_error {
                    Err(e)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Idempotent dispose: cancel the internal token, drop the keep-alive
    /// registration, complete the `completion` future.
    pub(crate) async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(uri = %self.plan.address.uri(), "Disposing subscription");
        self.plan.cancellation.cancel();
        if let Some(handle) = self
            .keepalive
            .lock()
            .expect("keep-alive handle lock poisoned")
            .take()
        {
            keepalive_release(handle);
        }
        let _ = self.completion_tx.send(true);
    }

    /// Resolves once the subscription is disposed.
    pub(crate) async fn completion(&self) {
        let mut rx = self.completion_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a running subscription.
///
/// Dropping the handle does not stop delivery; call
/// [`Subscription::dispose`] for a clean shutdown. With `keep_alive`
/// enabled the flow additionally stays registered process-wide until
/// disposed (see [`live_subscriptions`]).
pub struct Subscription {
    flow: Arc<EventFlow>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Finalize a plan into a running subscription.
pub(crate) fn start(plan: Arc<ConsumerPlan>) -> Subscription {
    let flow = EventFlow::new(plan.clone());

    if plan.options.keep_alive {
        let handle = keepalive_register(flow.clone());
        *flow
            .keepalive
            .lock()
            .expect("keep-alive handle lock poisoned") = Some(handle);
    }

    let task = tokio::spawn(super::channel::run(plan, flow.clone()));

    Subscription {
        flow,
        tasks: Mutex::new(vec![task]),
    }
}

impl Subscription {
    /// Messages delivered through this subscription so far.
    pub fn consumed(&self) -> u64 {
        self.flow.consumed()
    }

    /// Resolves once the subscription is disposed (explicitly, or by the
    /// max-messages quota).
    pub async fn completion(&self) {
        self.flow.completion().await;
    }

    /// Stop the subscription after the in-flight batch finishes and wait
    /// for its tasks. Idempotent; a second call is a no-op returning the
    /// already-completed lifetime.
    pub async fn dispose(&self) {
        self.flow.dispose().await;
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("subscription task lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Subscription task ended abnormally");
                }
            }
        }
    }
}
