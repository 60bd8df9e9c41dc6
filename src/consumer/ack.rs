//! Per-message acknowledgment handles and batch cancellation scopes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{MessageId, Result as TransportResult, StreamTransport};

const PENDING: u8 = 0;
const ACKED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellation scope of one read batch.
///
/// Created at batch start; cancelled only by an entry's ack-cancel (the
/// subscription token is deliberately not linked in, so shutting down a
/// subscription lets the in-flight batch finish). The shard loop checks
/// [`BatchScope::is_cancelled`] before each entry, so downstream entries
/// of the batch are skipped, and the scope asks the transport
/// (best-effort) to release the not-yet-processed entries back to the
/// group.
pub(crate) struct BatchScope {
    transport: Arc<dyn StreamTransport>,
    key: String,
    group: String,
    token: CancellationToken,
    /// Ids in this batch that have not started processing yet.
    remaining: Mutex<Vec<MessageId>>,
}

impl BatchScope {
    pub(crate) fn new(
        transport: Arc<dyn StreamTransport>,
        key: String,
        group: String,
        ids: Vec<MessageId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            key,
            group,
            token: CancellationToken::new(),
            remaining: Mutex::new(ids),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Mark `id` as the entry currently being processed: it is no longer
    /// eligible for forward-cancellation release.
    pub(crate) fn begin_entry(&self, id: &str) {
        self.remaining
            .lock()
            .expect("batch scope lock poisoned")
            .retain(|x| x != id);
    }

    /// Cancel every not-yet-processed entry of the batch and ask the
    /// transport to release them (no-op on transports without an unclaim
    /// primitive; idle-timeout reclaim covers those).
    pub(crate) async fn cancel_forward(&self) {
        self.token.cancel();
        let ids: Vec<MessageId> = self
            .remaining
            .lock()
            .expect("batch scope lock poisoned")
            .drain(..)
            .collect();
        if ids.is_empty() {
            return;
        }
        debug!(
            key = %self.key,
            count = ids.len(),
            "Forward-cancelling remaining batch entries"
        );
        if let Err(e) = self
            .transport
            .release(&self.key, &self.group, &ids)
            .await
        {
            warn!(key = %self.key, error = %e, "Best-effort release failed");
        }
    }
}

/// Per-message acknowledgment token.
///
/// At most one terminal call takes effect: either [`Ack::ack`] durably
/// marks the message consumed, or [`Ack::cancel`] abandons it so the
/// transport's redelivery/claim machinery re-surfaces it. The handle's
/// lifetime is bounded to one message's processing.
pub struct Ack {
    transport: Arc<dyn StreamTransport>,
    key: String,
    group: String,
    id: MessageId,
    state: AtomicU8,
    batch: Arc<BatchScope>,
}

impl Ack {
    pub(crate) fn new(
        transport: Arc<dyn StreamTransport>,
        key: String,
        group: String,
        id: MessageId,
        batch: Arc<BatchScope>,
    ) -> Self {
        Self {
            transport,
            key,
            group,
            id,
            state: AtomicU8::new(PENDING),
            batch,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.id
    }

    /// Durably mark this message consumed. Idempotent: only the first
    /// terminal call reaches the transport.
    pub async fn ack(&self) -> TransportResult<()> {
        if self
            .state
            .compare_exchange(PENDING, ACKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.transport.ack(&self.key, &self.group, &self.id).await
    }

    /// Abandon this message without acking and forward-cancel the rest of
    /// its batch. Best-effort; errors are logged, never surfaced.
    pub async fn cancel(&self) {
        if self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!(message_id = %self.id, key = %self.key, "Delivery cancelled, leaving entry pending");
        self.batch.cancel_forward().await;
    }

    /// True once either terminal call has taken effect.
    pub fn is_terminal(&self) -> bool {
        self.state.load(Ordering::SeqCst) != PENDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EntryFields, InMemoryTransport, StreamTransport};

    async fn pending_ack(transport: Arc<InMemoryTransport>) -> Ack {
        transport.create_group_if_absent("s", "g").await.unwrap();
        transport.append("s", &EntryFields::new()).await.unwrap();
        let batch = transport.read_group("s", "g", "c", 10).await.unwrap();
        let id = batch[0].id.clone();
        let scope = BatchScope::new(transport.clone(), "s".to_string(), "g".to_string(), vec![]);
        Ack::new(transport, "s".to_string(), "g".to_string(), id, scope)
    }

    #[tokio::test]
    async fn test_ack_removes_pending() {
        let transport = Arc::new(InMemoryTransport::new());
        let ack = pending_ack(transport.clone()).await;

        ack.ack().await.unwrap();
        assert_eq!(transport.pending_len("s", "g"), 0);
        assert!(ack.is_terminal());
    }

    #[tokio::test]
    async fn test_cancel_leaves_entry_pending() {
        let transport = Arc::new(InMemoryTransport::new());
        let ack = pending_ack(transport.clone()).await;

        ack.cancel().await;
        assert_eq!(transport.pending_len("s", "g"), 1);

        // A later ack is a no-op: cancel already took the terminal slot.
        ack.ack().await.unwrap();
        assert_eq!(transport.pending_len("s", "g"), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_remaining_batch() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.create_group_if_absent("s", "g").await.unwrap();
        for _ in 0..3 {
            transport.append("s", &EntryFields::new()).await.unwrap();
        }
        let batch = transport.read_group("s", "g", "c", 10).await.unwrap();
        let ids: Vec<MessageId> = batch.iter().map(|e| e.id.clone()).collect();

        let scope = BatchScope::new(
            transport.clone(),
            "s".to_string(),
            "g".to_string(),
            ids.clone(),
        );
        scope.begin_entry(&ids[0]);
        let ack = Ack::new(
            transport.clone(),
            "s".to_string(),
            "g".to_string(),
            ids[0].clone(),
            scope.clone(),
        );

        ack.cancel().await;
        assert!(scope.is_cancelled());

        // Released entries are idle-forever: a peer claim with a large
        // min-idle picks them up immediately.
        let claimed = transport
            .claim(
                "s",
                "g",
                "c2",
                std::time::Duration::from_secs(3600),
                &ids[1..],
            )
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
    }
}
