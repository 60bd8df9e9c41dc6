//! Redis Streams transport.
//!
//! Maps the transport contract onto `XADD`/`XREADGROUP`/`XACK`/`XCLAIM`/
//! `XPENDING` and consumer groups. The underlying connection is a
//! long-lived, lazily-reconnected shared resource: reconnection happens
//! only after the cached connection is reported unhealthy, is
//! rate-limited to avoid reconnect storms, and the old connection is
//! dropped only after a grace delay so in-flight operations drain.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    EntryFields, MessageId, PendingConsumer, Result, StreamEntry, StreamTransport, TransportError,
};

/// Minimum pause between reconnect attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Grace delay before a replaced connection is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct ConnState {
    conn: Option<ConnectionManager>,
    last_attempt: Option<Instant>,
}

/// Lazily-reconnected shared connection guarded by an async mutex.
struct SharedConnection {
    client: Client,
    state: Mutex<ConnState>,
}

impl SharedConnection {
    fn new(client: Client) -> Self {
        Self {
            client,
            state: Mutex::new(ConnState::default()),
        }
    }

    async fn get(&self) -> Result<ConnectionManager> {
        let mut state = self.state.lock().await;
        if let Some(conn) = &state.conn {
            return Ok(conn.clone());
        }
        if let Some(last) = state.last_attempt {
            if last.elapsed() < RECONNECT_INTERVAL {
                return Err(TransportError::Connection(
                    "reconnect rate-limited, retry later".to_string(),
                ));
            }
        }
        state.last_attempt = Some(Instant::now());
        let conn = ConnectionManager::new(self.client.clone()).await?;
        info!("Connected to Redis");
        state.conn = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection; the old one is closed after a grace
    /// delay so in-flight operations can drain.
    async fn mark_unhealthy(&self) {
        let mut state = self.state.lock().await;
        if let Some(old) = state.conn.take() {
            warn!("Redis connection marked unhealthy, scheduling replacement");
            tokio::spawn(async move {
                tokio::time::sleep(CLOSE_GRACE).await;
                drop(old);
            });
        }
    }
}

/// Redis Streams implementation of the transport contract.
pub struct RedisStreamTransport {
    shared: SharedConnection,
}

impl RedisStreamTransport {
    /// Connect to Redis at `url` (e.g. `redis://localhost:6379`).
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let shared = SharedConnection::new(client);
        // Eager first connection so misconfiguration fails fast.
        shared.get().await?;
        Ok(Self { shared })
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        self.shared.get().await
    }

    /// Route an error through connection-health accounting.
    async fn classify(&self, e: redis::RedisError) -> TransportError {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            self.shared.mark_unhealthy().await;
        }
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else {
            TransportError::Redis(e)
        }
    }

    fn entry_from_stream_id(stream_id: StreamId) -> StreamEntry {
        let mut fields = EntryFields::new();
        for (key, value) in stream_id.map {
            match redis::from_redis_value::<String>(&value) {
                Ok(value) => fields.push(key, value),
                Err(e) => warn!(field = %key, error = %e, "Dropping non-string entry field"),
            }
        }
        StreamEntry {
            id: stream_id.id,
            fields,
        }
    }

    fn entries_from_read(reply: StreamReadReply) -> Vec<StreamEntry> {
        reply
            .keys
            .into_iter()
            .flat_map(|k| k.ids)
            .map(Self::entry_from_stream_id)
            .collect()
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    async fn append(&self, key: &str, entry_fields: &EntryFields) -> Result<MessageId> {
        let mut conn = self.conn().await?;
        let items: Vec<(String, String)> = entry_fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        match conn.xadd::<_, _, _, _, String>(key, "*", &items).await {
            Ok(id) => Ok(id),
            Err(e) => Err(self.classify(e).await),
        }
    }

    async fn create_group_if_absent(&self, key: &str, group: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(key, group, "0")
            .await
        {
            Ok(()) => {
                debug!(key = %key, group = %group, "Created consumer group");
                Ok(())
            }
            // Already exists: the create is idempotent by contract.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn().await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        let reply: StreamReadReply = match conn.xread_options(&[key], &[">"], &options).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.classify(e).await),
        };
        Ok(Self::entries_from_read(reply))
    }

    async fn read_self_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn().await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // Id "0" asks for this consumer's pending entries instead of news.
        let reply: StreamReadReply = match conn.xread_options(&[key], &["0"], &options).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.classify(e).await),
        };
        Ok(Self::entries_from_read(reply))
    }

    async fn pending_summary(&self, key: &str, group: &str) -> Result<Vec<PendingConsumer>> {
        let mut conn = self.conn().await?;
        let reply: StreamPendingReply = match conn.xpending(key, group).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.classify(e).await),
        };
        let consumers = match reply {
            StreamPendingReply::Empty => Vec::new(),
            StreamPendingReply::Data(data) => data.consumers,
        };
        Ok(consumers
            .into_iter()
            .map(|c| PendingConsumer {
                consumer: c.name,
                pending: c.pending,
            })
            .collect())
    }

    async fn pending_ids(
        &self,
        key: &str,
        group: &str,
        owner: &str,
        count: usize,
    ) -> Result<Vec<MessageId>> {
        let mut conn = self.conn().await?;
        let reply: StreamPendingCountReply = match conn
            .xpending_consumer_count(key, group, "-", "+", count, owner)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.classify(e).await),
        };
        Ok(reply.ids.into_iter().map(|p| p.id).collect())
    }

    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn().await?;
        let reply: StreamClaimReply = match conn
            .xclaim(key, group, consumer, min_idle.as_millis() as usize, ids)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return Err(self.classify(e).await),
        };
        Ok(reply
            .ids
            .into_iter()
            .map(Self::entry_from_stream_id)
            .collect())
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        match conn.xack::<_, _, _, i64>(key, group, &[id]).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.classify(e).await),
        }
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        // Escape glob metacharacters so the prefix matches literally.
        let mut pattern = String::with_capacity(prefix.len() + 1);
        for c in prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        let mut keys = Vec::new();
        {
            let mut iter = match conn.scan_match::<_, String>(&pattern).await {
                Ok(iter) => iter,
                Err(e) => return Err(self.classify(e).await),
            };
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    // `release` keeps the trait's no-op default: Redis Streams has no
    // unclaim primitive, so eager forward-cancellation relies on
    // idle-timeout reclaim by peers.
}

/// Integration tests requiring a running Redis instance.
///
/// Run with: cargo test --features redis -- --ignored
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_append_read_ack_round_trip() {
        let transport = RedisStreamTransport::new("redis://localhost:6379")
            .await
            .expect("Failed to connect to Redis");

        let key = format!("keelson-test:{}", uuid::Uuid::new_v4());
        transport.create_group_if_absent(&key, "g").await.unwrap();

        let mut fields = EntryFields::new();
        fields.push("Operation", "Login");
        let id = transport.append(&key, &fields).await.unwrap();
        assert!(!id.is_empty());

        let batch = transport.read_group(&key, "g", "c1", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields.get("Operation"), Some("Login"));

        let pending = transport
            .read_self_pending(&key, "g", "c1", 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        transport.ack(&key, "g", &batch[0].id).await.unwrap();
        assert!(transport
            .read_self_pending(&key, "g", "c1", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_claim_between_consumers() {
        let transport = RedisStreamTransport::new("redis://localhost:6379")
            .await
            .expect("Failed to connect to Redis");

        let key = format!("keelson-test:{}", uuid::Uuid::new_v4());
        transport.create_group_if_absent(&key, "g").await.unwrap();

        let mut fields = EntryFields::new();
        fields.push("Operation", "Login");
        transport.append(&key, &fields).await.unwrap();

        let batch = transport.read_group(&key, "g", "dead", 10).await.unwrap();
        let ids: Vec<MessageId> = batch.iter().map(|e| e.id.clone()).collect();

        let summary = transport.pending_summary(&key, "g").await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].consumer, "dead");

        let claimed = transport
            .claim(&key, "g", "alive", Duration::ZERO, &ids)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }
}
