//! In-memory stream transport.
//!
//! Implements the full consumer-group contract (pending sets, claims,
//! idle tracking) over process-local state. Ideal for:
//! - Single-process applications
//! - Testing the delivery protocol without external services

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{
    EntryFields, MessageId, PendingConsumer, Result, StreamEntry, StreamTransport, TransportError,
};

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    /// `None` after an explicit release: idle forever, claimable at once.
    delivered_at: Option<Instant>,
    delivery_count: u32,
}

impl PendingEntry {
    fn idle(&self) -> Duration {
        match self.delivered_at {
            Some(at) => at.elapsed(),
            None => Duration::MAX,
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: BTreeMap<MessageId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn entry_by_id(&self, id: &str) -> Option<&StreamEntry> {
        // Ids are zero-padded, so the entries vec is sorted by id.
        self.entries
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// Process-local stream transport.
///
/// Safe for concurrent use; every operation takes a short internal lock.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries appended under `key` (test/inspection helper).
    pub fn len(&self, key: &str) -> usize {
        self.streams
            .lock()
            .expect("transport lock poisoned")
            .get(key)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Pending count for `group` under `key` (test/inspection helper).
    pub fn pending_len(&self, key: &str, group: &str) -> usize {
        self.streams
            .lock()
            .expect("transport lock poisoned")
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn with_group<T>(
        &self,
        key: &str,
        group: &str,
        f: impl FnOnce(&mut StreamState, &str) -> Result<T>,
    ) -> Result<T> {
        let mut streams = self.streams.lock().expect("transport lock poisoned");
        let state = streams
            .get_mut(key)
            .ok_or_else(|| TransportError::Protocol(format!("no such stream: {key}")))?;
        if !state.groups.contains_key(group) {
            return Err(TransportError::Protocol(format!(
                "no such group: {group} on {key}"
            )));
        }
        f(state, group)
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn append(&self, key: &str, entry_fields: &EntryFields) -> Result<MessageId> {
        let mut streams = self.streams.lock().expect("transport lock poisoned");
        let state = streams.entry(key.to_string()).or_default();
        state.next_seq += 1;
        // Zero-padded so lexical order equals append order.
        let id = format!("{:016}-0", state.next_seq);
        state.entries.push(StreamEntry {
            id: id.clone(),
            fields: entry_fields.clone(),
        });
        Ok(id)
    }

    async fn create_group_if_absent(&self, key: &str, group: &str) -> Result<()> {
        let mut streams = self.streams.lock().expect("transport lock poisoned");
        let state = streams.entry(key.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.with_group(key, group, |state, group| {
            let end = (state.entries.len()).min(
                state.groups[group]
                    .cursor
                    .saturating_add(count),
            );
            let cursor = state.groups[group].cursor;
            let batch: Vec<StreamEntry> = state.entries[cursor..end].to_vec();
            let g = state.groups.get_mut(group).expect("group checked above");
            g.cursor = end;
            for entry in &batch {
                g.pending.insert(
                    entry.id.clone(),
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: Some(Instant::now()),
                        delivery_count: 1,
                    },
                );
            }
            Ok(batch)
        })
    }

    async fn read_self_pending(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.with_group(key, group, |state, group| {
            let ids: Vec<MessageId> = state.groups[group]
                .pending
                .iter()
                .filter(|(_, p)| p.consumer == consumer)
                .take(count)
                .map(|(id, _)| id.clone())
                .collect();
            let batch = ids
                .iter()
                .filter_map(|id| state.entry_by_id(id).cloned())
                .collect();
            Ok(batch)
        })
    }

    async fn pending_summary(&self, key: &str, group: &str) -> Result<Vec<PendingConsumer>> {
        self.with_group(key, group, |state, group| {
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for p in state.groups[group].pending.values() {
                *counts.entry(p.consumer.clone()).or_default() += 1;
            }
            Ok(counts
                .into_iter()
                .map(|(consumer, pending)| PendingConsumer { consumer, pending })
                .collect())
        })
    }

    async fn pending_ids(
        &self,
        key: &str,
        group: &str,
        owner: &str,
        count: usize,
    ) -> Result<Vec<MessageId>> {
        self.with_group(key, group, |state, group| {
            Ok(state.groups[group]
                .pending
                .iter()
                .filter(|(_, p)| p.consumer == owner)
                .take(count)
                .map(|(id, _)| id.clone())
                .collect())
        })
    }

    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>> {
        self.with_group(key, group, |state, group| {
            let mut claimed_ids = Vec::new();
            let g = state.groups.get_mut(group).expect("group checked above");
            for id in ids {
                if let Some(p) = g.pending.get_mut(id) {
                    if p.idle() >= min_idle {
                        p.consumer = consumer.to_string();
                        p.delivered_at = Some(Instant::now());
                        p.delivery_count += 1;
                        claimed_ids.push(id.clone());
                    }
                }
            }
            debug!(key = %key, claimed = claimed_ids.len(), "Claimed pending entries");
            Ok(claimed_ids
                .iter()
                .filter_map(|id| state.entry_by_id(id).cloned())
                .collect())
        })
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<()> {
        self.with_group(key, group, |state, group| {
            state
                .groups
                .get_mut(group)
                .expect("group checked above")
                .pending
                .remove(id);
            Ok(())
        })
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let streams = self.streams.lock().expect("transport lock poisoned");
        let mut keys: Vec<String> = streams
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Eager requeue: marks the entries idle-forever so any consumer's next
    /// claim pass picks them up immediately.
    async fn release(&self, key: &str, group: &str, ids: &[MessageId]) -> Result<()> {
        self.with_group(key, group, |state, group| {
            let g = state.groups.get_mut(group).expect("group checked above");
            for id in ids {
                if let Some(p) = g.pending.get_mut(id) {
                    p.delivered_at = None;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(op: &str) -> EntryFields {
        let mut f = EntryFields::new();
        f.push("Operation", op);
        f
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids() {
        let t = InMemoryTransport::new();
        let a = t.append("s", &fields("a")).await.unwrap();
        let b = t.append("s", &fields("b")).await.unwrap();
        assert!(b > a);
        assert_eq!(t.len("s"), 2);
    }

    #[tokio::test]
    async fn test_read_requires_group() {
        let t = InMemoryTransport::new();
        t.append("s", &fields("a")).await.unwrap();
        let err = t.read_group("s", "g", "c", 10).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_group_created_before_append_sees_history() {
        let t = InMemoryTransport::new();
        t.create_group_if_absent("s", "g").await.unwrap();
        t.append("s", &fields("a")).await.unwrap();
        t.append("s", &fields("b")).await.unwrap();

        let batch = t.read_group("s", "g", "c1", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].fields.get("Operation"), Some("a"));
    }

    #[tokio::test]
    async fn test_unacked_entries_stay_pending() {
        let t = InMemoryTransport::new();
        t.create_group_if_absent("s", "g").await.unwrap();
        t.append("s", &fields("a")).await.unwrap();

        let batch = t.read_group("s", "g", "c1", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(t.pending_len("s", "g"), 1);

        // New reads do not re-deliver pending entries...
        assert!(t.read_group("s", "g", "c1", 10).await.unwrap().is_empty());
        // ...but a self-pending read does.
        let pending = t.read_self_pending("s", "g", "c1", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, batch[0].id);

        t.ack("s", "g", &batch[0].id).await.unwrap();
        assert_eq!(t.pending_len("s", "g"), 0);
        assert!(t
            .read_self_pending("s", "g", "c1", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_claim_moves_ownership() {
        let t = InMemoryTransport::new();
        t.create_group_if_absent("s", "g").await.unwrap();
        t.append("s", &fields("a")).await.unwrap();

        let batch = t.read_group("s", "g", "dead", 10).await.unwrap();
        let ids: Vec<MessageId> = batch.iter().map(|e| e.id.clone()).collect();

        let claimed = t
            .claim("s", "g", "alive", Duration::ZERO, &ids)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // Former owner no longer sees the entry as its own.
        assert!(t
            .read_self_pending("s", "g", "dead", 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            t.read_self_pending("s", "g", "alive", 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_claim_honors_min_idle() {
        let t = InMemoryTransport::new();
        t.create_group_if_absent("s", "g").await.unwrap();
        t.append("s", &fields("a")).await.unwrap();

        let batch = t.read_group("s", "g", "c1", 10).await.unwrap();
        let ids: Vec<MessageId> = batch.iter().map(|e| e.id.clone()).collect();

        // Just-delivered entries are not idle enough.
        let claimed = t
            .claim("s", "g", "c2", Duration::from_secs(60), &ids)
            .await
            .unwrap();
        assert!(claimed.is_empty());

        // A released entry is idle forever and claimable at once.
        t.release("s", "g", &ids).await.unwrap();
        let claimed = t
            .claim("s", "g", "c2", Duration::from_secs(60), &ids)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_summary_groups_by_consumer() {
        let t = InMemoryTransport::new();
        t.create_group_if_absent("s", "g").await.unwrap();
        for i in 0..3 {
            t.append("s", &fields(&format!("op{i}"))).await.unwrap();
        }
        t.read_group("s", "g", "c1", 2).await.unwrap();
        t.read_group("s", "g", "c2", 1).await.unwrap();

        let summary = t.pending_summary("s", "g").await.unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].consumer, "c1");
        assert_eq!(summary[0].pending, 2);
        assert_eq!(summary[1].consumer, "c2");
        assert_eq!(summary[1].pending, 1);
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let t = InMemoryTransport::new();
        t.append("Kids:HappySocks", &fields("a")).await.unwrap();
        t.append("Kids:SadSocks", &fields("b")).await.unwrap();
        t.append("Man:Socks", &fields("c")).await.unwrap();

        let keys = t.keys_by_prefix("Kids:").await.unwrap();
        assert_eq!(keys, vec!["Kids:HappySocks", "Kids:SadSocks"]);
    }
}
