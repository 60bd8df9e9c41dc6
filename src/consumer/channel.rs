//! The competing-consumers subscription protocol.
//!
//! A partition subscription continuously discovers shard keys and runs
//! one independent task per shard. Within a shard, processing is strictly
//! sequential in stream order; that ordering is load-bearing for the
//! same-shard delivery guarantee and for forward-cancellation of batch
//! remainders.
//!
//! Each shard loop iteration:
//! 1. reads a batch, preferring recovery of this consumer's own pending
//!    entries after a start or a read failure,
//! 2. claims stale entries from dead peers once enough empty batches
//!    have accumulated,
//! 3. backs off adaptively while the shard stays idle,
//! 4. processes entries in order, reconstructing announcements through
//!    the storage chain and delivering them with an [`Ack`](super::Ack).

use std::collections::HashSet;
use std::sync::Arc;

use backon::BackoffBuilder;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::ack::{Ack, BatchScope};
use super::subscription::EventFlow;
use super::{ConsumerError, ConsumerPlan, IdleOptions, Result};
use crate::model::{Announcement, BucketCategory, Metadata, Origin, StreamAddress};
use crate::resilience;
use crate::storage::chain;
use crate::telemetry;
use crate::transport::{fields, MessageId, StreamEntry, CHANNEL_TYPE_TAG};

/// Run a subscription until its plan token is cancelled.
pub(crate) async fn run(plan: Arc<ConsumerPlan>, flow: Arc<EventFlow>) {
    if plan.address.is_partition_only() {
        run_partition(plan, flow).await;
    } else {
        run_shard(plan.clone(), plan.address.clone(), flow).await;
    }
}

/// Continuous shard discovery under a partition.
///
/// New shards may appear at any time (e.g. producers started after this
/// consumer); every scan spawns subscriptions for keys not seen before.
async fn run_partition(plan: Arc<ConsumerPlan>, flow: Arc<EventFlow>) {
    let prefix = plan.address.shard_prefix();
    let token = plan.cancellation.clone();
    let mut known: HashSet<String> = HashSet::new();
    let mut tasks = JoinSet::new();
    let mut backoff_iter = resilience::discovery_backoff().build();

    info!(partition = %plan.address.partition, prefix = %prefix, "Partition subscription started");

    while !token.is_cancelled() {
        match plan.transport.keys_by_prefix(&prefix).await {
            Ok(keys) => {
                backoff_iter = resilience::discovery_backoff().build();
                for key in keys {
                    if !known.insert(key.clone()) {
                        continue;
                    }
                    match plan.address.resolve_shard_key(&key) {
                        Some(address) => {
                            info!(shard = %key, "Discovered shard");
                            tasks.spawn(run_shard(plan.clone(), address, flow.clone()));
                        }
                        None => debug!(key = %key, "Ignoring non-shard key"),
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(plan.options.discovery_interval) => {}
                }
            }
            Err(e) => {
                let delay = backoff_iter
                    .next()
                    .unwrap_or(std::time::Duration::from_secs(5));
                warn!(
                    partition = %plan.address.partition,
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    "Shard discovery failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    while tasks.join_next().await.is_some() {}
    debug!(partition = %plan.address.partition, "Partition subscription stopped");
}

/// Adaptive idle backoff: monotonically non-decreasing up to the
/// configured max, reset by any non-empty batch.
struct IdleDelay {
    options: IdleOptions,
    current: Option<std::time::Duration>,
}

impl IdleDelay {
    fn new(options: IdleOptions) -> Self {
        Self {
            options,
            current: None,
        }
    }

    fn next(&mut self) -> std::time::Duration {
        let next = match self.current {
            None => self.options.initial,
            Some(d) => (d * self.options.factor.max(1)).min(self.options.max),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// One shard's subscription loop.
async fn run_shard(plan: Arc<ConsumerPlan>, address: StreamAddress, flow: Arc<EventFlow>) {
    let key = address.key();
    let token = plan.cancellation.clone();

    info!(
        shard = %key,
        group = %plan.options.group,
        consumer = %plan.consumer_name,
        "Shard subscription started"
    );

    if !ensure_group(&plan, &key, &token).await {
        return;
    }

    let mut first_batch_or_failure = true;
    let mut empty_batches: u32 = 0;
    let mut delay = IdleDelay::new(plan.options.idle.clone());

    while !token.is_cancelled() {
        let mut batch = read_batch(&plan, &key, &mut first_batch_or_failure).await;

        if batch.is_empty() {
            empty_batches = empty_batches.saturating_add(1);
            if empty_batches >= plan.options.claim.empty_batch_threshold {
                batch = claim_stale(&plan, &key).await;
            }
        }

        if batch.is_empty() {
            let d = delay.next();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(d) => {}
            }
            continue;
        }

        empty_batches = 0;
        delay.reset();
        process_batch(&plan, &address, &key, batch, &flow).await;
    }

    debug!(shard = %key, "Shard subscription stopped");
}

/// Idempotent create-if-absent of the consumer group, retried until it
/// succeeds or the subscription is cancelled.
async fn ensure_group(plan: &ConsumerPlan, key: &str, token: &CancellationToken) -> bool {
    let mut backoff_iter = resilience::discovery_backoff().build();
    loop {
        match plan
            .transport
            .create_group_if_absent(key, &plan.options.group)
            .await
        {
            Ok(()) => return true,
            Err(e) => {
                let delay = backoff_iter
                    .next()
                    .unwrap_or(std::time::Duration::from_secs(5));
                warn!(shard = %key, error = %e, "Failed to ensure consumer group, retrying");
                tokio::select! {
                    _ = token.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Read one batch. After a start or a failure, this consumer's own
/// pending (unacked) entries are recovered first, ahead of new messages.
/// Errors are logged and produce an empty batch; they never escape the
/// loop.
async fn read_batch(
    plan: &ConsumerPlan,
    key: &str,
    first_batch_or_failure: &mut bool,
) -> Vec<StreamEntry> {
    let group = &plan.options.group;
    let consumer = &plan.consumer_name;
    let count = plan.options.batch_size;

    let result = if *first_batch_or_failure {
        match plan
            .transport
            .read_self_pending(key, group, consumer, count)
            .await
        {
            Ok(pending) if !pending.is_empty() => {
                info!(
                    shard = %key,
                    consumer = %consumer,
                    count = pending.len(),
                    "Recovered own pending entries"
                );
                Ok(pending)
            }
            Ok(_) => plan.transport.read_group(key, group, consumer, count).await,
            Err(e) => Err(e),
        }
    } else {
        plan.transport.read_group(key, group, consumer, count).await
    };

    match result {
        Ok(batch) => {
            *first_batch_or_failure = false;
            batch
        }
        Err(e) => {
            warn!(shard = %key, error = %e, "Read failed, treating as empty batch");
            *first_batch_or_failure = true;
            Vec::new()
        }
    }
}

/// Scan the group's pending summary and claim stale entries from the
/// first peer that yields any. Per-peer failures never abort the scan.
async fn claim_stale(plan: &ConsumerPlan, key: &str) -> Vec<StreamEntry> {
    let group = &plan.options.group;
    let consumer = &plan.consumer_name;

    let summary = match plan.transport.pending_summary(key, group).await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(shard = %key, error = %e, "Pending summary failed");
            return Vec::new();
        }
    };

    for peer in summary.iter().filter(|p| &p.consumer != consumer) {
        let ids = match plan
            .transport
            .pending_ids(key, group, &peer.consumer, plan.options.claim.page_size)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(shard = %key, peer = %peer.consumer, error = %e, "Pending ids failed, scanning next peer");
                continue;
            }
        };
        if ids.is_empty() {
            continue;
        }

        match plan
            .transport
            .claim(key, group, consumer, plan.options.claim.min_idle, &ids)
            .await
        {
            Ok(entries) if !entries.is_empty() => {
                info!(
                    shard = %key,
                    peer = %peer.consumer,
                    count = entries.len(),
                    "Claimed stale entries from peer"
                );
                #[cfg(feature = "otel")]
                crate::metrics::CLAIMED_TOTAL.add(
                    entries.len() as u64,
                    &[crate::metrics::uri_attr(key)],
                );
                return entries;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(shard = %key, peer = %peer.consumer, error = %e, "Claim failed, scanning next peer");
                continue;
            }
        }
    }

    Vec::new()
}

/// Deliver one batch sequentially, honoring forward-cancellation.
async fn process_batch(
    plan: &Arc<ConsumerPlan>,
    address: &StreamAddress,
    key: &str,
    batch: Vec<StreamEntry>,
    flow: &Arc<EventFlow>,
) {
    let ids: Vec<MessageId> = batch.iter().map(|e| e.id.clone()).collect();
    let scope = BatchScope::new(
        plan.transport.clone(),
        key.to_string(),
        plan.options.group.to_string(),
        ids,
    );

    // Deliberately no subscription-token check here: cancellation stops
    // the loop after the in-flight batch finishes. Only forward
    // cancellation skips the batch remainder.
    for entry in batch {
        if scope.is_cancelled() {
            break;
        }
        scope.begin_entry(&entry.id);
        let id = entry.id.clone();
        if let Err(e) = process_entry(plan, address, key, entry, flow, &scope).await {
            error!(shard = %key, message_id = %id, error = %e, "Entry processing failed");
        }
    }
}

/// Decode, reconstruct, and deliver one entry.
async fn process_entry(
    plan: &Arc<ConsumerPlan>,
    address: &StreamAddress,
    key: &str,
    entry: StreamEntry,
    flow: &Arc<EventFlow>,
    scope: &Arc<BatchScope>,
) -> Result<()> {
    let group = &plan.options.group;

    // Foreign-writer interop: entries with another channel tag are acked
    // and skipped so they never wedge the shard.
    if entry.fields.get(fields::CHANNEL_TYPE) != Some(CHANNEL_TYPE_TAG) {
        debug!(shard = %key, message_id = %entry.id, "Skipping foreign entry");
        if let Err(e) = plan.transport.ack(key, group, &entry.id).await {
            warn!(shard = %key, message_id = %entry.id, error = %e, "Failed to ack foreign entry");
        }
        return Ok(());
    }

    let metadata = decode_metadata(address, &entry)?;

    let segments = match chain::load_bucket(
        &plan.strategies,
        &metadata,
        BucketCategory::Segments,
        &entry.fields,
    )
    .await
    {
        Ok(bucket) => bucket,
        Err(e) => {
            warn!(
                shard = %key,
                message_id = %entry.id,
                operation = %metadata.operation,
                error = %e,
                "Failed to load segments bucket"
            );
            Default::default()
        }
    };
    let interceptors_data = match chain::load_bucket(
        &plan.strategies,
        &metadata,
        BucketCategory::Interceptions,
        &entry.fields,
    )
    .await
    {
        Ok(bucket) => bucket,
        Err(e) => {
            warn!(
                shard = %key,
                message_id = %entry.id,
                operation = %metadata.operation,
                error = %e,
                "Failed to load interceptors bucket"
            );
            Default::default()
        }
    };

    let ack = Ack::new(
        plan.transport.clone(),
        key.to_string(),
        group.to_string(),
        entry.id.clone(),
        scope.clone(),
    );

    let span = info_span!(
        "consumer.process",
        message_id = %entry.id,
        uri = %metadata.uri(),
        operation = %metadata.operation,
    );
    let age = Utc::now().timestamp() - metadata.produced_at;
    let treat_as_parent = age >= 0 && (age as u64) <= plan.options.trace_parent_window.as_secs();
    telemetry::adopt_trace_fields(&span, &entry.fields, treat_as_parent);

    let announcement = Announcement::new(metadata)
        .with_segments(segments)
        .with_interceptors_data(interceptors_data);

    flow.on_message(announcement, ack).instrument(span).await
}

/// Rebuild metadata from the fixed indexed fields plus the plan's
/// address; the side-channel blob contributes the linked source for
/// copied messages.
fn decode_metadata(address: &StreamAddress, entry: &StreamEntry) -> Result<Metadata> {
    let operation = entry
        .fields
        .get(fields::OPERATION)
        .ok_or(ConsumerError::MissingField {
            field: fields::OPERATION,
            id: entry.id.clone(),
        })?;
    let produced_at = entry
        .fields
        .get(fields::PRODUCED_AT)
        .ok_or(ConsumerError::MissingField {
            field: fields::PRODUCED_AT,
            id: entry.id.clone(),
        })?
        .parse::<i64>()
        .map_err(|_| ConsumerError::MissingField {
            field: fields::PRODUCED_AT,
            id: entry.id.clone(),
        })?;
    let origin = Origin::parse(entry.fields.get(fields::ORIGIN).unwrap_or_default());

    let linked = match entry.fields.get(fields::META_SLOT) {
        Some(blob) => match Metadata::from_blob(blob) {
            Ok(meta) => meta.linked,
            Err(e) => {
                warn!(message_id = %entry.id, error = %e, "Unreadable metadata blob, continuing from fixed fields");
                None
            }
        },
        None => None,
    };
    // The blob is advisory for linkage only; a copy without a readable
    // blob degrades to an unlinked original rather than failing delivery,
    // keeping the linked-iff-copy invariant either way.
    let (origin, linked) = match (origin, linked) {
        (Origin::Copy, Some(linked)) => (Origin::Copy, Some(linked)),
        _ => (Origin::Original, None),
    };

    Ok(Metadata {
        message_id: entry.id.clone(),
        env: address.env.clone(),
        partition: address.partition.clone(),
        shard: address.shard.clone(),
        operation: operation.to_string(),
        produced_at,
        origin,
        linked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EntryFields;

    fn entry(fields_list: &[(&str, &str)]) -> StreamEntry {
        StreamEntry {
            id: "0000000000000001-0".to_string(),
            fields: fields_list
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<EntryFields>(),
        }
    }

    #[test]
    fn test_decode_metadata_from_fixed_fields() {
        let address = StreamAddress::new("Kids", "HappySocks");
        let meta = decode_metadata(
            &address,
            &entry(&[
                (fields::OPERATION, "Login"),
                (fields::PRODUCED_AT, "1700000000"),
                (fields::ORIGIN, "original"),
            ]),
        )
        .unwrap();

        assert_eq!(meta.message_id, "0000000000000001-0");
        assert_eq!(meta.operation, "Login");
        assert_eq!(meta.produced_at, 1_700_000_000);
        assert_eq!(meta.origin, Origin::Original);
        assert_eq!(meta.uri(), "Kids:HappySocks");
    }

    #[test]
    fn test_decode_metadata_requires_operation() {
        let address = StreamAddress::new("Kids", "HappySocks");
        let err = decode_metadata(&address, &entry(&[(fields::PRODUCED_AT, "1700000000")]))
            .unwrap_err();
        assert!(matches!(err, ConsumerError::MissingField { field, .. } if field == fields::OPERATION));
    }

    #[test]
    fn test_decode_metadata_unreadable_blob_degrades() {
        let address = StreamAddress::new("Kids", "HappySocks");
        let meta = decode_metadata(
            &address,
            &entry(&[
                (fields::OPERATION, "Login"),
                (fields::PRODUCED_AT, "1700000000"),
                (fields::ORIGIN, "copy"),
                (fields::META_SLOT, "{not json"),
            ]),
        )
        .unwrap();
        // Copy without a readable link degrades to an unlinked original,
        // keeping the linked-iff-copy invariant.
        assert_eq!(meta.origin, Origin::Original);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_idle_delay_grows_to_cap_and_resets() {
        let mut delay = IdleDelay::new(IdleOptions {
            initial: std::time::Duration::from_millis(1),
            factor: 2,
            max: std::time::Duration::from_millis(4),
        });
        assert_eq!(delay.next(), std::time::Duration::from_millis(1));
        assert_eq!(delay.next(), std::time::Duration::from_millis(2));
        assert_eq!(delay.next(), std::time::Duration::from_millis(4));
        assert_eq!(delay.next(), std::time::Duration::from_millis(4));
        delay.reset();
        assert_eq!(delay.next(), std::time::Duration::from_millis(1));
    }
}
