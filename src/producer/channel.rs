//! The producer send pipeline.

use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use super::{ProducerError, ProducerPlan, Result};
use crate::model::{Announcement, Bucket, BucketCategory, Metadata, StreamAddress};
use crate::resilience;
use crate::storage::chain;
use crate::telemetry;
use crate::transport::{fields, EntryFields, MessageId, CHANNEL_TYPE_TAG, ZERO_MESSAGE_ID};

/// Append pipeline for one stream address.
///
/// `send` fans the announcement's buckets across the storage-strategy
/// chain, builds the wire entry, and appends it under the plan's
/// resilience policy. No partial, half-written announcement is ever
/// considered delivered: any storage or append failure fails the call.
pub struct ProducerChannel {
    plan: ProducerPlan,
}

impl ProducerChannel {
    pub(crate) fn new(plan: ProducerPlan) -> Self {
        Self { plan }
    }

    pub fn address(&self) -> &StreamAddress {
        &self.plan.address
    }

    /// Build and send an announcement for `operation`.
    ///
    /// Applies the plan's segmentation strategies to `segments`, gathers
    /// interceptor data, and runs the full send pipeline.
    pub async fn send_operation(
        &self,
        operation: impl Into<String>,
        segments: Bucket,
    ) -> Result<MessageId> {
        let operation = operation.into();
        let metadata = Metadata::new(&self.plan.address, &operation);

        let mut segments = segments;
        for strategy in self.plan.segmentations.iter() {
            segments = strategy.segment(&operation, segments)?;
        }

        let mut interceptors_data = Bucket::new();
        for interceptor in self.plan.interceptors.iter() {
            let data = interceptor.intercept(&metadata, &segments).await?;
            interceptors_data = interceptors_data.with(interceptor.name(), data);
        }

        self.send(
            Announcement::new(metadata)
                .with_segments(segments)
                .with_interceptors_data(interceptors_data),
        )
        .await
    }

    /// Forward a consumed announcement onto this channel's stream.
    ///
    /// The forwarded message carries `Origin::Copy` and links back to the
    /// source metadata; segments and interceptor data are carried over
    /// unchanged.
    pub async fn forward(&self, source: &Announcement) -> Result<MessageId> {
        let metadata = source.metadata.copy_to(&self.plan.address);
        self.send(
            Announcement::new(metadata)
                .with_segments(source.segments.clone())
                .with_interceptors_data(source.interceptors_data.clone()),
        )
        .await
    }

    /// Send a fully-formed announcement and return the transport-assigned
    /// message id.
    pub async fn send(&self, announcement: Announcement) -> Result<MessageId> {
        let metadata = &announcement.metadata;
        let uri = metadata.uri();
        let span = info_span!(
            "producer.send",
            uri = %uri,
            operation = %metadata.operation,
        );

        async {
            // Correlation id for out-of-band storage addressing; the
            // authoritative message id is assigned by the append below.
            let correlation_id = Uuid::new_v4().to_string();

            let mut entry = EntryFields::new();
            entry.push(fields::MESSAGE_ID, correlation_id.clone());
            entry.push(fields::OPERATION, metadata.operation.clone());
            entry.push(fields::PRODUCED_AT, metadata.produced_at.to_string());
            entry.push(fields::CHANNEL_TYPE, CHANNEL_TYPE_TAG);
            entry.push(fields::ORIGIN, metadata.origin.as_str());
            entry.push(fields::META_SLOT, metadata.to_blob()?);

            for category in BucketCategory::ALL {
                let hints = chain::save_bucket(
                    &self.plan.strategies,
                    &correlation_id,
                    announcement.bucket(category),
                    category,
                    metadata,
                )
                .await
                .map_err(|e| {
                    error!(
                        correlation_id = %correlation_id,
                        env = %metadata.env,
                        uri = %uri,
                        operation = %metadata.operation,
                        category = ?category,
                        error = %e,
                        "Storage strategy failed, send aborted"
                    );
                    e
                })?;
                entry.extend(hints);
            }

            // Trace propagation shares the same extensible field list as
            // storage hints.
            telemetry::inject_trace_fields(&mut entry);

            let id = self.append_with_retry(&entry, metadata).await?;

            #[cfg(feature = "otel")]
            crate::metrics::PRODUCED_TOTAL.add(
                1,
                &[
                    crate::metrics::uri_attr(&uri),
                    crate::metrics::env_attr(&metadata.env),
                ],
            );

            debug!(
                message_id = %id,
                uri = %uri,
                operation = %metadata.operation,
                "Announcement appended"
            );
            Ok(id)
        }
        .instrument(span)
        .await
    }

    /// Append under the plan's resilience policy (default 3 retries).
    async fn append_with_retry(
        &self,
        entry: &EntryFields,
        metadata: &Metadata,
    ) -> Result<MessageId> {
        let key = self.plan.address.key();
        let mut last_error = None;

        for (attempt, delay) in resilience::attempts(self.plan.send_policy.clone()).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.plan.transport.append(&key, entry).await {
                Ok(id) if id.is_empty() => {
                    // Defensive default: never fail the caller for a falsy id.
                    warn!(
                        uri = %metadata.uri(),
                        operation = %metadata.operation,
                        "Transport returned no id for append"
                    );
                    return Ok(ZERO_MESSAGE_ID.to_string());
                }
                Ok(id) => return Ok(id),
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        env = %metadata.env,
                        uri = %metadata.uri(),
                        operation = %metadata.operation,
                        error = %e,
                        "Append failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ProducerError::Transport(last_error.unwrap_or_else(|| {
            crate::transport::TransportError::Timeout("append retries exhausted".to_string())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{ProducerBuilder, ProducerInterceptor};
    use crate::storage::{FilteredProducerStrategy, ProducerStorageStrategy, StorageError};
    use crate::transport::{InMemoryTransport, StreamTransport, TransportError};
    use crate::model::BucketCategories;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn channel(transport: Arc<InMemoryTransport>) -> ProducerChannel {
        ProducerBuilder::new(transport, StreamAddress::new("Kids", "HappySocks")).build()
    }

    async fn read_one(transport: &InMemoryTransport, key: &str) -> crate::transport::StreamEntry {
        transport.create_group_if_absent(key, "probe").await.unwrap();
        let mut batch = transport.read_group(key, "probe", "p", 1).await.unwrap();
        batch.remove(0)
    }

    #[tokio::test]
    async fn test_send_writes_fixed_fields_and_inline_hints() {
        let transport = Arc::new(InMemoryTransport::new());
        let channel = channel(transport.clone());

        let id = channel
            .send_operation("Login", Bucket::new().with("username", &b"admin"[..]))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let entry = read_one(&transport, "Kids:HappySocks").await;
        assert_eq!(entry.fields.get(fields::OPERATION), Some("Login"));
        assert_eq!(entry.fields.get(fields::CHANNEL_TYPE), Some(CHANNEL_TYPE_TAG));
        assert_eq!(entry.fields.get(fields::ORIGIN), Some("original"));
        assert!(entry.fields.get(fields::PRODUCED_AT).is_some());
        assert!(entry.fields.get(fields::META_SLOT).is_some());
        // Zero registered strategies: segments go through the inline default.
        assert!(entry.fields.get("seg~username").is_some());
    }

    #[tokio::test]
    async fn test_interceptor_data_rides_along() {
        struct Auditor;

        #[async_trait]
        impl ProducerInterceptor for Auditor {
            fn name(&self) -> &str {
                "auditor"
            }

            async fn intercept(&self, _metadata: &Metadata, _segments: &Bucket) -> super::Result<Bytes> {
                Ok(Bytes::from_static(b"seen"))
            }
        }

        let transport = Arc::new(InMemoryTransport::new());
        let channel = ProducerBuilder::new(
            transport.clone(),
            StreamAddress::new("Kids", "HappySocks"),
        )
        .with_interceptor(Arc::new(Auditor))
        .build();

        channel
            .send_operation("Login", Bucket::new())
            .await
            .unwrap();

        let entry = read_one(&transport, "Kids:HappySocks").await;
        assert!(entry.fields.get("int~auditor").is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_fails_the_send() {
        struct Broken;

        #[async_trait]
        impl ProducerStorageStrategy for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            async fn save_bucket(
                &self,
                _id: &str,
                _bucket: &Bucket,
                _category: crate::model::BucketCategory,
                _metadata: &Metadata,
            ) -> crate::storage::Result<EntryFields> {
                Err(StorageError::Save("backend down".to_string()))
            }
        }

        let transport = Arc::new(InMemoryTransport::new());
        let channel = ProducerBuilder::new(
            transport.clone(),
            StreamAddress::new("Kids", "HappySocks"),
        )
        .with_storage_strategy(FilteredProducerStrategy::new(
            Arc::new(Broken),
            BucketCategories::SEGMENTS,
        ))
        .build();

        let result = channel
            .send_operation("Login", Bucket::new().with("k", &b"v"[..]))
            .await;
        assert!(matches!(result, Err(ProducerError::Storage(_))));
        // Nothing was appended.
        assert_eq!(transport.len("Kids:HappySocks"), 0);
    }

    #[tokio::test]
    async fn test_append_retries_then_surfaces_transport_error() {
        struct FailingTransport;

        #[async_trait]
        impl StreamTransport for FailingTransport {
            async fn append(
                &self,
                _key: &str,
                _entry_fields: &EntryFields,
            ) -> crate::transport::Result<MessageId> {
                Err(TransportError::Timeout("append".to_string()))
            }

            async fn create_group_if_absent(
                &self,
                _key: &str,
                _group: &str,
            ) -> crate::transport::Result<()> {
                Ok(())
            }

            async fn read_group(
                &self,
                _key: &str,
                _group: &str,
                _consumer: &str,
                _count: usize,
            ) -> crate::transport::Result<Vec<crate::transport::StreamEntry>> {
                Ok(Vec::new())
            }

            async fn read_self_pending(
                &self,
                _key: &str,
                _group: &str,
                _consumer: &str,
                _count: usize,
            ) -> crate::transport::Result<Vec<crate::transport::StreamEntry>> {
                Ok(Vec::new())
            }

            async fn pending_summary(
                &self,
                _key: &str,
                _group: &str,
            ) -> crate::transport::Result<Vec<crate::transport::PendingConsumer>> {
                Ok(Vec::new())
            }

            async fn pending_ids(
                &self,
                _key: &str,
                _group: &str,
                _owner: &str,
                _count: usize,
            ) -> crate::transport::Result<Vec<MessageId>> {
                Ok(Vec::new())
            }

            async fn claim(
                &self,
                _key: &str,
                _group: &str,
                _consumer: &str,
                _min_idle: Duration,
                _ids: &[MessageId],
            ) -> crate::transport::Result<Vec<crate::transport::StreamEntry>> {
                Ok(Vec::new())
            }

            async fn ack(&self, _key: &str, _group: &str, _id: &str) -> crate::transport::Result<()> {
                Ok(())
            }

            async fn keys_by_prefix(&self, _prefix: &str) -> crate::transport::Result<Vec<String>> {
                Ok(Vec::new())
            }
        }

        let channel = ProducerBuilder::new(
            Arc::new(FailingTransport),
            StreamAddress::new("Kids", "HappySocks"),
        )
        .with_send_policy(
            backon::ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(1))
                .with_max_times(2),
        )
        .build();

        let result = channel.send_operation("Login", Bucket::new()).await;
        assert!(matches!(
            result,
            Err(ProducerError::Transport(TransportError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_forward_marks_copy_and_links_source() {
        let transport = Arc::new(InMemoryTransport::new());
        let source_channel = channel(transport.clone());
        source_channel
            .send_operation("Login", Bucket::new().with("username", &b"admin"[..]))
            .await
            .unwrap();

        let source_entry = read_one(&transport, "Kids:HappySocks").await;
        let source_meta =
            Metadata::from_blob(source_entry.fields.get(fields::META_SLOT).unwrap()).unwrap();
        let source = Announcement::new(source_meta)
            .with_segments(Bucket::new().with("username", &b"admin"[..]));

        let target = ProducerBuilder::new(transport.clone(), StreamAddress::new("Man", "Socks"))
            .build();
        target.forward(&source).await.unwrap();

        let forwarded = read_one(&transport, "Man:Socks").await;
        assert_eq!(forwarded.fields.get(fields::ORIGIN), Some("copy"));
        let meta = Metadata::from_blob(forwarded.fields.get(fields::META_SLOT).unwrap()).unwrap();
        assert_eq!(meta.origin, crate::model::Origin::Copy);
        let linked = meta.linked.as_ref().unwrap();
        assert_eq!(linked.origin, crate::model::Origin::Original);
        assert_eq!(linked.uri(), "Kids:HappySocks");
    }
}
