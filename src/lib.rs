//! Keelson - event-sourcing messaging backbone.
//!
//! Producers publish operation invocations as immutable announcements
//! onto partitioned, sharded streams; consumers subscribe via consumer
//! groups and replay those invocations exactly-once-per-group with
//! at-least-once delivery.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keelson::consumer::{ConsumerBuilder, OperationRouter};
//! use keelson::model::{Bucket, StreamAddress};
//! use keelson::producer::ProducerBuilder;
//! use keelson::transport::InMemoryTransport;
//!
//! let transport = Arc::new(InMemoryTransport::new());
//!
//! let producer = ProducerBuilder::new(
//!     transport.clone(),
//!     StreamAddress::new("Kids", "HappySocks"),
//! )
//! .build();
//! producer
//!     .send_operation("Login", Bucket::new().with("username", &b"admin"[..]))
//!     .await?;
//!
//! let subscription = ConsumerBuilder::new(
//!     transport,
//!     StreamAddress::new("Kids", "HappySocks"),
//! )
//! .with_group("socks")
//! .with_handler(Arc::new(OperationRouter::new().on("Login", |announcement| async move {
//!     // ...
//!     Ok(())
//! })))
//! .subscribe()
//! .await?;
//! ```

pub mod consumer;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod model;
pub mod producer;
pub mod resilience;
pub mod storage;
pub mod telemetry;
pub mod transport;
