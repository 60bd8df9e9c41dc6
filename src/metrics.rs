//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters. All
//! instruments are lazily initialized and only exist behind the `otel`
//! feature.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("keelson"));

/// Total announcements appended by producers.
pub static PRODUCED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("keelson.produced.total")
        .with_description("Total announcements produced")
        .build()
});

/// Total announcements delivered to subscribers.
pub static CONSUMED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("keelson.consumed.total")
        .with_description("Total announcements delivered to subscribers")
        .build()
});

/// Total entries claimed from dead peers.
pub static CLAIMED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("keelson.claimed.total")
        .with_description("Total pending entries claimed from other consumers")
        .build()
});

/// Create a uri label.
pub fn uri_attr(uri: &str) -> KeyValue {
    KeyValue::new("uri", uri.to_string())
}

/// Create an env label.
pub fn env_attr(env: &str) -> KeyValue {
    KeyValue::new("env", env.to_string())
}

/// Create an operation label.
pub fn operation_attr(operation: &str) -> KeyValue {
    KeyValue::new("operation", operation.to_string())
}
