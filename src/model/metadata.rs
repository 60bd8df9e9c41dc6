//! Per-message metadata.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::StreamAddress;

/// Whether a message was produced in place or copied from another stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Produced directly onto this stream.
    #[default]
    Original,
    /// Forwarded/migrated from another stream; `Metadata::linked` points at
    /// the source message.
    Copy,
}

impl Origin {
    /// Wire tag for the fixed `Origin` entry field.
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Original => "original",
            Origin::Copy => "copy",
        }
    }

    /// Parse the wire tag back. Unknown tags fall back to `Original`.
    pub fn parse(s: &str) -> Origin {
        match s {
            "copy" => Origin::Copy,
            _ => Origin::Original,
        }
    }
}

/// Immutable record describing one message.
///
/// The message id is transport-assigned and opaque, monotonic within a
/// shard. `produced_at` is unix seconds (second precision is deliberate:
/// it participates in the wire layout).
///
/// Invariant: `linked` is present iff `origin == Copy`. Build instances
/// through [`Metadata::new`] and [`Metadata::copy_to`], which maintain it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Transport-assigned id; empty until the append returns.
    #[serde(default)]
    pub message_id: String,
    pub env: String,
    pub partition: String,
    pub shard: String,
    /// Name of the invoked operation.
    pub operation: String,
    /// Unix seconds.
    pub produced_at: i64,
    #[serde(default)]
    pub origin: Origin,
    /// Source message when `origin == Copy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<Box<Metadata>>,
}

impl Metadata {
    /// Metadata for a freshly produced message on `address`.
    pub fn new(address: &StreamAddress, operation: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            env: address.env.clone(),
            partition: address.partition.clone(),
            shard: address.shard.clone(),
            operation: operation.into(),
            produced_at: Utc::now().timestamp(),
            origin: Origin::Original,
            linked: None,
        }
    }

    /// Metadata for a copy of this message forwarded to `target`.
    ///
    /// The copy gets a fresh produced-at and an empty message id; this
    /// message becomes the copy's `linked` source.
    pub fn copy_to(&self, target: &StreamAddress) -> Self {
        Self {
            message_id: String::new(),
            env: target.env.clone(),
            partition: target.partition.clone(),
            shard: target.shard.clone(),
            operation: self.operation.clone(),
            produced_at: Utc::now().timestamp(),
            origin: Origin::Copy,
            linked: Some(Box::new(self.clone())),
        }
    }

    /// Logical uri of the stream this message lives on.
    pub fn uri(&self) -> String {
        if self.shard.is_empty() {
            self.partition.clone()
        } else {
            format!("{}:{}", self.partition, self.shard)
        }
    }

    /// The address this metadata was stamped with.
    pub fn address(&self) -> StreamAddress {
        StreamAddress {
            env: self.env.clone(),
            partition: self.partition.clone(),
            shard: self.shard.clone(),
        }
    }

    /// Serialize to the compact side-channel blob stored under the
    /// reserved entry field.
    pub fn to_blob(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse the side-channel blob, validating the origin/linked invariant.
    pub fn from_blob(blob: &str) -> Result<Self, MetadataError> {
        let meta: Metadata = serde_json::from_str(blob)?;
        meta.validate()?;
        Ok(meta)
    }

    /// Check the `linked iff Copy` invariant.
    pub fn validate(&self) -> Result<(), MetadataError> {
        match (self.origin, self.linked.is_some()) {
            (Origin::Copy, false) => Err(MetadataError::MissingLink),
            (Origin::Original, true) => Err(MetadataError::UnexpectedLink),
            _ => Ok(()),
        }
    }
}

/// Errors raised while decoding or validating metadata.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata blob is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("origin is Copy but no linked metadata is present")]
    MissingLink,

    #[error("origin is Original but linked metadata is present")]
    UnexpectedLink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_original_without_link() {
        let meta = Metadata::new(&StreamAddress::new("Kids", "HappySocks"), "Login");
        assert_eq!(meta.origin, Origin::Original);
        assert!(meta.linked.is_none());
        assert!(meta.validate().is_ok());
        assert_eq!(meta.uri(), "Kids:HappySocks");
    }

    #[test]
    fn test_copy_links_source() {
        let source = Metadata::new(&StreamAddress::new("Kids", "HappySocks"), "Login");
        let copy = source.copy_to(&StreamAddress::new("Man", "Socks"));

        assert_eq!(copy.origin, Origin::Copy);
        assert_eq!(copy.operation, "Login");
        assert_eq!(copy.uri(), "Man:Socks");
        let linked = copy.linked.as_ref().unwrap();
        assert_eq!(linked.origin, Origin::Original);
        assert_eq!(linked.uri(), "Kids:HappySocks");
        assert!(copy.validate().is_ok());
    }

    #[test]
    fn test_blob_round_trip() {
        let source = Metadata::new(&StreamAddress::new("Kids", "HappySocks"), "Erase");
        let copy = source.copy_to(&StreamAddress::new("Man", "Socks"));

        let blob = copy.to_blob().unwrap();
        let parsed = Metadata::from_blob(&blob).unwrap();
        assert_eq!(parsed, copy);
    }

    #[test]
    fn test_invariant_enforced_on_decode() {
        let mut meta = Metadata::new(&StreamAddress::new("Kids", "HappySocks"), "Login");
        meta.origin = Origin::Copy;
        let blob = meta.to_blob().unwrap();
        assert!(matches!(
            Metadata::from_blob(&blob),
            Err(MetadataError::MissingLink)
        ));
    }

    #[test]
    fn test_origin_wire_tags() {
        assert_eq!(Origin::parse(Origin::Copy.as_str()), Origin::Copy);
        assert_eq!(Origin::parse("anything-else"), Origin::Original);
    }
}
