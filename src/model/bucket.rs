//! Payload buckets: immutable maps from segment key to opaque bytes.

use std::collections::BTreeMap;

use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Category mask used to narrow a storage strategy to the buckets it
    /// should handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BucketCategories: u8 {
        const SEGMENTS = 0b01;
        const INTERCEPTIONS = 0b10;
    }
}

/// One concrete bucket category of an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketCategory {
    /// Classified operation arguments.
    Segments,
    /// Opaque interceptor-attached data.
    Interceptions,
}

impl BucketCategory {
    /// Both categories, in the order they are laid out on the wire.
    pub const ALL: [BucketCategory; 2] = [BucketCategory::Segments, BucketCategory::Interceptions];

    /// The flag bit for this category.
    pub fn flag(self) -> BucketCategories {
        match self {
            BucketCategory::Segments => BucketCategories::SEGMENTS,
            BucketCategory::Interceptions => BucketCategories::INTERCEPTIONS,
        }
    }

    /// Entry-field namespace for storage hints of this category.
    pub fn hint_prefix(self) -> &'static str {
        match self {
            BucketCategory::Segments => "seg",
            BucketCategory::Interceptions => "int",
        }
    }
}

/// Immutable mapping from segment key to opaque byte payload.
///
/// Buckets are value types: two buckets that went through independent
/// save/load round trips compare equal when their contents match. All
/// "mutation" is copy-on-write; values are ref-counted (`Bytes`) so the
/// copies share payload memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    entries: BTreeMap<String, Bytes>,
}

impl Bucket {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a bucket with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Return a bucket without `key`.
    pub fn without(mut self, key: &str) -> Self {
        self.entries.remove(key);
        self
    }

    /// Look up a segment by key.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Segment keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the subset of entries whose key satisfies `predicate`.
    pub fn filter_keys(&self, predicate: impl Fn(&str) -> bool) -> Bucket {
        self.entries
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Merge `other` into this bucket; keys in `other` win on conflict.
    pub fn merge(mut self, other: Bucket) -> Bucket {
        self.entries.extend(other.entries);
        self
    }
}

impl FromIterator<(String, Bytes)> for Bucket {
    fn from_iter<I: IntoIterator<Item = (String, Bytes)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_on_write_leaves_original_untouched() {
        let base = Bucket::new().with("user", &b"admin"[..]);
        let extended = base.clone().with("password", &b"1234"[..]);

        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.get("user").unwrap().as_ref(), b"admin");
    }

    #[test]
    fn test_value_equality_across_instances() {
        let a = Bucket::new().with("k", &b"v"[..]);
        let b = Bucket::new().with("k", Bytes::copy_from_slice(b"v"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_filter_keys() {
        let bucket = Bucket::new()
            .with("email", &b"a@b"[..])
            .with("name", &b"a"[..]);
        let sensitive = bucket.filter_keys(|k| k == "email");
        assert_eq!(sensitive.len(), 1);
        assert!(sensitive.get("email").is_some());
    }

    #[test]
    fn test_merge_other_wins() {
        let a = Bucket::new().with("k", &b"old"[..]).with("a", &b"1"[..]);
        let b = Bucket::new().with("k", &b"new"[..]);
        let merged = a.merge(b);
        assert_eq!(merged.get("k").unwrap().as_ref(), b"new");
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_category_flags() {
        assert!(BucketCategories::all().contains(BucketCategory::Segments.flag()));
        assert_ne!(
            BucketCategory::Segments.flag(),
            BucketCategory::Interceptions.flag()
        );
    }
}
