//! The unit of delivery.

use super::{Bucket, BucketCategory, Metadata};

/// One delivered event: metadata plus the two payload buckets.
///
/// Immutable once constructed; channels hand out references or clones,
/// never mutate in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub metadata: Metadata,
    /// Classified operation arguments.
    pub segments: Bucket,
    /// Opaque interceptor-attached data.
    pub interceptors_data: Bucket,
}

impl Announcement {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            segments: Bucket::new(),
            interceptors_data: Bucket::new(),
        }
    }

    pub fn with_segments(mut self, segments: Bucket) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_interceptors_data(mut self, data: Bucket) -> Self {
        self.interceptors_data = data;
        self
    }

    /// The bucket for a category.
    pub fn bucket(&self, category: BucketCategory) -> &Bucket {
        match category {
            BucketCategory::Segments => &self.segments,
            BucketCategory::Interceptions => &self.interceptors_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamAddress;

    #[test]
    fn test_bucket_selection_by_category() {
        let ann = Announcement::new(Metadata::new(
            &StreamAddress::new("Kids", "HappySocks"),
            "Register",
        ))
        .with_segments(Bucket::new().with("user", &b"u"[..]))
        .with_interceptors_data(Bucket::new().with("auditor", &b"x"[..]));

        assert!(ann.bucket(BucketCategory::Segments).get("user").is_some());
        assert!(ann
            .bucket(BucketCategory::Interceptions)
            .get("auditor")
            .is_some());
    }
}
