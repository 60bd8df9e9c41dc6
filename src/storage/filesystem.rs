//! Content-addressed filesystem storage strategy.
//!
//! Persists bucket values out-of-band under SHA-256 content hashes:
//! identical payloads share storage and corruption is detected on
//! retrieval. The stream entry carries one hint per segment key whose
//! value is the content hash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use super::{
    ConsumerStorageStrategy, ProducerStorageStrategy, Result, StorageError,
};
use crate::model::{Bucket, BucketCategory, Metadata};
use crate::transport::EntryFields;

/// Hint field key for one offloaded segment: `{cat}.fs~{segment key}`.
///
/// The `.fs` marker keeps filesystem hints disjoint from inline hints so
/// both strategies can contribute keys of the same category.
fn hint_key(category: BucketCategory, segment: &str) -> String {
    format!("{}.fs~{}", category.hint_prefix(), segment)
}

fn compute_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Filesystem-backed storage strategy.
pub struct FilesystemStorageStrategy {
    base_path: PathBuf,
}

impl FilesystemStorageStrategy {
    /// Create the strategy, ensuring the base directory exists.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    /// Payloads are sharded by the first two hash characters to keep
    /// directories small.
    fn payload_path(&self, hash: &str) -> PathBuf {
        self.base_path.join(&hash[..2]).join(hash)
    }

    async fn put(&self, payload: &[u8]) -> Result<String> {
        let hash = compute_hash(payload);
        let path = self.payload_path(&hash);
        if fs::try_exists(&path).await? {
            // Content-addressed: identical payload already stored.
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, payload).await?;
        Ok(hash)
    }

    async fn get(&self, hint: &str, hash: &str) -> Result<Bytes> {
        if hash.len() < 2 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::MalformedHint {
                hint: hint.to_string(),
                reason: "not a content hash".to_string(),
            });
        }
        let path = self.payload_path(hash);
        let payload = fs::read(&path)
            .await
            .map_err(|e| StorageError::Load(format!("{}: {e}", path.display())))?;
        let actual = compute_hash(&payload);
        if actual != hash {
            return Err(StorageError::Integrity {
                hint: hint.to_string(),
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(Bytes::from(payload))
    }
}

#[async_trait]
impl ProducerStorageStrategy for FilesystemStorageStrategy {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn save_bucket(
        &self,
        id: &str,
        bucket: &Bucket,
        category: BucketCategory,
        metadata: &Metadata,
    ) -> Result<EntryFields> {
        let mut hints = EntryFields::new();
        for (key, value) in bucket.iter() {
            let hash = self.put(value).await?;
            hints.push(hint_key(category, key), hash);
        }
        debug!(
            id = %id,
            uri = %metadata.uri(),
            operation = %metadata.operation,
            segments = bucket.len(),
            "Offloaded bucket to filesystem"
        );
        Ok(hints)
    }
}

#[async_trait]
impl ConsumerStorageStrategy for FilesystemStorageStrategy {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn load_bucket(
        &self,
        _metadata: &Metadata,
        prev: Bucket,
        category: BucketCategory,
        hints: &EntryFields,
    ) -> Result<Bucket> {
        let prefix = format!("{}.fs~", category.hint_prefix());
        let mut bucket = prev;
        for (field, hash) in hints.iter() {
            if let Some(segment) = field.strip_prefix(&prefix) {
                let payload = self.get(field, hash).await?;
                bucket = bucket.with(segment, payload);
            }
        }
        Ok(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamAddress;
    use tempfile::TempDir;

    fn meta() -> Metadata {
        Metadata::new(&StreamAddress::new("Kids", "HappySocks"), "Login")
    }

    async fn create_strategy() -> (FilesystemStorageStrategy, TempDir) {
        let dir = TempDir::new().unwrap();
        let strategy = FilesystemStorageStrategy::new(dir.path()).await.unwrap();
        (strategy, dir)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (strategy, _dir) = create_strategy().await;
        let bucket = Bucket::new()
            .with("email", &b"kid@example.com"[..])
            .with("payload", vec![7u8; 1024]);

        let hints = strategy
            .save_bucket("1-0", &bucket, BucketCategory::Segments, &meta())
            .await
            .unwrap();
        assert_eq!(hints.len(), 2);

        let loaded = strategy
            .load_bucket(&meta(), Bucket::new(), BucketCategory::Segments, &hints)
            .await
            .unwrap();
        assert_eq!(loaded, bucket);
    }

    #[tokio::test]
    async fn test_identical_payloads_deduplicate() {
        let (strategy, _dir) = create_strategy().await;
        let a = strategy.put(b"same bytes").await.unwrap();
        let b = strategy.put(b"same bytes").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let (strategy, _dir) = create_strategy().await;
        let hash = strategy.put(b"original").await.unwrap();
        fs::write(strategy.payload_path(&hash), b"tampered")
            .await
            .unwrap();

        let err = strategy.get("seg.fs~x", &hash).await.unwrap_err();
        assert!(matches!(err, StorageError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_chains_onto_previous_bucket() {
        let (strategy, _dir) = create_strategy().await;
        let offloaded = Bucket::new().with("blob", vec![1u8; 64]);
        let hints = strategy
            .save_bucket("1-0", &offloaded, BucketCategory::Segments, &meta())
            .await
            .unwrap();

        let prev = Bucket::new().with("user", &b"admin"[..]);
        let combined = strategy
            .load_bucket(&meta(), prev, BucketCategory::Segments, &hints)
            .await
            .unwrap();
        assert_eq!(combined.len(), 2);
        assert!(combined.get("user").is_some());
        assert!(combined.get("blob").is_some());
    }
}
