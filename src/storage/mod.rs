pub mod parquet_writer;
pub mod rejected_writer;
pub mod s3;

use crate::config::StorageBackend;
use crate::error::{EtlError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use parquet_writer::{PartitionCommit, PartitionWriter};
pub use s3::S3ObjectStore;

/// Bucket + key of one object (or of a key prefix ending in `/`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Location of `name` under this prefix
    pub fn child(&self, name: &str) -> Self {
        let mut key = self.key.clone();
        if !key.is_empty() && !key.ends_with('/') {
            key.push('/');
        }
        key.push_str(name);
        Self::new(self.bucket.clone(), key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Object contents plus the entity tag used for conditional writes
#[derive(Debug, Clone)]
pub struct VersionedObject {
    pub data: Bytes,
    pub etag: String,
}

/// Precondition for [`ObjectStore::put_conditional`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// The object must not exist
    Absent,
    /// The object must still carry this entity tag
    Matches(String),
}

/// Object storage port used by the transform (input + output) and the run lease
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, location: &ObjectLocation) -> Result<Bytes>;

    /// `None` when the object does not exist
    async fn get_versioned(&self, location: &ObjectLocation) -> Result<Option<VersionedObject>>;

    async fn put(&self, location: &ObjectLocation, data: Bytes) -> Result<()>;

    /// Atomic compare-and-swap write. `Ok(false)` when the precondition failed.
    async fn put_conditional(
        &self,
        location: &ObjectLocation,
        data: Bytes,
        condition: PutCondition,
    ) -> Result<bool>;

    /// Full keys under `prefix` in `bucket`
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Deleting a missing object succeeds
    async fn delete(&self, location: &ObjectLocation) -> Result<()>;
}

/// Open the store selected by configuration
pub async fn open_store(backend: &StorageBackend) -> Result<Arc<dyn ObjectStore>> {
    match backend {
        StorageBackend::Local(root) => {
            info!("Using local object store at {}", root.display());
            Ok(Arc::new(LocalObjectStore::new(root)?))
        }
        StorageBackend::S3 => {
            let sdk_config = crate::config::load_aws_config().await;
            Ok(Arc::new(S3ObjectStore::new(&sdk_config)))
        }
    }
}

const TEMP_MARKER: &str = ".tmp-";

/// Filesystem-backed store: buckets are directories under `root`.
///
/// Writes go to a temp file and are renamed into place, so readers never see
/// a half-written object. Conditional writes are serialized in-process.
pub struct LocalObjectStore {
    root: PathBuf,
    cas_lock: Mutex<()>,
}

impl LocalObjectStore {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            cas_lock: Mutex::new(()),
        })
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            return Err(EtlError::Storage(format!("Invalid bucket name '{}'", bucket)));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf> {
        let mut path = self.bucket_dir(&location.bucket)?;
        let relative = Path::new(&location.key);
        let mut segments = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    segments += 1;
                }
                _ => {
                    return Err(EtlError::Storage(format!(
                        "Object key '{}' escapes its bucket",
                        location.key
                    )))
                }
            }
        }
        if segments == 0 {
            return Err(EtlError::Storage(format!("Empty object key for {}", location)));
        }
        Ok(path)
    }

    fn etag_of(data: &[u8]) -> String {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        format!("{:016x}-{}", hasher.finish(), data.len())
    }

    async fn read_optional(&self, location: &ObjectLocation) -> Result<Option<Bytes>> {
        let path = self.object_path(location)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, location: &ObjectLocation, data: &[u8]) -> Result<()> {
        let path = self.object_path(location)?;
        let parent = path
            .parent()
            .ok_or_else(|| EtlError::Storage(format!("No parent directory for {}", location)))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EtlError::Storage(format!("Invalid object name for {}", location)))?;
        let temp_path = parent.join(format!(".{}{}{}", file_name, TEMP_MARKER, std::process::id()));

        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, location: &ObjectLocation) -> Result<Bytes> {
        self.read_optional(location)
            .await?
            .ok_or_else(|| EtlError::Storage(format!("Object not found: {}", location)))
    }

    async fn get_versioned(&self, location: &ObjectLocation) -> Result<Option<VersionedObject>> {
        Ok(self.read_optional(location).await?.map(|data| VersionedObject {
            etag: Self::etag_of(&data),
            data,
        }))
    }

    async fn put(&self, location: &ObjectLocation, data: Bytes) -> Result<()> {
        self.write_atomic(location, &data).await
    }

    async fn put_conditional(
        &self,
        location: &ObjectLocation,
        data: Bytes,
        condition: PutCondition,
    ) -> Result<bool> {
        let _guard = self.cas_lock.lock().await;

        let current = self.read_optional(location).await?;
        let satisfied = match (&condition, &current) {
            (PutCondition::Absent, None) => true,
            (PutCondition::Matches(etag), Some(existing)) => Self::etag_of(existing) == *etag,
            _ => false,
        };
        if !satisfied {
            debug!("Precondition {:?} failed for {}", condition, location);
            return Ok(false);
        }

        self.write_atomic(location, &data).await?;
        Ok(true)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let mut keys = Vec::new();
        let mut pending = vec![bucket_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_dir) else {
                    continue;
                };
                let key = relative
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(TEMP_MARKER) {
                    continue;
                }
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<()> {
        let path = self.object_path(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_child() {
        let prefix = ObjectLocation::new("b", "processed/date=2024-01-01/trades/");
        assert_eq!(prefix.child("_SUCCESS").key, "processed/date=2024-01-01/trades/_SUCCESS");
        assert_eq!(ObjectLocation::new("b", "locks").child("job.lease").key, "locks/job.lease");
    }

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let (_dir, store) = store();
        let a = ObjectLocation::new("bucket", "processed/date=2024-01-01/t/part-00000.parquet");
        let b = ObjectLocation::new("bucket", "processed/date=2024-01-01/t/_SUCCESS");
        let other = ObjectLocation::new("bucket", "uploads/trades.csv");

        store.put(&a, Bytes::from_static(b"parquet")).await.unwrap();
        store.put(&b, Bytes::new()).await.unwrap();
        store.put(&other, Bytes::from_static(b"id,time\n")).await.unwrap();

        assert_eq!(store.get(&a).await.unwrap(), Bytes::from_static(b"parquet"));

        let keys = store.list("bucket", "processed/date=2024-01-01/t/").await.unwrap();
        assert_eq!(keys, vec![b.key.clone(), a.key.clone()]);

        store.delete(&a).await.unwrap();
        store.delete(&a).await.unwrap();
        assert!(store.get(&a).await.is_err());
        assert!(store.list("missing-bucket", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let (_dir, store) = store();
        let lock = ObjectLocation::new("locks", "locks/job.lease");

        assert!(store
            .put_conditional(&lock, Bytes::from_static(b"one"), PutCondition::Absent)
            .await
            .unwrap());
        assert!(!store
            .put_conditional(&lock, Bytes::from_static(b"two"), PutCondition::Absent)
            .await
            .unwrap());

        let current = store.get_versioned(&lock).await.unwrap().unwrap();
        assert_eq!(current.data, Bytes::from_static(b"one"));

        assert!(!store
            .put_conditional(
                &lock,
                Bytes::from_static(b"three"),
                PutCondition::Matches("stale".into())
            )
            .await
            .unwrap());
        assert!(store
            .put_conditional(
                &lock,
                Bytes::from_static(b"three"),
                PutCondition::Matches(current.etag)
            )
            .await
            .unwrap());
        assert_eq!(store.get(&lock).await.unwrap(), Bytes::from_static(b"three"));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_bucket() {
        let (_dir, store) = store();
        let escape = ObjectLocation::new("bucket", "../outside.csv");
        assert!(matches!(
            store.put(&escape, Bytes::new()).await,
            Err(EtlError::Storage(_))
        ));
        let bad_bucket = ObjectLocation::new("a/b", "key");
        assert!(store.get(&bad_bucket).await.is_err());
    }
}
