//! Object store interface
//!
//! The minimal bucket/object surface checkpoints and restores need. The real
//! transport lives outside this crate; two implementations ship here:
//! - `LocalObjectStore`: one directory per bucket under a root directory
//! - `MemoryObjectStore`: process-local maps, for tests and embedding

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{CloudError, CloudErrorCode};

/// Name and size of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
}

/// Bucket/object storage
///
/// Implementations must be safe to call from multiple upload threads at
/// once. Writes of a single object are all-or-nothing.
pub trait ObjectStore: Send + Sync {
    /// Create `bucket` if it does not exist
    fn create_bucket(&self, bucket: &str) -> Result<(), CloudError>;

    /// Store `data` under `key`, replacing any existing object
    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), CloudError>;

    /// Fetch the object stored under `key`
    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CloudError>;

    /// Metadata of the object stored under `key`
    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, CloudError>;

    /// Objects whose key starts with `prefix`, in key order
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, CloudError>;

    /// Remove `key`; removing a missing object succeeds
    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CloudError>;
}

/// Object store backed by a local directory
///
/// Bucket `b` is the directory `<root>/b`; object `x/y` is the file
/// `<root>/b/x/y`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Store rooted at `root`, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalObjectStore { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, CloudError> {
        validate_component(bucket)?;
        let dir = self.root.join(bucket);
        if !dir.is_dir() {
            return Err(CloudError::no_such_bucket(bucket));
        }
        Ok(dir)
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, CloudError> {
        let mut path = self.bucket_dir(bucket)?;
        for part in key.split('/').filter(|p| !p.is_empty()) {
            validate_component(part)?;
            path.push(part);
        }
        Ok(path)
    }

    fn collect(dir: &Path, key_prefix: &str, out: &mut Vec<ObjectMeta>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let key = if key_prefix.is_empty() {
                name
            } else {
                format!("{}/{}", key_prefix, name)
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                Self::collect(&entry.path(), &key, out)?;
            } else if file_type.is_file() {
                out.push(ObjectMeta {
                    key,
                    size: entry.metadata()?.len(),
                });
            }
        }
        Ok(())
    }
}

fn validate_component(part: &str) -> Result<(), CloudError> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !part.starts_with('.') => Ok(()),
        _ => Err(CloudError::new(
            CloudErrorCode::InvalidArgument,
            format!("invalid object path component {:?}", part),
        )),
    }
}

impl ObjectStore for LocalObjectStore {
    fn create_bucket(&self, bucket: &str) -> Result<(), CloudError> {
        validate_component(bucket)?;
        fs::create_dir_all(self.root.join(bucket))?;
        Ok(())
    }

    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), CloudError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CloudError::new(CloudErrorCode::InvalidArgument, "empty object key"))?;
        let temp = path.with_file_name(format!(".{}.upload", file_name));
        fs::write(&temp, data)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CloudError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CloudError::no_such_key(key),
            _ => e.into(),
        })
    }

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, CloudError> {
        let path = self.object_path(bucket, key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(ObjectMeta {
                key: key.to_string(),
                size: meta.len(),
            }),
            Ok(_) => Err(CloudError::no_such_key(key)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CloudError::no_such_key(key)),
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, CloudError> {
        let dir = self.bucket_dir(bucket)?;
        let mut out = Vec::new();
        Self::collect(&dir, "", &mut out)?;
        out.retain(|m| m.key.starts_with(prefix));
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CloudError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

type Bucket = BTreeMap<String, Vec<u8>>;

/// Object store held in memory
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<BTreeMap<String, Bucket>>,
}

impl MemoryObjectStore {
    /// Empty store with no buckets
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects in `bucket`, 0 if it does not exist
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map_or(0, |b| b.len())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn create_bucket(&self, bucket: &str) -> Result<(), CloudError> {
        self.buckets.write().entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), CloudError> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::no_such_bucket(bucket))?;
        objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CloudError> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| CloudError::no_such_bucket(bucket))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| CloudError::no_such_key(key))
    }

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, CloudError> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| CloudError::no_such_bucket(bucket))?;
        objects
            .get(key)
            .map(|data| ObjectMeta {
                key: key.to_string(),
                size: data.len() as u64,
            })
            .ok_or_else(|| CloudError::no_such_key(key))
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, CloudError> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| CloudError::no_such_bucket(bucket))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| ObjectMeta {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CloudError> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::no_such_bucket(bucket))?;
        objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    static_assertions::assert_impl_all!(LocalObjectStore: Send, Sync);
    static_assertions::assert_impl_all!(MemoryObjectStore: Send, Sync);

    /// Behavior every implementation must share
    fn exercise(store: &dyn ObjectStore) {
        assert!(store.put_object("b", "k", b"x").unwrap_err().is_not_found());

        store.create_bucket("b").unwrap();
        store.create_bucket("b").unwrap();

        store.put_object("b", "db/000001.tbl", b"one").unwrap();
        store.put_object("b", "db/CHECKPOINT", b"{}").unwrap();
        store.put_object("b", "other/x", b"zz").unwrap();

        assert_eq!(store.get_object("b", "db/000001.tbl").unwrap(), b"one");
        assert_eq!(store.head_object("b", "db/CHECKPOINT").unwrap().size, 2);

        let listed: Vec<String> = store
            .list_objects("b", "db/")
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(listed, vec!["db/000001.tbl", "db/CHECKPOINT"]);

        store.put_object("b", "db/000001.tbl", b"replaced").unwrap();
        assert_eq!(store.get_object("b", "db/000001.tbl").unwrap(), b"replaced");

        store.delete_object("b", "db/CHECKPOINT").unwrap();
        store.delete_object("b", "db/CHECKPOINT").unwrap();
        let err = store.get_object("b", "db/CHECKPOINT").unwrap_err();
        assert_eq!(err.code, CloudErrorCode::NoSuchKey);
        assert!(store.head_object("b", "db/CHECKPOINT").unwrap_err().is_not_found());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryObjectStore::new());
    }

    #[test]
    fn test_local_store() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        exercise(&store);
        assert!(dir.path().join("b/db/000001.tbl").is_file());
    }

    #[test]
    fn test_local_store_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        store.create_bucket("b").unwrap();
        let err = store.put_object("b", "../escape", b"x").unwrap_err();
        assert_eq!(err.code, CloudErrorCode::InvalidArgument);
        assert!(store.create_bucket("..").is_err());
    }

    #[test]
    fn test_memory_object_count() {
        let store = MemoryObjectStore::new();
        store.create_bucket("b").unwrap();
        store.put_object("b", "a", b"1").unwrap();
        assert_eq!(store.object_count("b"), 1);
        assert_eq!(store.object_count("missing"), 0);
    }
}
