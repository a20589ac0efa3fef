use async_trait::async_trait;
use log::{debug, warn};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use super::{ObjectStore, Tags, validate_key};
use crate::errors::{Error, Result, StorageError};

pub(crate) const TAGS_SUFFIX: &str = ".tags.json";

/// Object store backed by a local directory. Tags live in a JSON sidecar next to the object.
pub struct FileObjectStore {
    root_path: PathBuf,
    temp_tag: String,
}

impl FileObjectStore {
    pub fn new(root_path: impl Into<PathBuf>, temp_tag: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            temp_tag: temp_tag.into(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root_path.join(key)
    }

    fn tags_path(&self, key: &str) -> PathBuf {
        self.root_path.join(format!("{}{}", key, TAGS_SUFFIX))
    }

    pub async fn tags(&self, key: &str) -> Result<Tags> {
        validate_key(key)?;
        match tokio::fs::read(self.tags_path(key)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Tags::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes temporary objects whose last write is older than `ttl`.
    /// Returns the number of objects removed.
    pub async fn purge_expired(&self, ttl: Duration) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(key) = name.strip_suffix(TAGS_SUFFIX) else {
                continue;
            };
            if !self.tags(key).await?.contains_key(&self.temp_tag) {
                continue;
            }
            let modified = match tokio::fs::metadata(self.object_path(key)).await {
                Ok(meta) => meta.modified()?,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= ttl {
                debug!("Purging temporary object {} (age {:?})", key, age);
                self.delete(key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        match tokio::fs::read(self.object_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::object_not_found(key)),
            Err(e) => Err(StorageError::Io(e.into()).into()),
        }
    }

    async fn put(&self, key: &str, data: &[u8], tags: Option<&Tags>) -> Result<()> {
        validate_key(key)?;
        tokio::fs::create_dir_all(&self.root_path).await?;
        tokio::fs::write(self.object_path(key), data).await?;
        match tags {
            Some(tags) if !tags.is_empty() => {
                tokio::fs::write(self.tags_path(key), serde_json::to_vec(tags)?).await?;
            }
            _ => {
                if let Err(e) = tokio::fs::remove_file(self.tags_path(key)).await
                    && e.kind() != ErrorKind::NotFound
                {
                    warn!("Failed to clear stale tags for {}: {}", key, e);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        for path in [self.object_path(key), self.tags_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(tokio::fs::try_exists(self.object_path(key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new(dir.path(), "tmp");

        store.put("img-1", b"payload", None).await.unwrap();
        assert_eq!(store.get("img-1").await.unwrap(), b"payload");
        assert!(store.exists("img-1").await.unwrap());

        store.delete("img-1").await.unwrap();
        assert!(!store.exists("img-1").await.unwrap());
        assert!(store.get("img-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_purge_only_touches_temporary_objects() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new(dir.path(), "tmp");
        let mut tags = Tags::new();
        tags.insert("tmp".to_string(), String::new());

        store.put("intermediate", b"a", Some(&tags)).await.unwrap();
        store.put("final", b"b", None).await.unwrap();
        assert!(store.tags("intermediate").await.unwrap().contains_key("tmp"));

        let removed = store.purge_expired(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.exists("intermediate").await.unwrap());
        assert!(store.exists("final").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_keeps_fresh_objects() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new(dir.path(), "tmp");
        let mut tags = Tags::new();
        tags.insert("tmp".to_string(), String::new());
        store.put("fresh", b"a", Some(&tags)).await.unwrap();

        let removed = store.purge_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.exists("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = FileObjectStore::new(dir.path(), "tmp");
        let err = store.put("../escape", b"x", None).await.unwrap_err();
        assert!(err.is_storage());
    }
}
