//! Byte storage for source images and transform artifacts.

pub mod fs;

pub use fs::FileObjectStore;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

use crate::errors::{Error, Result, StorageError};

pub type Tags = HashMap<String, String>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `StorageError::NotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, key: &str, data: &[u8], tags: Option<&Tags>) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.contains("..")
        || key.ends_with(fs::TAGS_SUFFIX)
    {
        return Err(StorageError::InvalidKey(key.to_string()).into());
    }
    Ok(())
}

/// Object store kept in process memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, (Vec<u8>, Tags)>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self, key: &str) -> Option<Tags> {
        self.objects.get(key).map(|entry| entry.1.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| Error::object_not_found(key))
    }

    async fn put(&self, key: &str, data: &[u8], tags: Option<&Tags>) -> Result<()> {
        validate_key(key)?;
        self.objects.insert(
            key.to_string(),
            (data.to_vec(), tags.cloned().unwrap_or_default()),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }
}
