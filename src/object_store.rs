use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::ObjectStoreError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
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
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Object storage collaborator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Writes an object. With `overwrite == false` an existing key is an error.
    async fn write(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), ObjectStoreError>;
}

/// In-process object store keyed by `(bucket, key)`.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, location: &ObjectLocation, bytes: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .await
            .insert((location.bucket.clone(), location.key.clone()), bytes.into());
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn write(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), ObjectStoreError> {
        let mut objects = self.objects.write().await;
        let slot = (bucket.to_string(), key.to_string());
        if !overwrite && objects.contains_key(&slot) {
            return Err(ObjectStoreError::Io(format!(
                "object s3://{bucket}/{key} already exists"
            )));
        }
        objects.insert(slot, bytes);
        Ok(())
    }
}
