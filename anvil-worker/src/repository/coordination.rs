//! Distributed coordination store
//!
//! A key/value service used for cross-node discovery of which node owns
//! which build.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::StoreError;
use crate::sync::lock;

/// Repository trait for the coordination key/value store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Value at `key`, or `None` when it does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Every key/value pair whose key starts with `prefix`, ordered by key
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError>;
}

/// In-memory implementation of CoordinationStore
///
/// Sufficient for a single node; discovery across nodes needs [`super::ConsulStore`].
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(lock(&self.entries)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        lock(&self.entries).retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
