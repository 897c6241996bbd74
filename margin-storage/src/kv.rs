//! Key-value persistence trait and the in-memory backend.

use crate::{Namespace, ScopedKey};
use async_trait::async_trait;
use margin_core::StorageError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Local persistence substrate.
///
/// Each call is an independent read-modify-write on one key; there is no
/// cross-key transaction. Implementations must be safe to share between tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &ScopedKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Unconditional overwrite.
    async fn set(&self, key: &ScopedKey, value: Vec<u8>) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &ScopedKey) -> Result<(), StorageError>;

    /// Keys (without namespace) stored under `namespace`, in byte order.
    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StorageError>;
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &ScopedKey,
) -> Result<Option<T>, StorageError> {
    match kv.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode a value as JSON and write it.
pub async fn set_json<T: Serialize + ?Sized>(
    kv: &dyn KvStore,
    key: &ScopedKey,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    kv.set(key, bytes).await
}

/// Volatile store, used in tests and when no storage path is configured.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &ScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(&key.encode()).cloned())
    }

    async fn set(&self, key: &ScopedKey, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key.encode(), value);
        Ok(())
    }

    async fn remove(&self, key: &ScopedKey) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.remove(&key.encode());
        Ok(())
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StorageError> {
        let prefix = ScopedKey::namespace_prefix(namespace);
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| ScopedKey::decode(key))
            .map(|key| key.key().to_string())
            .collect())
    }
}
