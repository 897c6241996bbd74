//! LMDB-backed durable key-value store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Every `set`/`remove` commits
//! its own write transaction, so a value is durable once the call returns.

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use margin_core::StorageError;

use crate::{KvStore, Namespace, ScopedKey};

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for StorageError {
    fn from(e: LmdbError) -> Self {
        StorageError::Backend {
            reason: e.to_string(),
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbError {
    LmdbError::Transaction(e.to_string())
}

pub struct LmdbKv {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbKv {
    /// Open (or create) the store under `path`, capped at `max_size_mb`.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        tracing::debug!(path = %path.as_ref().display(), max_size_mb, "opened LMDB store");
        Ok(Self { env, db })
    }

    fn collect_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let iter = self.db.prefix_iter(&rtxn, prefix).map_err(txn_error)?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(txn_error)?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

#[async_trait]
impl KvStore for LmdbKv {
    async fn get(&self, key: &ScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let value = self
            .db
            .get(&rtxn, &key.encode())
            .map_err(txn_error)?
            .map(<[u8]>::to_vec);
        Ok(value)
    }

    async fn set(&self, key: &ScopedKey, value: Vec<u8>) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, &key.encode(), &value)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    async fn remove(&self, key: &ScopedKey) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db.delete(&mut wtxn, &key.encode()).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(())
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StorageError> {
        let raw = self.collect_keys_with_prefix(&ScopedKey::namespace_prefix(namespace))?;
        Ok(raw
            .iter()
            .filter_map(|bytes| ScopedKey::decode(bytes))
            .map(|key| key.key().to_string())
            .collect())
    }
}
