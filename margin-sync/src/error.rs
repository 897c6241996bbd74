//! Errors raised while assembling a client session.

use margin_core::{RemoteError, StorageError, SyncError};
use thiserror::Error;

use crate::config::ConfigError;
use margin_storage::LmdbError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] LmdbError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
