//! Error types for Margin operations

use crate::{EntityId, EntityKind};
use thiserror::Error;

/// Input rejected before any optimistic write is applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Batch operation requires at least one id")]
    EmptyBatch,

    #[error("Local id {id} cannot be sent to the server")]
    LocalIdRejected { id: EntityId },
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failures reported by the remote store (or by the transport on the way to it).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("{kind} not found: {}", .id.as_ref().map(EntityId::as_str).unwrap_or("<batch>"))]
    NotFound {
        kind: EntityKind,
        id: Option<EntityId>,
    },

    #[error("Conflict on {kind}: {message}")]
    Conflict { kind: EntityKind, message: String },

    #[error("Not authenticated: {message}")]
    Unauthenticated { message: String },

    #[error("Rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

/// Local persistence failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend failed: {reason}")]
    Backend { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Master error type for everything that crosses a store boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{kind} {id} is not in the local collection")]
    UnknownEntity { kind: EntityKind, id: EntityId },

    #[error("Draft {id} not found")]
    DraftNotFound { id: EntityId },

    #[error("Offline and nothing cached for {key}")]
    OfflineWithoutCache { key: String },
}

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed input, nothing was applied.
    Validation,
    /// Network or server hiccup; safe to retry later.
    Transient,
    /// The target no longer exists.
    NotFound,
    /// The target was modified concurrently.
    Conflict,
    /// Credentials are missing or expired; the UI should re-authenticate.
    Unauthenticated,
    /// Local device storage failed.
    Storage,
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Validation(_) => ErrorClass::Validation,
            SyncError::Remote(remote) => match remote {
                RemoteError::Network { .. } | RemoteError::InvalidResponse { .. } => {
                    ErrorClass::Transient
                }
                RemoteError::NotFound { .. } => ErrorClass::NotFound,
                RemoteError::Conflict { .. } => ErrorClass::Conflict,
                RemoteError::Unauthenticated { .. } => ErrorClass::Unauthenticated,
                RemoteError::Rejected { status, .. } if *status >= 500 => ErrorClass::Transient,
                RemoteError::Rejected { .. } => ErrorClass::Validation,
            },
            SyncError::Storage(_) => ErrorClass::Storage,
            SyncError::UnknownEntity { .. } | SyncError::DraftNotFound { .. } => {
                ErrorClass::NotFound
            }
            SyncError::OfflineWithoutCache { .. } => ErrorClass::Transient,
        }
    }

    /// True when the caller should send the user through authentication again.
    pub fn requires_reauth(&self) -> bool {
        self.class() == ErrorClass::Unauthenticated
    }

    /// True when the same request may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Result type alias for Margin operations.
pub type SyncResult<T> = Result<T, SyncError>;
