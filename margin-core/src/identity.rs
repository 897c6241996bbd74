//! Identity types for Margin entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Prefix carried by every identifier minted on the device.
///
/// Server identifiers never start with this prefix, so any call site can tell
/// a draft apart from a persisted record by looking at the id alone.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Identifier of an entity or draft.
///
/// Server identifiers are opaque strings assigned by the remote store and never
/// change once assigned. Local identifiers are minted with [`EntityId::new_local`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an identifier received from the server.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh local identifier (UUIDv7, so drafts sort by creation time).
    pub fn new_local() -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, Uuid::now_v7()))
    }

    /// True for identifiers that only exist on this device.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_carry_prefix() {
        let id = EntityId::new_local();
        assert!(id.is_local());
        assert!(id.as_str().starts_with(LOCAL_ID_PREFIX));
    }

    #[test]
    fn test_server_ids_are_not_local() {
        assert!(!EntityId::new("task_8f2c").is_local());
        assert!(!EntityId::new("localhost-note").is_local());
    }

    #[test]
    fn test_local_ids_are_unique() {
        let a = EntityId::new_local();
        let b = EntityId::new_local();
        assert_ne!(a, b);
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = EntityId::new("abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
