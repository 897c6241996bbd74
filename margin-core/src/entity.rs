//! Entity traits shared by every server-owned record kind.
//!
//! A single generic store is built on top of these traits instead of one
//! hand-written store per kind. [`Entity`] is the minimum contract; the
//! capability traits ([`Statused`], [`Ordered`], [`Draftable`]) unlock the
//! store operations that only make sense for some kinds.

use crate::{Draft, EntityId, OrderKey, PromoteContext, Timestamp, ValidationError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Entity kind discriminator, also used for endpoint paths and cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Note,
    Source,
    Conversation,
    File,
}

impl EntityKind {
    /// Plural collection name, used as the REST path segment.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Note => "notes",
            EntityKind::Source => "sources",
            EntityKind::Conversation => "conversations",
            EntityKind::File => "files",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// A server-owned record.
pub trait Entity:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Payload sent to the server to create a record.
    type Create: Clone + fmt::Debug + Serialize + Send + Sync + 'static;

    /// Partial update; every field is optional and absent fields are untouched.
    type Patch: Clone + fmt::Debug + Default + Serialize + Send + Sync + 'static;

    const KIND: EntityKind;

    fn id(&self) -> &EntityId;

    fn created_at(&self) -> Timestamp;

    fn updated_at(&self) -> Timestamp;

    /// Stamp a new `updated_at`.
    fn touch(&mut self, at: Timestamp);

    /// Merge `patch` into `self`.
    fn apply_patch(&mut self, patch: &Self::Patch);

    fn validate_create(_input: &Self::Create) -> Result<(), ValidationError> {
        Ok(())
    }

    fn validate_patch(_patch: &Self::Patch) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Kinds with a categorical lane (inbox/active/archive and friends).
pub trait Statused: Entity {
    type Status: Copy
        + fmt::Debug
        + PartialEq
        + Eq
        + Hash
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    fn status(&self) -> Self::Status;

    /// A patch that changes only the status.
    fn status_patch(status: Self::Status) -> Self::Patch;
}

/// Kinds the user can reorder by hand.
pub trait Ordered: Entity {
    fn order_key(&self) -> Option<OrderKey>;

    /// A patch that changes only the order key.
    fn order_patch(key: OrderKey) -> Self::Patch;
}

/// Kinds that can be born as a local draft.
pub trait Draftable: Entity {
    fn create_from_draft(draft: &Draft, context: &PromoteContext) -> Self::Create;

    /// A patch carrying edited body text, used by autosave on persisted records.
    fn content_patch(content: &str) -> Self::Patch;
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn require_non_empty_opt(
    field: &str,
    value: Option<&String>,
) -> Result<(), ValidationError> {
    match value {
        Some(value) if value.trim().is_empty() => Err(ValidationError::invalid(
            field,
            "must not be blank when provided",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        assert_eq!(EntityKind::Task.collection(), "tasks");
        assert_eq!(EntityKind::Conversation.to_string(), "conversations");
    }

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("title", "Buy milk").is_ok());
        assert_eq!(
            require_non_empty("title", "   "),
            Err(ValidationError::RequiredFieldMissing {
                field: "title".to_string()
            })
        );
        assert!(require_non_empty_opt("title", None).is_ok());
        assert!(require_non_empty_opt("title", Some(&String::new())).is_err());
    }
}
