//! Local-only draft records.

use crate::{EntityId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Content that so far exists only on this device.
///
/// A draft never receives a server identifier: promotion creates a brand new
/// entity and removes the draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub id: EntityId,
    pub title: Option<String>,
    pub content: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Draft {
    /// Build a draft with a freshly minted local id.
    pub fn new(input: DraftInput) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_local(),
            title: input.title,
            content: input.content,
            created_at: now,
            updated_at: now,
        }
    }

    /// Title to use when the user never typed one: the first non-blank line.
    pub fn derived_title(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.trim().to_string();
        }
        self.content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.trim_start_matches('#').trim().to_string())
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| "Untitled".to_string())
    }
}

/// User input for a new draft.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftInput {
    pub title: Option<String>,
    pub content: String,
}

impl DraftInput {
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            title: None,
            content: content.into(),
        }
    }
}

/// Where a promoted draft should land.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteContext {
    /// Parent record the new entity belongs to (a source for a note, for instance).
    pub parent_id: Option<EntityId>,
    /// Overrides the draft's own title.
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_draft_is_local() {
        let draft = Draft::new(DraftInput::with_content("hello"));
        assert!(draft.id.is_local());
        assert_eq!(draft.created_at, draft.updated_at);
    }

    #[test]
    fn test_derived_title_prefers_explicit_title() {
        let draft = Draft::new(DraftInput {
            title: Some("  Reading list ".to_string()),
            content: "ignored".to_string(),
        });
        assert_eq!(draft.derived_title(), "Reading list");
    }

    #[test]
    fn test_derived_title_from_first_line() {
        let draft = Draft::new(DraftInput::with_content("\n\n# Groceries\n- milk"));
        assert_eq!(draft.derived_title(), "Groceries");

        let empty = Draft::new(DraftInput::with_content("   \n"));
        assert_eq!(empty.derived_title(), "Untitled");
    }
}
