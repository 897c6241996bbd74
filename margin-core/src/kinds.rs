//! Concrete entity kinds of the knowledge app.

use crate::entity::{require_non_empty, require_non_empty_opt};
use crate::{
    Draft, Draftable, Entity, EntityId, EntityKind, OrderKey, Ordered, PromoteContext, Statused,
    Timestamp, ValidationError,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// TASKS
// ============================================================================

/// Lane a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Inbox,
    Active,
    Archived,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub title: String,
    pub notes: Option<String>,
    pub status: TaskStatus,
    pub order: Option<OrderKey>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTask {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderKey>,
}

impl CreateTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            notes: None,
            status: None,
            order: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderKey>,
}

impl Entity for Task {
    type Create = CreateTask;
    type Patch = TaskPatch;
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn created_at(&self) -> Timestamp {
        self.created_at
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(order) = patch.order {
            self.order = Some(order);
        }
    }

    fn validate_create(input: &CreateTask) -> Result<(), ValidationError> {
        require_non_empty("title", &input.title)
    }

    fn validate_patch(patch: &TaskPatch) -> Result<(), ValidationError> {
        require_non_empty_opt("title", patch.title.as_ref())
    }
}

impl Statused for Task {
    type Status = TaskStatus;

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn status_patch(status: TaskStatus) -> TaskPatch {
        TaskPatch {
            status: Some(status),
            ..TaskPatch::default()
        }
    }
}

impl Ordered for Task {
    fn order_key(&self) -> Option<OrderKey> {
        self.order
    }

    fn order_patch(key: OrderKey) -> TaskPatch {
        TaskPatch {
            order: Some(key),
            ..TaskPatch::default()
        }
    }
}

impl Draftable for Task {
    fn create_from_draft(draft: &Draft, context: &PromoteContext) -> CreateTask {
        let title = context
            .title
            .clone()
            .unwrap_or_else(|| draft.derived_title());
        let notes = Some(draft.content.clone()).filter(|c| !c.trim().is_empty());
        CreateTask {
            title,
            notes,
            status: Some(TaskStatus::Inbox),
            order: None,
        }
    }

    fn content_patch(content: &str) -> TaskPatch {
        TaskPatch {
            notes: Some(content.to_string()),
            ..TaskPatch::default()
        }
    }
}

// ============================================================================
// NOTES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: EntityId,
    pub title: String,
    pub content: String,
    pub source_id: Option<EntityId>,
    pub order: Option<OrderKey>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNote {
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<EntityId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderKey>,
}

impl Entity for Note {
    type Create = CreateNote;
    type Patch = NotePatch;
    const KIND: EntityKind = EntityKind::Note;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn created_at(&self) -> Timestamp {
        self.created_at
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn apply_patch(&mut self, patch: &NotePatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(order) = patch.order {
            self.order = Some(order);
        }
    }

    fn validate_create(input: &CreateNote) -> Result<(), ValidationError> {
        require_non_empty("title", &input.title)?;
        if let Some(source_id) = &input.source_id {
            if source_id.is_local() {
                return Err(ValidationError::LocalIdRejected {
                    id: source_id.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_patch(patch: &NotePatch) -> Result<(), ValidationError> {
        require_non_empty_opt("title", patch.title.as_ref())
    }
}

impl Ordered for Note {
    fn order_key(&self) -> Option<OrderKey> {
        self.order
    }

    fn order_patch(key: OrderKey) -> NotePatch {
        NotePatch {
            order: Some(key),
            ..NotePatch::default()
        }
    }
}

impl Draftable for Note {
    fn create_from_draft(draft: &Draft, context: &PromoteContext) -> CreateNote {
        CreateNote {
            title: context
                .title
                .clone()
                .unwrap_or_else(|| draft.derived_title()),
            content: draft.content.clone(),
            source_id: context.parent_id.clone(),
        }
    }

    fn content_patch(content: &str) -> NotePatch {
        NotePatch {
            content: Some(content.to_string()),
            ..NotePatch::default()
        }
    }
}

// ============================================================================
// SOURCES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Unread,
    Reading,
    Done,
}

/// An external document (article, paper, video) the user collects notes about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: EntityId,
    pub title: String,
    pub url: String,
    pub status: SourceStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSource {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SourceStatus>,
}

fn validate_url(url: &str) -> Result<(), ValidationError> {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.contains(char::is_whitespace) => Ok(()),
        _ => Err(ValidationError::invalid(
            "url",
            "must be an http(s) url without spaces",
        )),
    }
}

impl Entity for Source {
    type Create = CreateSource;
    type Patch = SourcePatch;
    const KIND: EntityKind = EntityKind::Source;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn created_at(&self) -> Timestamp {
        self.created_at
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn apply_patch(&mut self, patch: &SourcePatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(url) = &patch.url {
            self.url = url.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
    }

    fn validate_create(input: &CreateSource) -> Result<(), ValidationError> {
        require_non_empty("title", &input.title)?;
        validate_url(&input.url)
    }

    fn validate_patch(patch: &SourcePatch) -> Result<(), ValidationError> {
        require_non_empty_opt("title", patch.title.as_ref())?;
        match &patch.url {
            Some(url) => validate_url(url),
            None => Ok(()),
        }
    }
}

impl Statused for Source {
    type Status = SourceStatus;

    fn status(&self) -> SourceStatus {
        self.status
    }

    fn status_patch(status: SourceStatus) -> SourcePatch {
        SourcePatch {
            status: Some(status),
            ..SourcePatch::default()
        }
    }
}

// ============================================================================
// CONVERSATIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: EntityId,
    pub title: String,
    pub pinned: bool,
    pub order: Option<OrderKey>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateConversation {
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderKey>,
}

impl Entity for Conversation {
    type Create = CreateConversation;
    type Patch = ConversationPatch;
    const KIND: EntityKind = EntityKind::Conversation;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn created_at(&self) -> Timestamp {
        self.created_at
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn apply_patch(&mut self, patch: &ConversationPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(pinned) = patch.pinned {
            self.pinned = pinned;
        }
        if let Some(order) = patch.order {
            self.order = Some(order);
        }
    }

    fn validate_create(input: &CreateConversation) -> Result<(), ValidationError> {
        require_non_empty("title", &input.title)
    }

    fn validate_patch(patch: &ConversationPatch) -> Result<(), ValidationError> {
        require_non_empty_opt("title", patch.title.as_ref())
    }
}

impl Ordered for Conversation {
    fn order_key(&self) -> Option<OrderKey> {
        self.order
    }

    fn order_patch(key: OrderKey) -> ConversationPatch {
        ConversationPatch {
            order: Some(key),
            ..ConversationPatch::default()
        }
    }
}

// ============================================================================
// FILES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Active,
    Trashed,
}

/// Metadata of an uploaded file. The bytes themselves never pass through here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: EntityId,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub status: FileStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateFile {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FileStatus>,
}

impl Entity for FileRecord {
    type Create = CreateFile;
    type Patch = FilePatch;
    const KIND: EntityKind = EntityKind::File;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn created_at(&self) -> Timestamp {
        self.created_at
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn touch(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn apply_patch(&mut self, patch: &FilePatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
    }

    fn validate_create(input: &CreateFile) -> Result<(), ValidationError> {
        require_non_empty("name", &input.name)?;
        if !input.mime_type.contains('/') {
            return Err(ValidationError::invalid(
                "mime_type",
                "expected type/subtype",
            ));
        }
        Ok(())
    }

    fn validate_patch(patch: &FilePatch) -> Result<(), ValidationError> {
        require_non_empty_opt("name", patch.name.as_ref())
    }
}

impl Statused for FileRecord {
    type Status = FileStatus;

    fn status(&self) -> FileStatus {
        self.status
    }

    fn status_patch(status: FileStatus) -> FilePatch {
        FilePatch {
            status: Some(status),
            ..FilePatch::default()
        }
    }
}
