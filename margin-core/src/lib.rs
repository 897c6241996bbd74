//! MARGIN Core - shared types
//!
//! Identifiers, the entity traits and concrete entity kinds, order keys, the
//! error taxonomy and the outcome type returned by every store mutation.
//! No I/O happens in this crate.

mod config;
mod draft;
mod entity;
mod error;
mod identity;
mod kinds;
mod order_key;
mod outcome;
mod query;
mod sequencer;

pub use config::SyncConfig;
pub use draft::{Draft, DraftInput, PromoteContext};
pub use entity::{Draftable, Entity, EntityKind, Ordered, Statused};
pub use error::{
    ErrorClass, RemoteError, StorageError, SyncError, SyncResult, ValidationError,
};
pub use identity::{EntityId, Timestamp, LOCAL_ID_PREFIX};
pub use kinds::{
    Conversation, ConversationPatch, CreateConversation, CreateFile, CreateNote, CreateSource,
    CreateTask, FilePatch, FileRecord, FileStatus, Note, NotePatch, Source, SourcePatch,
    SourceStatus, Task, TaskPatch, TaskStatus,
};
pub use order_key::{
    compare_display_order, is_strictly_increasing, Allocation, OrderKey, OrderKeyAllocator,
    DEFAULT_ORDER_GAP,
};
pub use outcome::MutationOutcome;
pub use query::{ListQuery, Page, Pagination};
pub use sequencer::{KeyedSequencer, RequestSequencer, Ticket};
