//! In-memory remote store for tests and offline demos.
//!
//! Behaves like a conventional CRUD backend (server-assigned ids, atomic batch
//! endpoints) and lets a test inject failures, flip an offline switch and
//! count calls per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use margin_core::{
    Conversation, Entity, EntityId, FileRecord, FileStatus, ListQuery, Note, Page, Pagination,
    RemoteError, Source, SourceStatus, Task, TaskStatus, Timestamp,
};
use serde::Serialize;

use crate::RemoteClient;

/// Entities the mock server knows how to build from a create payload.
pub trait Materialize: Entity {
    fn materialize(id: EntityId, input: &Self::Create, now: Timestamp) -> Self;

    fn matches(&self, query: &ListQuery) -> bool;
}

/// Remote operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    List,
    Create,
    Update,
    Delete,
    BulkDelete,
    BulkUpdate,
}

#[derive(Debug)]
struct MockState<T> {
    records: Vec<T>,
    next_id: u64,
    offline: bool,
    one_shot: HashMap<MockOp, VecDeque<RemoteError>>,
    persistent: HashMap<MockOp, RemoteError>,
    calls: HashMap<MockOp, usize>,
    latency: HashMap<MockOp, Duration>,
}

#[derive(Debug)]
pub struct MockRemote<T: Entity> {
    state: Mutex<MockState<T>>,
}

impl<T: Entity> Default for MockRemote<T> {
    fn default() -> Self {
        Self::with_records(Vec::new())
    }
}

impl<T: Entity> MockRemote<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server pre-populated with `records`, in list order.
    pub fn with_records(records: Vec<T>) -> Self {
        let next_id = records.len() as u64 + 1;
        Self {
            state: Mutex::new(MockState {
                records,
                next_id,
                offline: false,
                one_shot: HashMap::new(),
                persistent: HashMap::new(),
                calls: HashMap::new(),
                latency: HashMap::new(),
            }),
        }
    }

    /// Current server-side records.
    pub fn records(&self) -> Vec<T> {
        self.lock().records.clone()
    }

    pub fn record(&self, id: &EntityId) -> Option<T> {
        self.lock().records.iter().find(|r| r.id() == id).cloned()
    }

    /// Replace a record behind the client's back (a concurrent edit elsewhere).
    pub fn put_record(&self, record: T) {
        let mut state = self.lock();
        match state.records.iter_mut().find(|r| r.id() == record.id()) {
            Some(existing) => *existing = record,
            None => state.records.insert(0, record),
        }
    }

    pub fn remove_record(&self, id: &EntityId) {
        self.lock().records.retain(|r| r.id() != id);
    }

    /// Every call fails with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next call of `op` with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: MockOp, error: RemoteError) {
        self.lock().one_shot.entry(op).or_default().push_back(error);
    }

    /// Fail every call of `op` until cleared.
    pub fn fail_always(&self, op: MockOp, error: RemoteError) {
        self.lock().persistent.insert(op, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.one_shot.clear();
        state.persistent.clear();
    }

    /// Delay every call of `op`. Uses tokio time, so paused-clock tests stay deterministic.
    pub fn set_latency(&self, op: MockOp, latency: Duration) {
        self.lock().latency.insert(op, latency);
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    fn lock(&self) -> MutexGuard<'_, MockState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call, apply latency and injected failures.
    async fn enter(&self, op: MockOp) -> Result<(), RemoteError> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.latency.get(&op).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if state.offline {
            return Err(RemoteError::network("offline"));
        }
        if let Some(error) = state.one_shot.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        if let Some(error) = state.persistent.get(&op) {
            return Err(error.clone());
        }
        Ok(())
    }

    fn not_found(id: Option<&EntityId>) -> RemoteError {
        RemoteError::NotFound {
            kind: T::KIND,
            id: id.cloned(),
        }
    }
}

#[async_trait]
impl<T: Materialize> RemoteClient<T> for MockRemote<T> {
    async fn list(
        &self,
        query: &ListQuery,
        pagination: Pagination,
    ) -> Result<Page<T>, RemoteError> {
        self.enter(MockOp::List).await?;
        let state = self.lock();
        let matching: Vec<&T> = state.records.iter().filter(|r| r.matches(query)).collect();
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();
        Ok(Page { items, total })
    }

    async fn create(&self, input: &T::Create) -> Result<T, RemoteError> {
        self.enter(MockOp::Create).await?;
        let mut state = self.lock();
        let id = EntityId::new(format!("srv-{}", state.next_id));
        state.next_id += 1;
        let record = T::materialize(id, input, Utc::now());
        state.records.insert(0, record.clone());
        Ok(record)
    }

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> Result<T, RemoteError> {
        self.enter(MockOp::Update).await?;
        let mut state = self.lock();
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| Self::not_found(Some(id)))?;
        record.apply_patch(patch);
        record.touch(Utc::now());
        Ok(record.clone())
    }

    async fn delete(&self, id: &EntityId) -> Result<(), RemoteError> {
        self.enter(MockOp::Delete).await?;
        let mut state = self.lock();
        let before = state.records.len();
        state.records.retain(|r| r.id() != id);
        if state.records.len() == before {
            return Err(Self::not_found(Some(id)));
        }
        Ok(())
    }

    async fn bulk_delete(&self, ids: &[EntityId]) -> Result<u64, RemoteError> {
        self.enter(MockOp::BulkDelete).await?;
        let mut state = self.lock();
        if !ids.iter().all(|id| state.records.iter().any(|r| r.id() == id)) {
            return Err(Self::not_found(None));
        }
        let before = state.records.len();
        state.records.retain(|r| !ids.contains(r.id()));
        Ok((before - state.records.len()) as u64)
    }

    async fn bulk_update(
        &self,
        ids: &[EntityId],
        patch: &T::Patch,
    ) -> Result<Vec<T>, RemoteError> {
        self.enter(MockOp::BulkUpdate).await?;
        let mut state = self.lock();
        if !ids.iter().all(|id| state.records.iter().any(|r| r.id() == id)) {
            return Err(Self::not_found(None));
        }
        let now = Utc::now();
        let mut updated = Vec::with_capacity(ids.len());
        for record in state.records.iter_mut().filter(|r| ids.contains(r.id())) {
            record.apply_patch(patch);
            record.touch(now);
            updated.push(record.clone());
        }
        Ok(updated)
    }
}

// ============================================================================
// QUERY MATCHING
// ============================================================================

fn status_name<S: Serialize>(status: &S) -> Option<String> {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(name)) => Some(name),
        _ => None,
    }
}

fn matches_search(text: &str, query: &ListQuery) -> bool {
    query
        .search
        .as_ref()
        .map_or(true, |needle| text.to_lowercase().contains(&needle.to_lowercase()))
}

fn matches_status<S: Serialize>(status: &S, query: &ListQuery) -> bool {
    query
        .status
        .as_ref()
        .map_or(true, |wanted| status_name(status).as_deref() == Some(wanted.as_str()))
}

impl Materialize for Task {
    fn materialize(id: EntityId, input: &Self::Create, now: Timestamp) -> Self {
        Task {
            id,
            title: input.title.clone(),
            notes: input.notes.clone(),
            status: input.status.unwrap_or(TaskStatus::Inbox),
            order: input.order,
            created_at: now,
            updated_at: now,
        }
    }

    fn matches(&self, query: &ListQuery) -> bool {
        matches_status(&self.status, query) && matches_search(&self.title, query)
    }
}

impl Materialize for Note {
    fn materialize(id: EntityId, input: &Self::Create, now: Timestamp) -> Self {
        Note {
            id,
            title: input.title.clone(),
            content: input.content.clone(),
            source_id: input.source_id.clone(),
            order: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn matches(&self, query: &ListQuery) -> bool {
        let parent_ok = query
            .parent_id
            .as_ref()
            .map_or(true, |parent| self.source_id.as_ref() == Some(parent));
        parent_ok && matches_search(&self.title, query)
    }
}

impl Materialize for Source {
    fn materialize(id: EntityId, input: &Self::Create, now: Timestamp) -> Self {
        Source {
            id,
            title: input.title.clone(),
            url: input.url.clone(),
            status: SourceStatus::Unread,
            created_at: now,
            updated_at: now,
        }
    }

    fn matches(&self, query: &ListQuery) -> bool {
        matches_status(&self.status, query) && matches_search(&self.title, query)
    }
}

impl Materialize for Conversation {
    fn materialize(id: EntityId, input: &Self::Create, now: Timestamp) -> Self {
        Conversation {
            id,
            title: input.title.clone(),
            pinned: false,
            order: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn matches(&self, query: &ListQuery) -> bool {
        matches_search(&self.title, query)
    }
}

impl Materialize for FileRecord {
    fn materialize(id: EntityId, input: &Self::Create, now: Timestamp) -> Self {
        FileRecord {
            id,
            name: input.name.clone(),
            mime_type: input.mime_type.clone(),
            size_bytes: input.size_bytes,
            status: FileStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn matches(&self, query: &ListQuery) -> bool {
        matches_status(&self.status, query) && matches_search(&self.name, query)
    }
}
