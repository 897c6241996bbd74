//! MARGIN Test Utilities
//!
//! Shared test infrastructure for the Margin workspace:
//! - the in-memory remote, re-exported from its source crate
//! - a key-value store that counts writes
//! - proptest generators for ids, keys and entities
//! - fixtures and outcome assertions

// Re-export the mock remote from its source crate
pub use margin_sync::mock::{Materialize, MockOp, MockRemote};

// Re-export core types for convenience
pub use margin_core::{
    CreateNote, CreateTask, EntityId, ErrorClass, ListQuery, MutationOutcome, Note, OrderKey,
    Pagination, RemoteError, SyncConfig, SyncError, Task, TaskPatch, TaskStatus, Timestamp,
};
pub use margin_storage::{InMemoryKv, KvStore, Namespace, ScopedKey};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use margin_core::StorageError;

// ============================================================================
// RECORDING KEY-VALUE STORE
// ============================================================================

/// In-memory [`KvStore`] that counts writes and removals per namespace.
#[derive(Default)]
pub struct RecordingKv {
    inner: InMemoryKv,
    writes: Mutex<HashMap<Namespace, usize>>,
    removals: Mutex<HashMap<Namespace, usize>>,
    fail_writes: Mutex<bool>,
}

impl RecordingKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn writes(&self, namespace: Namespace) -> usize {
        self.writes
            .lock()
            .map(|w| w.get(&namespace).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn removals(&self, namespace: Namespace) -> usize {
        self.removals
            .lock()
            .map(|r| r.get(&namespace).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Make every following `set` and `remove` fail with a backend error.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        match self.fail_writes.lock() {
            Ok(flag) if *flag => Err(StorageError::Backend {
                reason: "injected write failure".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(_) => Err(StorageError::LockPoisoned),
        }
    }
}

#[async_trait]
impl KvStore for RecordingKv {
    async fn get(&self, key: &ScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &ScopedKey, value: Vec<u8>) -> Result<(), StorageError> {
        self.check_writable()?;
        if let Ok(mut writes) = self.writes.lock() {
            *writes.entry(key.namespace()).or_default() += 1;
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &ScopedKey) -> Result<(), StorageError> {
        self.check_writable()?;
        if let Ok(mut removals) = self.removals.lock() {
            *removals.entry(key.namespace()).or_default() += 1;
        }
        self.inner.remove(key).await
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<String>, StorageError> {
        self.inner.keys(namespace).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Margin types.

    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    /// Server-style identifier.
    pub fn arb_server_id() -> impl Strategy<Value = EntityId> {
        (1u32..100_000).prop_map(|n| EntityId::new(format!("srv-{n}")))
    }

    pub fn arb_local_id() -> impl Strategy<Value = EntityId> {
        Just(()).prop_map(|_| EntityId::new_local())
    }

    /// Distinct server ids, in no particular order.
    pub fn arb_distinct_ids(max: usize) -> impl Strategy<Value = Vec<EntityId>> {
        prop::collection::btree_set(1u32..100_000, 0..=max).prop_map(|set| {
            set.into_iter()
                .map(|n| EntityId::new(format!("srv-{n}")))
                .collect()
        })
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-2030
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_task_status() -> impl Strategy<Value = TaskStatus> {
        prop_oneof![
            Just(TaskStatus::Inbox),
            Just(TaskStatus::Active),
            Just(TaskStatus::Archived),
            Just(TaskStatus::Done),
        ]
    }

    /// Strictly increasing order keys, possibly with no room between neighbours.
    pub fn arb_order_keys(max_len: usize) -> impl Strategy<Value = Vec<OrderKey>> {
        (
            -1_000_000i64..1_000_000,
            prop::collection::vec(1i64..3_000, 0..=max_len),
        )
            .prop_map(|(start, steps)| {
                let mut key = start;
                steps
                    .into_iter()
                    .map(|step| {
                        key += step;
                        key
                    })
                    .collect()
            })
    }

    pub fn arb_create_task() -> impl Strategy<Value = CreateTask> {
        (
            "[a-zA-Z][a-zA-Z0-9 ]{0,40}",
            proptest::option::of("[a-z ]{0,80}"),
            proptest::option::of(arb_task_status()),
        )
            .prop_map(|(title, notes, status)| CreateTask {
                title,
                notes,
                status,
                order: None,
            })
    }

    pub fn arb_task() -> impl Strategy<Value = Task> {
        (
            arb_server_id(),
            arb_create_task(),
            proptest::option::of(-1_000_000i64..1_000_000),
            arb_timestamp(),
        )
            .prop_map(|(id, input, order, created_at)| Task {
                id,
                title: input.title,
                notes: input.notes,
                status: input.status.unwrap_or(TaskStatus::Inbox),
                order,
                created_at,
                updated_at: created_at,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use chrono::Utc;
    use margin_sync::{EntityStore, RemoteClient};

    pub fn task(id: &str, title: &str) -> Task {
        let now = Utc::now();
        Task {
            id: EntityId::new(id),
            title: title.to_string(),
            notes: None,
            status: TaskStatus::Inbox,
            order: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn keyed_task(id: &str, title: &str, order: OrderKey) -> Task {
        Task {
            order: Some(order),
            ..task(id, title)
        }
    }

    /// Remote holding one task per title, listed in the given order.
    pub async fn task_remote(titles: &[&str]) -> Arc<MockRemote<Task>> {
        let remote = Arc::new(MockRemote::new());
        // Creates insert at the head, so go backwards.
        for title in titles.iter().rev() {
            if let Err(e) = remote.create(&CreateTask::titled(*title)).await {
                panic!("seeding mock remote failed: {e}");
            }
        }
        remote
    }

    /// Store over `remote` that has already loaded the first page.
    pub async fn loaded_store<T, R>(remote: Arc<R>) -> EntityStore<T, R>
    where
        T: margin_core::Entity,
        R: RemoteClient<T>,
    {
        let store = EntityStore::new(remote);
        if let Err(e) = store.refresh(ListQuery::all(), Pagination::default()).await {
            panic!("initial refresh failed: {e}");
        }
        store
    }

    pub fn fast_sync_config() -> SyncConfig {
        SyncConfig::default().with_autosave_delay(std::time::Duration::from_millis(50))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Outcome and ordering assertions.

    use super::*;

    #[track_caller]
    pub fn assert_success<T: std::fmt::Debug>(outcome: &MutationOutcome<T>) {
        assert!(
            outcome.success,
            "Expected success, got error: {:?}",
            outcome.error
        );
    }

    #[track_caller]
    pub fn assert_failed_with<T: std::fmt::Debug>(outcome: &MutationOutcome<T>, class: ErrorClass) {
        assert!(!outcome.success, "Expected failure, got: {:?}", outcome.data);
        assert_eq!(
            outcome.error_class(),
            Some(class),
            "Wrong error class: {:?}",
            outcome.error
        );
    }

    #[track_caller]
    pub fn assert_strictly_increasing(keys: &[OrderKey]) {
        assert!(
            margin_core::is_strictly_increasing(keys),
            "Keys not strictly increasing: {:?}",
            keys
        );
    }
}
