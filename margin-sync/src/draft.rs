//! Local drafts and their promotion to server records.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use margin_core::{
    Draft, DraftInput, Draftable, EntityId, MutationOutcome, PromoteContext, StorageError,
    SyncError, SyncResult, ValidationError,
};
use margin_storage::{get_json, set_json, AppFlags, KvStore, Namespace, ScopedKey};

use crate::{Debouncer, EntityStore, RemoteClient};

const ACTIVE_FLAG_PREFIX: &str = "active_draft";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes an id from the in-flight promotion set when dropped.
struct PromotionGuard<'a> {
    promoting: &'a Mutex<HashSet<EntityId>>,
    id: EntityId,
}

impl Drop for PromotionGuard<'_> {
    fn drop(&mut self) {
        lock(self.promoting).remove(&self.id);
    }
}

/// Drafts of one entity kind, persisted in the drafts namespace.
///
/// The in-memory map always holds the newest content; the key-value store
/// catches up when the autosave window closes.
pub struct DraftStore<T: Draftable, R: RemoteClient<T> + ?Sized> {
    entities: Arc<EntityStore<T, R>>,
    kv: Arc<dyn KvStore>,
    flags: AppFlags,
    drafts: Mutex<BTreeMap<EntityId, Draft>>,
    active: Mutex<Option<EntityId>>,
    promoting: Mutex<HashSet<EntityId>>,
    autosave: Debouncer<EntityId>,
}

impl<T: Draftable, R: RemoteClient<T> + ?Sized> DraftStore<T, R> {
    pub fn new(entities: Arc<EntityStore<T, R>>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            entities,
            flags: AppFlags::new(Arc::clone(&kv)),
            kv,
            drafts: Mutex::new(BTreeMap::new()),
            active: Mutex::new(None),
            promoting: Mutex::new(HashSet::new()),
            autosave: Debouncer::new(),
        }
    }

    pub fn entities(&self) -> &Arc<EntityStore<T, R>> {
        &self.entities
    }

    /// Restore drafts and the active marker from durable storage.
    ///
    /// Entries that no longer decode are skipped. Returns how many drafts were loaded.
    pub async fn load(&self) -> SyncResult<usize> {
        let prefix = Self::key_prefix();
        let mut loaded = BTreeMap::new();
        for key in self.kv.keys(Namespace::Drafts).await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            match get_json::<Draft>(self.kv.as_ref(), &ScopedKey::drafts(key.clone())).await {
                Ok(Some(draft)) => {
                    loaded.insert(draft.id.clone(), draft);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable draft"),
            }
        }
        let active = self.flags.get_value::<EntityId>(&Self::active_flag()).await?;

        let count = loaded.len();
        *lock(&self.drafts) = loaded;
        *lock(&self.active) = active;
        tracing::debug!(kind = %T::KIND, count, "drafts loaded");
        Ok(count)
    }

    /// Newest first.
    pub fn drafts(&self) -> Vec<Draft> {
        let mut drafts: Vec<Draft> = lock(&self.drafts).values().cloned().collect();
        drafts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        drafts
    }

    pub fn get(&self, id: &EntityId) -> Option<Draft> {
        lock(&self.drafts).get(id).cloned()
    }

    /// Draft or record the user is currently editing.
    pub fn active(&self) -> Option<EntityId> {
        lock(&self.active).clone()
    }

    pub async fn set_active(&self, id: Option<EntityId>) -> SyncResult<()> {
        let flag = Self::active_flag();
        match &id {
            Some(id) => self.flags.set_value(&flag, id).await?,
            None => self.flags.clear(&flag).await?,
        }
        *lock(&self.active) = id;
        Ok(())
    }

    /// Create a draft on this device only and make it the active one.
    pub async fn create_local_draft(&self, input: DraftInput) -> SyncResult<Draft> {
        let draft = Draft::new(input);
        self.persist(&draft).await?;
        lock(&self.drafts).insert(draft.id.clone(), draft.clone());
        self.set_active(Some(draft.id.clone())).await?;
        tracing::debug!(kind = %T::KIND, id = %draft.id, "local draft created");
        Ok(draft)
    }

    /// Record new content for `id` and persist it once `delay` passes without
    /// another call for the same id.
    ///
    /// Local ids are written to the drafts namespace only. Server ids are sent
    /// with [`EntityStore::persist_quietly`].
    pub fn autosave(self: &Arc<Self>, id: &EntityId, content: &str, delay: Duration) -> SyncResult<()> {
        if id.is_local() {
            let mut drafts = lock(&self.drafts);
            let draft = drafts
                .get_mut(id)
                .ok_or_else(|| SyncError::DraftNotFound { id: id.clone() })?;
            draft.content = content.to_string();
            draft.updated_at = Utc::now();
        }

        let this = Arc::clone(self);
        let key = id.clone();
        let content = content.to_string();
        self.autosave.schedule(id.clone(), delay, async move {
            if key.is_local() {
                this.write_back(&key).await;
            } else {
                let outcome = this
                    .entities
                    .persist_quietly(&key, T::content_patch(&content))
                    .await;
                if outcome.success {
                    tracing::debug!(draft_id = %key, "autosaved content to server");
                } else {
                    tracing::warn!(draft_id = %key, "autosave not persisted, content stays local only");
                }
            }
        });
        Ok(())
    }

    pub fn has_pending_autosave(&self, id: &EntityId) -> bool {
        self.autosave.is_pending(id)
    }

    /// Turn a local draft into a server record.
    ///
    /// On success the draft is gone and the new record is active. On failure
    /// the draft is left as it was.
    pub async fn promote(&self, id: &EntityId, context: PromoteContext) -> MutationOutcome<T> {
        if !id.is_local() {
            return MutationOutcome::failed(ValidationError::invalid(
                "id",
                "only local drafts can be promoted",
            ));
        }
        if !lock(&self.promoting).insert(id.clone()) {
            return MutationOutcome::failed(ValidationError::invalid(
                "id",
                "promotion already in progress",
            ));
        }
        let _guard = PromotionGuard {
            promoting: &self.promoting,
            id: id.clone(),
        };

        let Some(draft) = self.get(id) else {
            return MutationOutcome::failed(SyncError::DraftNotFound { id: id.clone() });
        };
        let had_pending_save = self.autosave.cancel(id);

        let outcome = self.entities.create(T::create_from_draft(&draft, &context)).await;
        let created = match (&outcome.data, outcome.success) {
            (Some(entity), true) => Some(entity.id().clone()),
            _ => None,
        };
        let Some(entity_id) = created else {
            if had_pending_save {
                self.write_back(id).await;
            }
            return outcome;
        };

        lock(&self.drafts).remove(id);
        if let Err(e) = self.kv.remove(&Self::key(id)).await {
            tracing::warn!(
                draft_id = %id,
                entity_id = %entity_id,
                error = %e,
                "draft survived promotion, it will reappear as a duplicate"
            );
        }
        if let Err(e) = self.set_active(Some(entity_id.clone())).await {
            tracing::warn!(entity_id = %entity_id, error = %e, "failed to mark promoted record active");
        }
        tracing::info!(kind = %T::KIND, draft_id = %id, entity_id = %entity_id, "draft promoted");
        outcome
    }

    /// Throw away a draft, or delete a server record through the entity store.
    pub async fn discard(&self, id: &EntityId) -> MutationOutcome<()> {
        let outcome = if id.is_local() {
            self.autosave.cancel(id);
            if self.get(id).is_none() {
                return MutationOutcome::failed(SyncError::DraftNotFound { id: id.clone() });
            }
            match self.kv.remove(&Self::key(id)).await {
                Ok(()) => {
                    lock(&self.drafts).remove(id);
                    MutationOutcome::ok(())
                }
                Err(e) => MutationOutcome::failed(e),
            }
        } else {
            self.entities.delete(id).await
        };

        if outcome.success && self.active().as_ref() == Some(id) {
            if let Err(e) = self.set_active(None).await {
                tracing::warn!(id = %id, error = %e, "failed to clear active marker");
            }
        }
        outcome
    }

    /// Fire every waiting autosave now and wait for all of them.
    pub async fn settle(&self) {
        self.autosave.flush().await;
    }

    /// Drop waiting autosaves without running them.
    pub fn abort_autosaves(&self) {
        self.autosave.abort_all();
    }

    async fn write_back(&self, id: &EntityId) {
        // Promoted or discarded in the meantime.
        let Some(draft) = self.get(id) else {
            return;
        };
        match self.persist(&draft).await {
            Ok(()) => tracing::debug!(id = %id, "draft saved"),
            Err(e) => tracing::warn!(id = %id, error = %e, "draft autosave failed"),
        }
    }

    async fn persist(&self, draft: &Draft) -> Result<(), StorageError> {
        set_json(self.kv.as_ref(), &Self::key(&draft.id), draft).await
    }

    fn key_prefix() -> String {
        format!("{}/", T::KIND.collection())
    }

    fn key(id: &EntityId) -> ScopedKey {
        ScopedKey::drafts(format!("{}{}", Self::key_prefix(), id))
    }

    fn active_flag() -> String {
        format!("{}.{}", ACTIVE_FLAG_PREFIX, T::KIND.collection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockOp, MockRemote};
    use margin_core::{ErrorClass, RemoteError, Task};
    use margin_storage::InMemoryKv;

    fn store() -> (Arc<MockRemote<Task>>, Arc<InMemoryKv>, Arc<DraftStore<Task, MockRemote<Task>>>) {
        let remote = Arc::new(MockRemote::new());
        let kv = Arc::new(InMemoryKv::new());
        let entities = Arc::new(EntityStore::new(Arc::clone(&remote)));
        let drafts = Arc::new(DraftStore::new(entities, kv.clone() as Arc<dyn KvStore>));
        (remote, kv, drafts)
    }

    #[tokio::test]
    async fn test_create_local_draft_never_touches_network() {
        let (remote, _kv, drafts) = store();
        let draft = drafts
            .create_local_draft(DraftInput::with_content("first thought"))
            .await
            .unwrap();
        assert!(draft.id.is_local());
        assert_eq!(drafts.active(), Some(draft.id.clone()));
        assert_eq!(remote.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_promote_replaces_draft_with_record() {
        let (remote, kv, drafts) = store();
        let draft = drafts
            .create_local_draft(DraftInput::with_content("Buy milk\nand bread"))
            .await
            .unwrap();

        let outcome = drafts.promote(&draft.id, PromoteContext::default()).await;
        let task = outcome.data.unwrap();
        assert_eq!(task.title, "Buy milk");
        assert!(drafts.get(&draft.id).is_none());
        assert_eq!(drafts.active(), Some(task.id.clone()));
        assert_eq!(remote.records().len(), 1);
        assert!(kv.keys(Namespace::Drafts).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_draft() {
        let (remote, _kv, drafts) = store();
        let draft = drafts
            .create_local_draft(DraftInput::with_content("keep me"))
            .await
            .unwrap();
        remote.fail_next(MockOp::Create, RemoteError::network("offline"));

        let outcome = drafts.promote(&draft.id, PromoteContext::default()).await;
        assert_eq!(outcome.error_class(), Some(ErrorClass::Transient));
        assert_eq!(drafts.get(&draft.id), Some(draft));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_promotion_creates_one_record() {
        let (remote, _kv, drafts) = store();
        remote.set_latency(MockOp::Create, Duration::from_millis(50));
        let draft = drafts
            .create_local_draft(DraftInput::with_content("once"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            drafts.promote(&draft.id, PromoteContext::default()),
            drafts.promote(&draft.id, PromoteContext::default()),
        );
        assert_eq!([first.success, second.success].iter().filter(|s| **s).count(), 1);
        assert_eq!(remote.records().len(), 1);

        let again = drafts.promote(&draft.id, PromoteContext::default()).await;
        assert_eq!(again.error_class(), Some(ErrorClass::NotFound));
        assert_eq!(remote.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_keeps_last_content() {
        let (_remote, kv, drafts) = store();
        let draft = drafts.create_local_draft(DraftInput::default()).await.unwrap();
        for content in ["a", "ab", "abc"] {
            drafts
                .autosave(&draft.id, content, Duration::from_millis(800))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let reloaded = DraftStore::new(
            Arc::clone(drafts.entities()),
            kv as Arc<dyn KvStore>,
        );
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert_eq!(reloaded.get(&draft.id).unwrap().content, "abc");
        assert_eq!(reloaded.active(), Some(draft.id));
    }

    #[tokio::test]
    async fn test_autosave_unknown_draft_errors() {
        let (_remote, _kv, drafts) = store();
        let result = drafts.autosave(&EntityId::new_local(), "x", Duration::from_millis(10));
        assert!(matches!(result, Err(SyncError::DraftNotFound { .. })));
    }

    #[tokio::test]
    async fn test_discard_local_draft_clears_active() {
        let (_remote, kv, drafts) = store();
        let draft = drafts
            .create_local_draft(DraftInput::with_content("scratch"))
            .await
            .unwrap();
        assert!(drafts.discard(&draft.id).await.success);
        assert!(drafts.drafts().is_empty());
        assert_eq!(drafts.active(), None);
        assert!(kv.keys(Namespace::Drafts).await.unwrap().is_empty());
    }
}
