//! Generic optimistic entity store.
//!
//! One [`EntityStore`] holds the authoritative in-memory collection for one
//! entity kind. Every mutation follows the same protocol:
//!
//! 1. validate the input (nothing is touched on failure),
//! 2. record the optimistic write as a pending entry and capture its
//!    [`Snapshot`] handle in the same critical section,
//! 3. call the remote,
//! 4. on success fold the server representation into the confirmed state,
//!    on failure retract the entry captured by *this* call.
//!
//! The visible collection is always the last confirmed server state with the
//! pending writes replayed over it, in issue order. Retracting one write
//! therefore never disturbs another write to the same record, and a list page
//! that lands mid-mutation keeps every in-flight change on screen.
//!
//! The collection mutex is never held across an `.await`.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use margin_core::{
    compare_display_order, Allocation, Entity, EntityId, ErrorClass, ListQuery, MutationOutcome,
    OrderKey, OrderKeyAllocator, Ordered, Page, Pagination, RemoteError, RequestSequencer,
    Statused, SyncError, SyncResult, Timestamp, ValidationError,
};
use margin_storage::{list_cache_key, Fetcher, ReadThroughCache, Refresh};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::RemoteClient;

/// Confirmed writes younger than this are replayed over incoming list pages.
const CONFIRMATION_REPLAY_WINDOW: Duration = Duration::from_secs(60);

/// Handle on one in-flight optimistic write.
///
/// Holds the confirmed pre-mutation copies of the records it touched.
/// Retracting it removes exactly this call's change.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    op: u64,
    before: Vec<T>,
}

impl<T> Snapshot<T> {
    /// Number of records this write touched.
    pub fn len(&self) -> usize {
        self.before.len()
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
    }
}

enum PendingWrite<T: Entity> {
    Patch {
        changes: Vec<(EntityId, T::Patch)>,
        at: Timestamp,
    },
    Remove {
        ids: Vec<EntityId>,
    },
}

struct Pending<T: Entity> {
    op: u64,
    write: PendingWrite<T>,
}

/// What the server acknowledged.
enum Confirmed<T> {
    Created(T),
    Merged(T),
    Removed(EntityId),
}

struct Confirmation<T> {
    epoch: u64,
    at: Instant,
    change: Confirmed<T>,
}

struct Collection<T: Entity> {
    confirmed: Vec<T>,
    confirmed_total: u64,
    pending: Vec<Pending<T>>,
    recent: VecDeque<Confirmation<T>>,
    /// Bumped on every confirmation; list requests remember it at issue.
    epoch: u64,
    next_op: u64,
    items: Vec<T>,
    total: u64,
    last_query: Option<(ListQuery, Pagination)>,
}

impl<T: Entity> Collection<T> {
    fn new() -> Self {
        Self {
            confirmed: Vec::new(),
            confirmed_total: 0,
            pending: Vec::new(),
            recent: VecDeque::new(),
            epoch: 0,
            next_op: 0,
            items: Vec::new(),
            total: 0,
            last_query: None,
        }
    }

    fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    fn confirmed_copy(&self, id: &EntityId) -> Option<T> {
        self.confirmed.iter().find(|item| item.id() == id).cloned()
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Record `write` as pending and show it.
    fn begin(&mut self, write: PendingWrite<T>) -> Snapshot<T> {
        let op = self.next_op;
        self.next_op += 1;
        let before = match &write {
            PendingWrite::Patch { changes, .. } => changes
                .iter()
                .filter_map(|(id, _)| self.confirmed_copy(id))
                .collect(),
            PendingWrite::Remove { ids } => {
                ids.iter().filter_map(|id| self.confirmed_copy(id)).collect()
            }
        };
        self.pending.push(Pending { op, write });
        self.rebuild();
        Snapshot { op, before }
    }

    /// Patch every visible target. `None` when no target is visible.
    fn begin_patch(&mut self, changes: Vec<(EntityId, T::Patch)>) -> Option<Snapshot<T>> {
        let mut visible: Vec<(EntityId, T::Patch)> = Vec::with_capacity(changes.len());
        for (id, patch) in changes {
            if self.position(&id).is_some() && !visible.iter().any(|(seen, _)| seen == &id) {
                visible.push((id, patch));
            }
        }
        if visible.is_empty() {
            return None;
        }
        Some(self.begin(PendingWrite::Patch {
            changes: visible,
            at: Utc::now(),
        }))
    }

    /// Hide every visible target. `None` when no target is visible.
    fn begin_remove(&mut self, ids: &[EntityId]) -> Option<(Vec<EntityId>, Snapshot<T>)> {
        let mut visible: Vec<EntityId> = Vec::with_capacity(ids.len());
        for id in ids {
            if self.position(id).is_some() && !visible.contains(id) {
                visible.push(id.clone());
            }
        }
        if visible.is_empty() {
            return None;
        }
        let snapshot = self.begin(PendingWrite::Remove {
            ids: visible.clone(),
        });
        Some((visible, snapshot))
    }

    /// Drop this call's pending write. Other writes stay as they are.
    fn retract(&mut self, snapshot: &Snapshot<T>) {
        self.pending.retain(|pending| pending.op != snapshot.op);
        self.rebuild();
    }

    /// The server accepted this call's write.
    fn settle(&mut self, snapshot: &Snapshot<T>, changes: Vec<Confirmed<T>>) {
        self.pending.retain(|pending| pending.op != snapshot.op);
        self.confirm_all(changes);
    }

    fn confirm_all(&mut self, changes: Vec<Confirmed<T>>) {
        let now = Instant::now();
        for change in changes {
            self.apply_confirmed(&change, true);
            self.recent.push_back(Confirmation {
                epoch: self.epoch,
                at: now,
                change,
            });
            self.epoch += 1;
        }
        self.prune_recent();
        self.rebuild();
    }

    /// Fold one acknowledged change into the confirmed state.
    ///
    /// Creates are only re-inserted when `insert_created` is set: a page
    /// requested after the create already reflects whether the record
    /// belongs to it.
    fn apply_confirmed(&mut self, change: &Confirmed<T>, insert_created: bool) {
        match change {
            Confirmed::Created(entity) | Confirmed::Merged(entity) => {
                if let Some(slot) = self.confirmed.iter_mut().find(|item| item.id() == entity.id()) {
                    if slot.updated_at() <= entity.updated_at() {
                        *slot = entity.clone();
                    }
                } else if insert_created && matches!(change, Confirmed::Created(_)) {
                    self.confirmed.insert(0, entity.clone());
                    self.confirmed_total += 1;
                }
            }
            Confirmed::Removed(id) => {
                let before = self.confirmed.len();
                self.confirmed.retain(|item| item.id() != id);
                if self.confirmed.len() < before {
                    self.confirmed_total = self.confirmed_total.saturating_sub(1);
                }
            }
        }
    }

    /// Take a list page as the new confirmed state.
    ///
    /// `issued_at` is the epoch when the page was requested, if known.
    /// Confirmations since then are replayed over it; with no epoch only
    /// updates and removals are replayed.
    fn replace(&mut self, page: Page<T>, issued_at: Option<u64>) {
        self.confirmed = page.items;
        self.confirmed_total = page.total;
        self.prune_recent();
        let recent = std::mem::take(&mut self.recent);
        for confirmation in &recent {
            let replay = issued_at.map_or(true, |epoch| confirmation.epoch >= epoch);
            if replay {
                self.apply_confirmed(&confirmation.change, issued_at.is_some());
            }
        }
        self.recent = recent;
        self.rebuild();
    }

    fn prune_recent(&mut self) {
        while self
            .recent
            .front()
            .is_some_and(|oldest| oldest.at.elapsed() > CONFIRMATION_REPLAY_WINDOW)
        {
            self.recent.pop_front();
        }
    }

    /// Visible collection: confirmed state plus every pending write.
    fn rebuild(&mut self) {
        let mut items = self.confirmed.clone();
        let mut total = self.confirmed_total;
        for pending in &self.pending {
            match &pending.write {
                PendingWrite::Patch { changes, at } => {
                    for (id, patch) in changes {
                        if let Some(item) = items.iter_mut().find(|item| item.id() == id) {
                            item.apply_patch(patch);
                            item.touch(*at);
                        }
                    }
                }
                PendingWrite::Remove { ids } => {
                    let before = items.len();
                    items.retain(|item| !ids.contains(item.id()));
                    total = total.saturating_sub((before - items.len()) as u64);
                }
            }
        }
        self.items = items;
        self.total = total;
    }
}

/// How the optimistic step of a reorder went.
enum ReorderPlan {
    Single(OrderKey),
    Normalize {
        moved: OrderKey,
        changed: Vec<(EntityId, OrderKey)>,
    },
}

/// Authoritative collection and optimistic mutation contract for one entity kind.
pub struct EntityStore<T: Entity, R: RemoteClient<T> + ?Sized> {
    remote: Arc<R>,
    state: Mutex<Collection<T>>,
    version: watch::Sender<u64>,
    allocator: OrderKeyAllocator,
    list_sequencer: RequestSequencer,
}

impl<T: Entity, R: RemoteClient<T> + ?Sized> EntityStore<T, R> {
    pub fn new(remote: Arc<R>) -> Self {
        Self::with_allocator(remote, OrderKeyAllocator::default())
    }

    pub fn with_allocator(remote: Arc<R>, allocator: OrderKeyAllocator) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            remote,
            state: Mutex::new(Collection::new()),
            version,
            allocator,
            list_sequencer: RequestSequencer::new(),
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Collection in list order (newest created first).
    pub fn items(&self) -> Vec<T> {
        self.read(|c| c.items.clone())
    }

    pub fn get(&self, id: &EntityId) -> Option<T> {
        self.read(|c| c.items.iter().find(|item| item.id() == id).cloned())
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.read(|c| c.position(id).is_some())
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.read(|c| c.items.iter().map(|item| item.id().clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.read(|c| c.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Server-side count across all pages, adjusted by in-flight mutations.
    pub fn total(&self) -> u64 {
        self.read(|c| c.total)
    }

    /// True while any optimistic write is waiting for the server.
    pub fn has_pending(&self) -> bool {
        self.read(|c| c.has_pending())
    }

    pub fn last_query(&self) -> Option<(ListQuery, Pagination)> {
        self.read(|c| c.last_query.clone())
    }

    /// Bumped after every optimistic write, reconciliation and refresh.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    // ========================================================================
    // LIST
    // ========================================================================

    /// Replace the confirmed collection with the server's answer to `query`.
    ///
    /// Pending writes stay applied on top. A response that completes after a
    /// newer refresh already completed is dropped.
    pub async fn refresh(&self, query: ListQuery, pagination: Pagination) -> SyncResult<()> {
        let issued_at = self.write(|c| {
            c.last_query = Some((query.clone(), pagination));
            c.epoch
        });
        let ticket = self.list_sequencer.issue();
        let page = self.remote.list(&query, pagination).await?;
        if !self.list_sequencer.complete(ticket) {
            tracing::debug!(kind = %T::KIND, "dropping superseded list response");
            return Ok(());
        }
        tracing::debug!(kind = %T::KIND, count = page.items.len(), total = page.total, "refreshed");
        self.write(|c| c.replace(page, Some(issued_at)));
        Ok(())
    }

    /// Re-run the last list query, if there was one.
    pub async fn refresh_last(&self) -> SyncResult<()> {
        match self.last_query() {
            Some((query, pagination)) => self.refresh(query, pagination).await,
            None => Ok(()),
        }
    }

    /// Load `query` through the read-through cache: the cached page is shown
    /// at once, then replaced by the fetched one when it arrives.
    pub async fn load_through(
        &self,
        cache: &ReadThroughCache,
        query: ListQuery,
        pagination: Pagination,
    ) -> SyncResult<()> {
        let key = list_cache_key(T::KIND, &query, pagination);
        let fetcher: Arc<dyn Fetcher<Page<T>>> = Arc::new(ListFetcher {
            remote: Arc::clone(&self.remote),
            query: query.clone(),
            pagination,
            _entity: PhantomData,
        });
        let issued_at = self.write(|c| {
            c.last_query = Some((query, pagination));
            c.epoch
        });

        let mut fetch = cache.fetch(&key, fetcher).await?;
        if let Some(read) = fetch.take_cached() {
            tracing::debug!(kind = %T::KIND, stale = read.needs_revalidation(), "showing cached page");
            self.write(|c| c.replace(read.into_value(), Some(issued_at)));
        }
        match fetch.settle().await? {
            Refresh::Fresh(read) => self.write(|c| c.replace(read.into_value(), Some(issued_at))),
            Refresh::Failed { error, .. } => {
                tracing::warn!(kind = %T::KIND, error = %error, "list fetch failed, keeping cached page");
            }
            Refresh::Superseded | Refresh::Skipped => {}
        }
        Ok(())
    }

    /// Pull a revalidated cache entry into the collection when it belongs to
    /// the current list query. Returns true when the collection was replaced.
    pub async fn sync_from_cache(&self, cache: &ReadThroughCache, key: &str) -> SyncResult<bool> {
        let Some((query, pagination)) = self.last_query() else {
            return Ok(false);
        };
        if list_cache_key(T::KIND, &query, pagination) != key {
            return Ok(false);
        }
        match cache.local().read::<Page<T>>(key).await? {
            Some(read) => {
                self.write(|c| c.replace(read.into_value(), None));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Create on the server, then insert the returned record at the head.
    ///
    /// No placeholder is inserted: the id is unknown until the server answers.
    pub async fn create(&self, input: T::Create) -> MutationOutcome<T> {
        if let Err(e) = T::validate_create(&input) {
            return MutationOutcome::failed(e);
        }
        match self.remote.create(&input).await {
            Ok(entity) => {
                self.write(|c| c.confirm_all(vec![Confirmed::Created(entity.clone())]));
                tracing::debug!(kind = %T::KIND, id = %entity.id(), "created");
                MutationOutcome::ok(entity)
            }
            Err(e) => {
                tracing::warn!(kind = %T::KIND, error = %e, "create failed");
                MutationOutcome::failed(e)
            }
        }
    }

    pub async fn update(&self, id: &EntityId, patch: T::Patch) -> MutationOutcome<T> {
        if let Err(e) = Self::check_id(id).and_then(|_| T::validate_patch(&patch)) {
            return MutationOutcome::failed(e);
        }
        let snapshot = self.write(|c| c.begin_patch(vec![(id.clone(), patch.clone())]));
        let Some(snapshot) = snapshot else {
            return MutationOutcome::failed(self.unknown(id));
        };

        match self.remote.update(id, &patch).await {
            Ok(entity) => {
                self.write(|c| c.settle(&snapshot, vec![Confirmed::Merged(entity.clone())]));
                MutationOutcome::ok(entity)
            }
            Err(e) => self.fail_update(id, &snapshot, e).await,
        }
    }

    /// Status-only update, used for lane drag targets.
    pub async fn move_to(&self, id: &EntityId, status: T::Status) -> MutationOutcome<T>
    where
        T: Statused,
    {
        self.update(id, T::status_patch(status)).await
    }

    /// Remove immediately, then delete on the server. Deleting something the
    /// server no longer has counts as success.
    pub async fn delete(&self, id: &EntityId) -> MutationOutcome<()> {
        if let Err(e) = Self::check_id(id) {
            return MutationOutcome::failed(e);
        }
        let Some((_, snapshot)) = self.write(|c| c.begin_remove(std::slice::from_ref(id))) else {
            return MutationOutcome::failed(self.unknown(id));
        };

        match self.remote.delete(id).await {
            Ok(()) => {
                self.write(|c| c.settle(&snapshot, vec![Confirmed::Removed(id.clone())]));
                MutationOutcome::ok(())
            }
            Err(RemoteError::NotFound { .. }) => {
                tracing::debug!(kind = %T::KIND, id = %id, "already deleted on server");
                self.write(|c| c.settle(&snapshot, vec![Confirmed::Removed(id.clone())]));
                MutationOutcome::ok(())
            }
            Err(e) => {
                tracing::warn!(kind = %T::KIND, id = %id, error = %e, "delete failed, reinserting");
                self.write(|c| c.retract(&snapshot));
                self.refetch_if_wrong(&e).await;
                MutationOutcome::failed(e)
            }
        }
    }

    /// Remove every id at once and delete them in a single remote call. On
    /// failure every id comes back.
    pub async fn bulk_delete(&self, ids: &[EntityId]) -> MutationOutcome<u64> {
        if let Err(e) = Self::check_batch(ids) {
            return MutationOutcome::failed(e);
        }
        let Some((present, snapshot)) = self.write(|c| c.begin_remove(ids)) else {
            return MutationOutcome::failed(self.unknown(&ids[0]));
        };

        match self.remote.bulk_delete(&present).await {
            Ok(count) => {
                tracing::debug!(kind = %T::KIND, count, "bulk deleted");
                let removed = present.into_iter().map(Confirmed::Removed).collect();
                self.write(|c| c.settle(&snapshot, removed));
                MutationOutcome::ok(count)
            }
            Err(e) => {
                tracing::warn!(
                    kind = %T::KIND,
                    count = present.len(),
                    error = %e,
                    "bulk delete failed, rolling back batch"
                );
                self.write(|c| c.retract(&snapshot));
                self.refetch_if_wrong(&e).await;
                MutationOutcome::failed(e)
            }
        }
    }

    /// Apply `patch` to every id optimistically, then send one remote call.
    pub async fn bulk_update(&self, ids: &[EntityId], patch: T::Patch) -> MutationOutcome<Vec<T>> {
        if let Err(e) = Self::check_batch(ids).and_then(|_| T::validate_patch(&patch)) {
            return MutationOutcome::failed(e);
        }
        let changes = ids.iter().map(|id| (id.clone(), patch.clone())).collect();
        let Some(snapshot) = self.write(|c| c.begin_patch(changes)) else {
            return MutationOutcome::failed(self.unknown(&ids[0]));
        };
        let present: Vec<EntityId> = snapshot.before.iter().map(|e| e.id().clone()).collect();

        match self.remote.bulk_update(&present, &patch).await {
            Ok(entities) => {
                let merged = entities.iter().cloned().map(Confirmed::Merged).collect();
                self.write(|c| c.settle(&snapshot, merged));
                MutationOutcome::ok(entities)
            }
            Err(e) => {
                tracing::warn!(
                    kind = %T::KIND,
                    count = present.len(),
                    error = %e,
                    "bulk update failed, rolling back batch"
                );
                self.write(|c| c.retract(&snapshot));
                self.refetch_if_wrong(&e).await;
                MutationOutcome::failed(e)
            }
        }
    }

    pub async fn bulk_update_status(
        &self,
        ids: &[EntityId],
        status: T::Status,
    ) -> MutationOutcome<Vec<T>>
    where
        T: Statused,
    {
        self.bulk_update(ids, T::status_patch(status)).await
    }

    /// Send `patch` without an optimistic step and without rollback.
    ///
    /// Used by background autosave, where the edited field is already on screen.
    pub async fn persist_quietly(&self, id: &EntityId, patch: T::Patch) -> MutationOutcome<T> {
        if let Err(e) = Self::check_id(id).and_then(|_| T::validate_patch(&patch)) {
            return MutationOutcome::failed(e);
        }
        match self.remote.update(id, &patch).await {
            Ok(entity) => {
                self.write(|c| c.confirm_all(vec![Confirmed::Merged(entity.clone())]));
                MutationOutcome::ok(entity)
            }
            Err(e) => {
                tracing::warn!(kind = %T::KIND, id = %id, error = %e, "background save failed");
                MutationOutcome::failed(e)
            }
        }
    }

    // ========================================================================
    // ORDERING
    // ========================================================================

    /// Collection in display order: by order key, unkeyed last, ties by id.
    pub fn ordered(&self) -> Vec<T>
    where
        T: Ordered,
    {
        let mut items = self.items();
        items.sort_by(|a, b| compare_display_order(a.order_key(), a.id(), b.order_key(), b.id()));
        items
    }

    /// Move `id` to `target_index` of the display order.
    ///
    /// Normally only the moved record gets a new key. When its neighbours
    /// leave no room, the whole ordering is renormalized: all new keys are
    /// applied at once, one update per changed record is sent concurrently,
    /// and every key is rolled back if any of them fails.
    pub async fn reorder(&self, id: &EntityId, target_index: usize) -> MutationOutcome<OrderKey>
    where
        T: Ordered,
    {
        if let Err(e) = Self::check_id(id) {
            return MutationOutcome::failed(e);
        }
        let planned = self.write(|c| self.plan_reorder(c, id, target_index));
        let Some((plan, snapshot)) = planned else {
            return MutationOutcome::failed(self.unknown(id));
        };

        match plan {
            ReorderPlan::Single(key) => match self.remote.update(id, &T::order_patch(key)).await {
                Ok(entity) => {
                    self.write(|c| c.settle(&snapshot, vec![Confirmed::Merged(entity)]));
                    MutationOutcome::ok(key)
                }
                Err(e) => self.fail_update(id, &snapshot, e).await.map(|_: T| key),
            },
            ReorderPlan::Normalize { moved, changed } => {
                tracing::info!(kind = %T::KIND, count = changed.len(), "normalizing order keys");
                let results = join_all(changed.iter().map(|(assigned, key)| {
                    let patch = T::order_patch(*key);
                    async move { self.remote.update(assigned, &patch).await }
                }))
                .await;

                let mut first_error = None;
                let mut landed = Vec::new();
                for result in results {
                    match result {
                        Ok(entity) => landed.push(entity),
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }

                match first_error {
                    None => {
                        let merged = landed.into_iter().map(Confirmed::Merged).collect();
                        self.write(|c| c.settle(&snapshot, merged));
                        MutationOutcome::ok(moved)
                    }
                    Some(e) => {
                        tracing::warn!(
                            kind = %T::KIND,
                            landed = landed.len(),
                            error = %e,
                            "normalization failed, rolling back every key"
                        );
                        self.write(|c| c.retract(&snapshot));
                        let settled = self.revert_landed(landed, &snapshot.before).await;
                        self.write(|c| c.confirm_all(settled));
                        MutationOutcome::failed(e)
                    }
                }
            }
        }
    }

    fn plan_reorder(
        &self,
        c: &mut Collection<T>,
        id: &EntityId,
        target_index: usize,
    ) -> Option<(ReorderPlan, Snapshot<T>)>
    where
        T: Ordered,
    {
        c.position(id)?;
        let mut display: Vec<(EntityId, Option<OrderKey>)> = c
            .items
            .iter()
            .map(|item| (item.id().clone(), item.order_key()))
            .collect();
        display.sort_by(|a, b| compare_display_order(a.1, &a.0, b.1, &b.0));
        display.retain(|(other, _)| other != id);
        let target = target_index.min(display.len());

        // Unkeyed siblings leave nothing to allocate against.
        let sibling_keys: Option<Vec<OrderKey>> = display.iter().map(|(_, key)| *key).collect();
        let allocation = sibling_keys.map(|keys| self.allocator.allocate(&keys, target));

        if let Some(Allocation::Key(key)) = allocation {
            let snapshot = c.begin(PendingWrite::Patch {
                changes: vec![(id.clone(), T::order_patch(key))],
                at: Utc::now(),
            });
            return Some((ReorderPlan::Single(key), snapshot));
        }

        let sibling_ids: Vec<EntityId> = display.into_iter().map(|(other, _)| other).collect();
        let normalized = self
            .allocator
            .place_and_normalize(&sibling_ids, id.clone(), target);
        let mut moved = self.allocator.gap();
        let mut changed = Vec::new();
        for (item_id, key) in normalized {
            if &item_id == id {
                moved = key;
            }
            let current = c
                .items
                .iter()
                .find(|item| item.id() == &item_id)
                .and_then(|item| item.order_key());
            if current != Some(key) {
                changed.push((item_id, key));
            }
        }
        let snapshot = c.begin(PendingWrite::Patch {
            changes: changed
                .iter()
                .map(|(item_id, key)| (item_id.clone(), T::order_patch(*key)))
                .collect(),
            at: Utc::now(),
        });
        Some((ReorderPlan::Normalize { moved, changed }, snapshot))
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Put back the confirmed keys of the updates that landed before a
    /// normalization failed. Returns what the server holds afterwards.
    async fn revert_landed(&self, landed: Vec<T>, previous: &[T]) -> Vec<Confirmed<T>>
    where
        T: Ordered,
    {
        let reverts = landed.into_iter().map(|entity| {
            let key = previous
                .iter()
                .find(|before| before.id() == entity.id())
                .and_then(|before| before.order_key());
            async move {
                let Some(key) = key else {
                    tracing::warn!(kind = %T::KIND, id = %entity.id(), "cannot revert key of unkeyed record");
                    return Confirmed::Merged(entity);
                };
                match self.remote.update(entity.id(), &T::order_patch(key)).await {
                    Ok(reverted) => Confirmed::Merged(reverted),
                    Err(e) => {
                        tracing::warn!(kind = %T::KIND, id = %entity.id(), error = %e, "order key revert failed");
                        Confirmed::Merged(entity)
                    }
                }
            }
        });
        join_all(reverts).await
    }

    /// Failure branch shared by `update` and single-key reorders.
    async fn fail_update(
        &self,
        id: &EntityId,
        snapshot: &Snapshot<T>,
        error: RemoteError,
    ) -> MutationOutcome<T> {
        let error = SyncError::from(error);
        match error.class() {
            ErrorClass::NotFound => {
                tracing::warn!(kind = %T::KIND, id = %id, "record gone on server, removing locally");
                self.write(|c| c.settle(snapshot, vec![Confirmed::Removed(id.clone())]));
            }
            ErrorClass::Conflict => {
                tracing::warn!(kind = %T::KIND, id = %id, "conflict, restoring and refetching");
                self.write(|c| c.retract(snapshot));
                self.refetch_logged().await;
            }
            _ => {
                tracing::warn!(kind = %T::KIND, id = %id, error = %error, "update failed, rolling back");
                self.write(|c| c.retract(snapshot));
            }
        }
        MutationOutcome::failed(error)
    }

    /// Not-found and conflict mean the local guess is provably wrong.
    async fn refetch_if_wrong(&self, error: &RemoteError) {
        if matches!(
            error,
            RemoteError::NotFound { .. } | RemoteError::Conflict { .. }
        ) {
            self.refetch_logged().await;
        }
    }

    async fn refetch_logged(&self) {
        if let Err(e) = self.refresh_last().await {
            tracing::warn!(kind = %T::KIND, error = %e, "refetch after failure did not complete");
        }
    }

    fn check_id(id: &EntityId) -> Result<(), ValidationError> {
        if id.is_local() {
            return Err(ValidationError::LocalIdRejected { id: id.clone() });
        }
        Ok(())
    }

    fn check_batch(ids: &[EntityId]) -> Result<(), ValidationError> {
        if ids.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        ids.iter().try_for_each(Self::check_id)
    }

    fn unknown(&self, id: &EntityId) -> SyncError {
        SyncError::UnknownEntity {
            kind: T::KIND,
            id: id.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Collection<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read<U>(&self, f: impl FnOnce(&Collection<T>) -> U) -> U {
        f(&self.lock())
    }

    fn write<U>(&self, f: impl FnOnce(&mut Collection<T>) -> U) -> U {
        let result = f(&mut self.lock());
        self.version.send_modify(|v| *v = v.wrapping_add(1));
        result
    }
}

/// Fetches one list page for the read-through cache.
struct ListFetcher<T, R: ?Sized> {
    remote: Arc<R>,
    query: ListQuery,
    pagination: Pagination,
    _entity: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: Entity, R: RemoteClient<T> + ?Sized> Fetcher<Page<T>> for ListFetcher<T, R> {
    async fn fetch(&self) -> SyncResult<Page<T>> {
        Ok(self.remote.list(&self.query, self.pagination).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockOp, MockRemote};
    use margin_core::{CreateTask, Task, TaskPatch, TaskStatus};

    async fn seeded(titles: &[&str]) -> (Arc<MockRemote<Task>>, EntityStore<Task, MockRemote<Task>>) {
        let remote = Arc::new(MockRemote::new());
        for title in titles.iter().rev() {
            remote.create(&CreateTask::titled(*title)).await.unwrap();
        }
        let store = EntityStore::new(Arc::clone(&remote));
        store.refresh(ListQuery::all(), Pagination::default()).await.unwrap();
        (remote, store)
    }

    #[tokio::test]
    async fn test_create_inserts_at_head() {
        let (_remote, store) = seeded(&["a"]).await;
        let outcome = store.create(CreateTask::titled("b")).await;
        assert!(outcome.success);
        assert_eq!(store.items()[0].title, "b");
        assert_eq!(store.total(), 2);
    }

    #[tokio::test]
    async fn test_create_validation_never_calls_remote() {
        let (remote, store) = seeded(&[]).await;
        let outcome = store.create(CreateTask::titled("")).await;
        assert_eq!(outcome.error_class(), Some(ErrorClass::Validation));
        assert_eq!(remote.calls(MockOp::Create), 0);
    }

    #[tokio::test]
    async fn test_update_rolls_back_on_network_error() {
        let (remote, store) = seeded(&["a"]).await;
        let id = store.ids()[0].clone();
        let before = store.get(&id).unwrap();
        remote.fail_next(MockOp::Update, RemoteError::network("reset"));

        let outcome = store
            .update(
                &id,
                TaskPatch {
                    title: Some("changed".to_string()),
                    ..TaskPatch::default()
                },
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(store.get(&id), Some(before));
    }

    #[tokio::test]
    async fn test_update_not_found_removes_locally() {
        let (remote, store) = seeded(&["a", "b"]).await;
        let id = store.ids()[0].clone();
        remote.remove_record(&id);

        let outcome = store.move_to(&id, TaskStatus::Done).await;
        assert_eq!(outcome.error_class(), Some(ErrorClass::NotFound));
        assert!(!store.contains(&id));
        assert_eq!(store.total(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_on_server_is_success() {
        let (remote, store) = seeded(&["a"]).await;
        let id = store.ids()[0].clone();
        remote.remove_record(&id);
        assert!(store.delete(&id).await.success);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_local_ids_are_rejected() {
        let (remote, store) = seeded(&["a"]).await;
        let outcome = store.delete(&EntityId::new_local()).await;
        assert_eq!(outcome.error_class(), Some(ErrorClass::Validation));
        assert_eq!(remote.calls(MockOp::Delete), 0);
    }

    async fn keyed(keys: &[(&str, OrderKey)]) -> (Arc<MockRemote<Task>>, EntityStore<Task, MockRemote<Task>>) {
        let remote = Arc::new(MockRemote::new());
        for (title, key) in keys {
            let input = CreateTask {
                order: Some(*key),
                ..CreateTask::titled(*title)
            };
            remote.create(&input).await.unwrap();
        }
        let store = EntityStore::new(Arc::clone(&remote));
        store.refresh(ListQuery::all(), Pagination::default()).await.unwrap();
        (remote, store)
    }

    fn ordered_titles(store: &EntityStore<Task, MockRemote<Task>>) -> Vec<String> {
        store.ordered().into_iter().map(|t| t.title).collect()
    }

    #[tokio::test]
    async fn test_reorder_between_neighbours_uses_midpoint() {
        let (_remote, store) = keyed(&[("a", 1000), ("b", 2000), ("c", 3000)]).await;
        let c = store.ordered()[2].id.clone();
        let outcome = store.reorder(&c, 1).await;
        assert_eq!(outcome.data, Some(1500));
        assert_eq!(ordered_titles(&store), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_reorder_without_room_normalizes() {
        let (remote, store) = keyed(&[("a", 1000), ("b", 1001), ("c", 3000)]).await;
        let c = store.ordered()[2].id.clone();
        let outcome = store.reorder(&c, 1).await;
        assert!(outcome.success);
        assert_eq!(ordered_titles(&store), vec!["a", "c", "b"]);
        let keys: Vec<_> = store.ordered().iter().map(|t| t.order).collect();
        assert_eq!(keys, vec![Some(1000), Some(2000), Some(3000)]);
        // "a" kept its key, so only two writes went out.
        assert_eq!(remote.calls(MockOp::Update), 2);
    }

    #[tokio::test]
    async fn test_failed_normalization_restores_every_key() {
        let (remote, store) = keyed(&[("a", 1000), ("b", 1001), ("c", 3000)]).await;
        let before: Vec<_> = store.ordered().iter().map(|t| (t.id.clone(), t.order)).collect();
        let c = store.ordered()[2].id.clone();
        remote.fail_next(MockOp::Update, RemoteError::network("reset"));

        let outcome = store.reorder(&c, 1).await;
        assert_eq!(outcome.error_class(), Some(ErrorClass::Transient));
        let after: Vec<_> = store.ordered().iter().map(|t| (t.id.clone(), t.order)).collect();
        assert_eq!(after, before);
        for (id, key) in before {
            assert_eq!(remote.record(&id).unwrap().order, key);
        }
    }

    #[tokio::test]
    async fn test_bulk_delete_failure_restores_positions() {
        let (remote, store) = seeded(&["a", "b", "c", "d"]).await;
        let ids = store.ids();
        let picked = vec![ids[1].clone(), ids[3].clone()];
        remote.fail_next(MockOp::BulkDelete, RemoteError::network("reset"));

        let outcome = store.bulk_delete(&picked).await;
        assert!(!outcome.success);
        assert_eq!(store.ids(), ids);
        assert_eq!(store.total(), 4);
    }

    #[tokio::test]
    async fn test_version_bumps_on_writes() {
        let (_remote, store) = seeded(&["a"]).await;
        let rx = store.subscribe();
        let before = *rx.borrow();
        let _ = store.create(CreateTask::titled("b")).await;
        assert!(store.version() > before);
    }

    fn retitle(title: &str) -> TaskPatch {
        TaskPatch {
            title: Some(title.to_string()),
            ..TaskPatch::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_keeps_overlapping_confirmed_write() {
        let (remote, store) = seeded(&["a"]).await;
        let id = store.ids()[0].clone();
        remote.set_latency(MockOp::Update, Duration::from_millis(20));
        remote.set_latency(MockOp::BulkUpdate, Duration::from_millis(1));
        remote.fail_next(MockOp::Update, RemoteError::network("reset"));

        let noted = TaskPatch {
            notes: Some("x".to_string()),
            ..TaskPatch::default()
        };
        let (renamed, annotated) = tokio::join!(
            store.update(&id, retitle("a2")),
            store.bulk_update(std::slice::from_ref(&id), noted),
        );
        assert!(!renamed.success);
        assert!(annotated.success);

        let local = store.get(&id).unwrap();
        assert_eq!(local.title, "a");
        assert_eq!(local.notes.as_deref(), Some("x"));
        assert_eq!(store.items(), remote.records());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_failed_updates_both_roll_back() {
        let (remote, store) = seeded(&["a"]).await;
        let id = store.ids()[0].clone();
        remote.set_latency(MockOp::Update, Duration::from_millis(5));
        remote.fail_always(MockOp::Update, RemoteError::network("down"));

        let (first, second) = tokio::join!(store.update(&id, retitle("A")), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            store.update(&id, retitle("B")).await
        });
        assert!(!first.success);
        assert!(!second.success);
        assert_eq!(store.get(&id).unwrap().title, "a");
        assert_eq!(store.items(), remote.records());
        assert!(!store.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_updates_settle_to_server_state() {
        let (remote, store) = seeded(&["a"]).await;
        let id = store.ids()[0].clone();
        remote.set_latency(MockOp::Update, Duration::from_millis(5));
        remote.fail_next(MockOp::Update, RemoteError::network("reset"));

        // The first call fails, the second one lands.
        let (first, second) = tokio::join!(store.update(&id, retitle("A")), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            store.update(&id, retitle("B")).await
        });
        assert!(!first.success);
        assert!(second.success);
        assert_eq!(store.get(&id).unwrap().title, "B");
        assert_eq!(store.items(), remote.records());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_during_delete_keeps_record_hidden() {
        let (remote, store) = seeded(&["a", "b"]).await;
        let id = store.ids()[0].clone();
        remote.set_latency(MockOp::Delete, Duration::from_millis(20));

        let (deleted, refreshed) = tokio::join!(store.delete(&id), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let refreshed = store.refresh(ListQuery::all(), Pagination::default()).await;
            // The page still lists the record, the pending delete hides it.
            assert!(!store.contains(&id));
            assert_eq!(store.total(), 1);
            refreshed
        });
        assert!(deleted.success);
        assert!(refreshed.is_ok());
        assert!(!store.contains(&id));
        assert!(remote.record(&id).is_none());
        assert_eq!(store.items(), remote.records());
        assert_eq!(store.total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_during_update_keeps_optimistic_title() {
        let (remote, store) = seeded(&["a"]).await;
        let id = store.ids()[0].clone();
        remote.set_latency(MockOp::Update, Duration::from_millis(20));

        let (updated, _) = tokio::join!(store.update(&id, retitle("a2")), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            store.refresh_last().await.unwrap();
            assert_eq!(store.get(&id).unwrap().title, "a2");
        });
        assert!(updated.success);
        assert_eq!(store.items(), remote.records());
    }

    // ========================================================================
    // PROPERTY TESTS
    // ========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Rename { index: usize, title: String, fail: bool },
        Delete { index: usize, fail: bool },
    }

    fn arb_op() -> impl proptest::strategy::Strategy<Value = Op> {
        use proptest::prelude::*;
        prop_oneof![
            (0usize..6, "[a-z]{1,8}", any::<bool>())
                .prop_map(|(index, title, fail)| Op::Rename { index, title, fail }),
            (0usize..6, any::<bool>()).prop_map(|(index, fail)| Op::Delete { index, fail }),
        ]
    }

    proptest::proptest! {
        #[test]
        fn prop_settled_store_matches_server(ops in proptest::collection::vec(arb_op(), 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (remote, store) = seeded(&["a", "b", "c", "d", "e", "f"]).await;
                for op in ops {
                    let ids = store.ids();
                    if ids.is_empty() {
                        break;
                    }
                    match op {
                        Op::Rename { index, title, fail } => {
                            if fail {
                                remote.fail_next(MockOp::Update, RemoteError::network("reset"));
                            }
                            let patch = TaskPatch {
                                title: Some(title),
                                ..TaskPatch::default()
                            };
                            let outcome = store.update(&ids[index % ids.len()], patch).await;
                            assert_eq!(outcome.success, !fail);
                        }
                        Op::Delete { index, fail } => {
                            if fail {
                                remote.fail_next(MockOp::Delete, RemoteError::network("reset"));
                            }
                            let outcome = store.delete(&ids[index % ids.len()]).await;
                            assert_eq!(outcome.success, !fail);
                        }
                    }
                    remote.clear_failures();
                    // No mutation in flight: local view equals confirmed server state.
                    assert_eq!(store.items(), remote.records());
                    assert_eq!(store.total(), remote.records().len() as u64);
                }
            });
        }
    }
}
