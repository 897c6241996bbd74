//! Composition root: one connectivity signal, one key-value store, one cache,
//! and a store per entity kind.

use std::sync::{Arc, Mutex, MutexGuard};

use margin_core::{
    Conversation, FileRecord, ListQuery, Note, OrderKeyAllocator, Pagination, Source, SyncConfig,
    Task,
};
use margin_storage::{
    AppFlags, Connectivity, InMemoryKv, KvStore, LmdbKv, LocalCache, ReadThroughCache,
    INSTALLED_APP_FLAG,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::rest::{HttpTransport, RestRemote};
use crate::{ClientResult, DraftStore, EntityStore, RemoteClient};

pub type SharedStore<T> = Arc<EntityStore<T, dyn RemoteClient<T>>>;
pub type SharedDrafts<T> = Arc<DraftStore<T, dyn RemoteClient<T>>>;

/// One remote client per entity kind.
pub struct Remotes {
    pub tasks: Arc<dyn RemoteClient<Task>>,
    pub notes: Arc<dyn RemoteClient<Note>>,
    pub sources: Arc<dyn RemoteClient<Source>>,
    pub conversations: Arc<dyn RemoteClient<Conversation>>,
    pub files: Arc<dyn RemoteClient<FileRecord>>,
}

impl Remotes {
    pub fn rest(transport: &HttpTransport) -> Self {
        Self {
            tasks: Arc::new(RestRemote::<Task>::new(transport.clone())),
            notes: Arc::new(RestRemote::<Note>::new(transport.clone())),
            sources: Arc::new(RestRemote::<Source>::new(transport.clone())),
            conversations: Arc::new(RestRemote::<Conversation>::new(transport.clone())),
            files: Arc::new(RestRemote::<FileRecord>::new(transport.clone())),
        }
    }
}

pub struct Session {
    sync: SyncConfig,
    connectivity: Connectivity,
    cache: ReadThroughCache,
    flags: AppFlags,
    pub tasks: SharedStore<Task>,
    pub notes: SharedStore<Note>,
    pub sources: SharedStore<Source>,
    pub conversations: SharedStore<Conversation>,
    pub files: SharedStore<FileRecord>,
    pub task_drafts: SharedDrafts<Task>,
    pub note_drafts: SharedDrafts<Note>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Open a session against the configured REST API.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(config: &ClientConfig) -> ClientResult<Self> {
        let kv: Arc<dyn KvStore> = match &config.storage_path {
            Some(path) => Arc::new(LmdbKv::open(path, config.storage_max_mb)?),
            None => {
                tracing::warn!("no storage_path configured, drafts will not survive a restart");
                Arc::new(InMemoryKv::new())
            }
        };
        let transport = HttpTransport::new(config)?;
        let session = Self::assemble(
            config.sync.clone(),
            kv,
            Connectivity::new(!config.start_offline),
            Remotes::rest(&transport),
        );
        session.load_drafts().await?;
        tracing::info!(
            api_base_url = transport.base_url(),
            online = session.connectivity.is_online(),
            "session opened"
        );
        Ok(session)
    }

    /// Wire the stores together and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn assemble(
        sync: SyncConfig,
        kv: Arc<dyn KvStore>,
        connectivity: Connectivity,
        remotes: Remotes,
    ) -> Self {
        let local = Arc::new(LocalCache::new(Arc::clone(&kv), sync.stale_threshold()));
        let cache = ReadThroughCache::new(local, connectivity.clone());
        let allocator = OrderKeyAllocator::new(sync.order_gap);

        let tasks: SharedStore<Task> = Arc::new(EntityStore::with_allocator(remotes.tasks, allocator));
        let notes: SharedStore<Note> = Arc::new(EntityStore::with_allocator(remotes.notes, allocator));
        let sources: SharedStore<Source> =
            Arc::new(EntityStore::with_allocator(remotes.sources, allocator));
        let conversations: SharedStore<Conversation> =
            Arc::new(EntityStore::with_allocator(remotes.conversations, allocator));
        let files: SharedStore<FileRecord> =
            Arc::new(EntityStore::with_allocator(remotes.files, allocator));

        let task_drafts = Arc::new(DraftStore::new(Arc::clone(&tasks), Arc::clone(&kv)));
        let note_drafts = Arc::new(DraftStore::new(Arc::clone(&notes), Arc::clone(&kv)));

        let session = Self {
            sync,
            connectivity,
            flags: AppFlags::new(kv),
            cache,
            tasks,
            notes,
            sources,
            conversations,
            files,
            task_drafts,
            note_drafts,
            background: Mutex::new(Vec::new()),
        };
        let watcher = session.cache.spawn_reconnect_watcher();
        let follower = session.spawn_cache_follower();
        session.track(watcher);
        session.track(follower);
        session
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn cache(&self) -> &ReadThroughCache {
        &self.cache
    }

    pub fn first_page(&self) -> Pagination {
        Pagination::first(self.sync.page_size)
    }

    /// Reachability changed. Going online revalidates stale cache entries.
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    pub async fn load_drafts(&self) -> ClientResult<usize> {
        let tasks = self.task_drafts.load().await?;
        let notes = self.note_drafts.load().await?;
        Ok(tasks + notes)
    }

    /// Task list through the cache: cached first, then fresh.
    pub async fn load_tasks(&self, query: ListQuery) -> ClientResult<()> {
        self.tasks
            .load_through(&self.cache, query, self.first_page())
            .await?;
        Ok(())
    }

    pub async fn is_installed(&self) -> ClientResult<bool> {
        Ok(self.flags.is_set(INSTALLED_APP_FLAG).await?)
    }

    pub async fn mark_installed(&self) -> ClientResult<()> {
        self.flags.set(INSTALLED_APP_FLAG, true).await?;
        Ok(())
    }

    /// Flush pending autosaves, then stop the background tasks.
    pub async fn close(self) {
        self.task_drafts.settle().await;
        self.note_drafts.settle().await;
        let handles: Vec<JoinHandle<()>> = self.background_handles().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        // Wait until the tasks have dropped their handles on the stores.
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("session closed");
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.background_handles().push(handle);
    }

    fn background_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pull revalidated cache entries into whichever store is showing them.
    fn spawn_cache_follower(&self) -> JoinHandle<()> {
        let mut updates = self.cache.subscribe();
        let cache = self.cache.clone();
        let tasks = Arc::clone(&self.tasks);
        let notes = Arc::clone(&self.notes);
        let sources = Arc::clone(&self.sources);
        let conversations = Arc::clone(&self.conversations);
        let files = Arc::clone(&self.files);

        tokio::spawn(async move {
            loop {
                let key = match updates.recv().await {
                    Ok(key) => key,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "cache follower lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let results = [
                    tasks.sync_from_cache(&cache, &key).await,
                    notes.sync_from_cache(&cache, &key).await,
                    sources.sync_from_cache(&cache, &key).await,
                    conversations.sync_from_cache(&cache, &key).await,
                    files.sync_from_cache(&cache, &key).await,
                ];
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!(key = %key, error = %e, "failed to apply cache update");
                    }
                }
            }
        })
    }
}
