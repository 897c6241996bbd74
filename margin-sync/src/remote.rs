//! Network boundary consumed by the stores.

use async_trait::async_trait;
use margin_core::{Entity, EntityId, ListQuery, Page, Pagination, RemoteError};

/// CRUD surface of the remote store for one entity kind.
///
/// Only `delete` is assumed idempotent; callers never retry the others
/// blindly.
#[async_trait]
pub trait RemoteClient<T: Entity>: Send + Sync + 'static {
    async fn list(&self, query: &ListQuery, pagination: Pagination)
        -> Result<Page<T>, RemoteError>;

    async fn create(&self, input: &T::Create) -> Result<T, RemoteError>;

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> Result<T, RemoteError>;

    async fn delete(&self, id: &EntityId) -> Result<(), RemoteError>;

    /// Returns how many records the server removed.
    async fn bulk_delete(&self, ids: &[EntityId]) -> Result<u64, RemoteError>;

    async fn bulk_update(&self, ids: &[EntityId], patch: &T::Patch)
        -> Result<Vec<T>, RemoteError>;
}
