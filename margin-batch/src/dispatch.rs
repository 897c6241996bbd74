//! Bulk actions over the current selection.

use margin_core::{Entity, EntityId, MutationOutcome, Statused};
use margin_sync::{EntityStore, RemoteClient};

use crate::selection::BatchSelectionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction<S> {
    Delete,
    SetStatus(S),
}

/// Delete every selected record in one batch.
///
/// Success leaves batch mode. Failure keeps the selection so the user can
/// retry; the store has already restored the records.
pub async fn delete_selected<T, R>(
    controller: &mut BatchSelectionController,
    store: &EntityStore<T, R>,
) -> MutationOutcome<u64>
where
    T: Entity,
    R: RemoteClient<T> + ?Sized,
{
    let ids = controller.selected_ids();
    let outcome = store.bulk_delete(&ids).await;
    finish(controller, store.ids(), &outcome, ids.len());
    outcome
}

/// Move every selected record to `status` in one batch. Returns how many
/// records the server updated.
pub async fn set_status_selected<T, R>(
    controller: &mut BatchSelectionController,
    store: &EntityStore<T, R>,
    status: T::Status,
) -> MutationOutcome<u64>
where
    T: Statused,
    R: RemoteClient<T> + ?Sized,
{
    let ids = controller.selected_ids();
    let outcome = store
        .bulk_update_status(&ids, status)
        .await
        .map(|updated| updated.len() as u64);
    finish(controller, store.ids(), &outcome, ids.len());
    outcome
}

pub async fn dispatch<T, R>(
    controller: &mut BatchSelectionController,
    store: &EntityStore<T, R>,
    action: BulkAction<T::Status>,
) -> MutationOutcome<u64>
where
    T: Statused,
    R: RemoteClient<T> + ?Sized,
{
    match action {
        BulkAction::Delete => delete_selected(controller, store).await,
        BulkAction::SetStatus(status) => set_status_selected(controller, store, status).await,
    }
}

fn finish<T>(
    controller: &mut BatchSelectionController,
    remaining: Vec<EntityId>,
    outcome: &MutationOutcome<T>,
    requested: usize,
) {
    if outcome.success {
        tracing::info!(count = requested, "bulk action applied");
        controller.exit();
    } else {
        tracing::warn!(
            count = requested,
            error = ?outcome.error,
            "bulk action failed, keeping selection"
        );
    }
    // Keep the selection a subset of what is still displayed.
    let visible: Vec<_> = controller
        .visible()
        .iter()
        .filter(|id| remaining.contains(id))
        .cloned()
        .collect();
    controller.set_visible(visible);
}
