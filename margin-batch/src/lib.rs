//! MARGIN Batch - multi-select over entity lists
//!
//! The selection state machine, its keyboard contract, and dispatch of bulk
//! actions into an entity store.

mod dispatch;
mod keys;
mod selection;

pub use dispatch::{delete_selected, dispatch, set_status_selected, BulkAction};
pub use keys::{map_batch_key, BatchKeyAction, Focus, BATCH_TOGGLE_KEY};
pub use selection::{BatchSelectionController, SelectionMode, SelectionSet};
