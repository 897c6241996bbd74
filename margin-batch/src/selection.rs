//! Batch selection over a displayed list.

use std::collections::HashSet;

use margin_core::{EntityId, SyncConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMode {
    #[default]
    Idle,
    Batch,
}

/// Selected ids plus the anchor used by range selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSet {
    ids: HashSet<EntityId>,
    anchor: Option<EntityId>,
}

impl SelectionSet {
    pub fn contains(&self, id: &EntityId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Id most recently toggled or range-selected.
    pub fn anchor(&self) -> Option<&EntityId> {
        self.anchor.as_ref()
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.anchor = None;
    }
}

/// Selection state machine: `Idle -> Batch -> Idle`.
///
/// The selection is always a subset of the visible ids. Leaving batch mode
/// clears it.
#[derive(Debug, Clone, Default)]
pub struct BatchSelectionController {
    mode: SelectionMode,
    visible: Vec<EntityId>,
    selection: SelectionSet,
    max_selection: Option<usize>,
}

impl BatchSelectionController {
    pub fn new(max_selection: Option<usize>) -> Self {
        Self {
            max_selection,
            ..Self::default()
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_selection)
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn is_batch_mode(&self) -> bool {
        self.mode == SelectionMode::Batch
    }

    pub fn selection(&self) -> &SelectionSet {
        &self.selection
    }

    pub fn max_selection(&self) -> Option<usize> {
        self.max_selection
    }

    pub fn visible(&self) -> &[EntityId] {
        &self.visible
    }

    pub fn is_selected(&self, id: &EntityId) -> bool {
        self.selection.contains(id)
    }

    pub fn selected_count(&self) -> usize {
        self.selection.len()
    }

    /// Selected ids in display order.
    pub fn selected_ids(&self) -> Vec<EntityId> {
        self.visible
            .iter()
            .filter(|id| self.selection.contains(id))
            .cloned()
            .collect()
    }

    /// Replace the displayed list, dropping selected ids that disappeared.
    pub fn set_visible(&mut self, visible: Vec<EntityId>) {
        self.visible = visible;
        let shown: HashSet<&EntityId> = self.visible.iter().collect();
        let before = self.selection.len();
        self.selection.ids.retain(|id| shown.contains(id));
        if self
            .selection
            .anchor
            .as_ref()
            .is_some_and(|anchor| !shown.contains(anchor))
        {
            self.selection.anchor = None;
        }
        let pruned = before - self.selection.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned selection after refresh");
        }
    }

    pub fn enter(&mut self) {
        self.mode = SelectionMode::Batch;
    }

    pub fn exit(&mut self) {
        self.mode = SelectionMode::Idle;
        self.selection.clear();
    }

    pub fn toggle_mode(&mut self) {
        match self.mode {
            SelectionMode::Idle => self.enter(),
            SelectionMode::Batch => self.exit(),
        }
    }

    /// Flip one id. Toggling while idle enters batch mode.
    ///
    /// Returns false when nothing changed: the id is not visible, or the
    /// selection is full.
    pub fn toggle(&mut self, id: &EntityId) -> bool {
        if !self.visible.contains(id) {
            return false;
        }
        if self.selection.ids.remove(id) {
            self.selection.anchor = Some(id.clone());
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.enter();
        self.selection.ids.insert(id.clone());
        self.selection.anchor = Some(id.clone());
        true
    }

    /// Select every visible id between the anchor and `to`, inclusive, in
    /// either direction. `to` becomes the new anchor. Without an anchor this
    /// is a plain [`toggle`](Self::toggle).
    pub fn select_range(&mut self, to: &EntityId) -> bool {
        let Some(to_index) = self.position(to) else {
            return false;
        };
        let Some(anchor_index) = self.selection.anchor.as_ref().and_then(|a| self.position(a))
        else {
            return self.toggle(to);
        };

        let (start, end) = if anchor_index <= to_index {
            (anchor_index, to_index)
        } else {
            (to_index, anchor_index)
        };
        self.enter();
        let range: Vec<EntityId> = self.visible[start..=end].to_vec();
        let added = self.add_all(range);
        self.selection.anchor = Some(to.clone());
        added > 0
    }

    /// Select every visible id, up to the selection cap, in display order.
    pub fn select_all(&mut self) -> usize {
        self.enter();
        self.add_all(self.visible.clone())
    }

    /// Clear the selection but stay in batch mode.
    pub fn deselect_all(&mut self) {
        self.selection.clear();
    }

    pub fn toggle_select_all(&mut self) {
        let reachable = match self.max_selection {
            Some(max) => max.min(self.visible.len()),
            None => self.visible.len(),
        };
        if reachable > 0 && self.selection.len() >= reachable {
            self.deselect_all();
        } else {
            self.select_all();
        }
    }

    /// Escape: clear a non-empty selection, otherwise leave batch mode.
    pub fn escape(&mut self) {
        if !self.selection.is_empty() {
            self.deselect_all();
        } else if self.is_batch_mode() {
            self.exit();
        }
    }

    fn add_all(&mut self, ids: Vec<EntityId>) -> usize {
        let mut added = 0;
        for id in ids {
            if self.selection.contains(&id) {
                continue;
            }
            if self.is_full() {
                tracing::debug!(max = ?self.max_selection, "selection cap reached");
                break;
            }
            self.selection.ids.insert(id);
            added += 1;
        }
        added
    }

    fn is_full(&self) -> bool {
        self.max_selection
            .is_some_and(|max| self.selection.len() >= max)
    }

    fn position(&self, id: &EntityId) -> Option<usize> {
        self.visible.iter().position(|visible| visible == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<EntityId> {
        names.iter().map(|n| EntityId::new(*n)).collect()
    }

    fn controller(names: &[&str], max: Option<usize>) -> BatchSelectionController {
        let mut controller = BatchSelectionController::new(max);
        controller.set_visible(ids(names));
        controller
    }

    #[test]
    fn test_toggle_in_idle_enters_batch_mode() {
        let mut c = controller(&["a", "b"], None);
        assert!(c.toggle(&EntityId::new("a")));
        assert!(c.is_batch_mode());
        assert_eq!(c.selected_ids(), ids(&["a"]));

        assert!(c.toggle(&EntityId::new("a")));
        assert!(c.selection().is_empty());
        assert!(c.is_batch_mode());
    }

    #[test]
    fn test_invisible_ids_are_ignored() {
        let mut c = controller(&["a"], None);
        assert!(!c.toggle(&EntityId::new("zzz")));
        assert_eq!(c.mode(), SelectionMode::Idle);
    }

    #[test]
    fn test_range_is_direction_independent() {
        let mut c = controller(&["a", "b", "c", "d"], None);
        c.toggle(&EntityId::new("d"));
        c.select_range(&EntityId::new("b"));
        assert_eq!(c.selected_ids(), ids(&["b", "c", "d"]));
        assert_eq!(c.selection().anchor(), Some(&EntityId::new("b")));
    }

    #[test]
    fn test_range_without_anchor_toggles() {
        let mut c = controller(&["a", "b", "c"], None);
        assert!(c.select_range(&EntityId::new("b")));
        assert_eq!(c.selected_ids(), ids(&["b"]));
    }

    #[test]
    fn test_cap_drops_excess_in_display_order() {
        let mut c = controller(&["a", "b", "c", "d"], Some(2));
        assert_eq!(c.select_all(), 2);
        assert_eq!(c.selected_ids(), ids(&["a", "b"]));
        assert!(!c.toggle(&EntityId::new("c")));
    }

    #[test]
    fn test_toggle_select_all_flips() {
        let mut c = controller(&["a", "b"], None);
        c.toggle_select_all();
        assert_eq!(c.selected_count(), 2);
        c.toggle_select_all();
        assert_eq!(c.selected_count(), 0);
    }

    #[test]
    fn test_refresh_prunes_selection_and_anchor() {
        let mut c = controller(&["a", "b", "c"], None);
        c.toggle(&EntityId::new("a"));
        c.toggle(&EntityId::new("c"));
        c.set_visible(ids(&["a", "b"]));
        assert_eq!(c.selected_ids(), ids(&["a"]));
        assert_eq!(c.selection().anchor(), None);
    }

    #[test]
    fn test_escape_clears_then_exits() {
        let mut c = controller(&["a"], None);
        c.toggle(&EntityId::new("a"));
        c.escape();
        assert!(c.is_batch_mode());
        assert!(c.selection().is_empty());
        c.escape();
        assert_eq!(c.mode(), SelectionMode::Idle);
    }

    #[test]
    fn test_exit_clears_selection() {
        let mut c = controller(&["a", "b"], None);
        c.select_all();
        c.exit();
        assert_eq!(c.mode(), SelectionMode::Idle);
        assert_eq!(c.selected_count(), 0);
    }
}
