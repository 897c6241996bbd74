//! Keybindings for batch selection.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::selection::BatchSelectionController;

/// Key that enters and leaves batch mode.
pub const BATCH_TOGGLE_KEY: char = 'b';

/// Where keyboard focus currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Focus {
    #[default]
    List,
    TextInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKeyAction {
    Escape,
    ToggleMode,
    SelectAll,
}

/// Map a key event to a batch action.
///
/// Everything is ignored while a text input has focus, so typing never
/// changes the selection. The select-all shortcut (Ctrl+A, or Cmd+A where the
/// terminal reports it) only applies in batch mode.
pub fn map_batch_key(event: KeyEvent, focus: Focus, batch_mode: bool) -> Option<BatchKeyAction> {
    if focus == Focus::TextInput || event.kind == KeyEventKind::Release {
        return None;
    }
    let KeyEvent {
        code, modifiers, ..
    } = event;

    if modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::SUPER) {
        return match code {
            KeyCode::Char('a') | KeyCode::Char('A') if batch_mode => Some(BatchKeyAction::SelectAll),
            _ => None,
        };
    }

    match code {
        KeyCode::Esc => Some(BatchKeyAction::Escape),
        KeyCode::Char(BATCH_TOGGLE_KEY) => Some(BatchKeyAction::ToggleMode),
        _ => None,
    }
}

impl BatchSelectionController {
    /// Apply a key event. Returns true when the event was consumed.
    pub fn handle_key(&mut self, event: KeyEvent, focus: Focus) -> bool {
        let Some(action) = map_batch_key(event, focus, self.is_batch_mode()) else {
            return false;
        };
        match action {
            BatchKeyAction::Escape => {
                if !self.is_batch_mode() && self.selection().is_empty() {
                    return false;
                }
                self.escape();
            }
            BatchKeyAction::ToggleMode => self.toggle_mode(),
            BatchKeyAction::SelectAll => {
                self.select_all();
            }
        }
        true
    }
}
