//! Property tests for the batch selection state machine.

use margin_batch::{BatchSelectionController, SelectionMode};
use margin_core::EntityId;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Toggle(usize),
    Range(usize),
    SelectAll,
    DeselectAll,
    ToggleSelectAll,
    Escape,
    ToggleMode,
    Shrink(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..12).prop_map(Op::Toggle),
        (0usize..12).prop_map(Op::Range),
        Just(Op::SelectAll),
        Just(Op::DeselectAll),
        Just(Op::ToggleSelectAll),
        Just(Op::Escape),
        Just(Op::ToggleMode),
        (0usize..10).prop_map(Op::Shrink),
    ]
}

fn id(n: usize) -> EntityId {
    EntityId::new(format!("srv-{n}"))
}

fn apply(controller: &mut BatchSelectionController, op: &Op) {
    match op {
        Op::Toggle(n) => {
            controller.toggle(&id(*n));
        }
        Op::Range(n) => {
            controller.select_range(&id(*n));
        }
        Op::SelectAll => {
            controller.select_all();
        }
        Op::DeselectAll => controller.deselect_all(),
        Op::ToggleSelectAll => controller.toggle_select_all(),
        Op::Escape => controller.escape(),
        Op::ToggleMode => controller.toggle_mode(),
        Op::Shrink(keep) => {
            let visible: Vec<EntityId> = controller.visible().iter().take(*keep).cloned().collect();
            controller.set_visible(visible);
        }
    }
}

proptest! {
    #[test]
    fn prop_selection_stays_within_visible_and_cap(
        len in 0usize..10,
        max in proptest::option::of(1usize..6),
        ops in prop::collection::vec(arb_op(), 0..40),
    ) {
        let mut controller = BatchSelectionController::new(max);
        controller.set_visible((0..len).map(id).collect());

        for op in &ops {
            apply(&mut controller, op);

            let selected = controller.selected_ids();
            prop_assert_eq!(selected.len(), controller.selected_count());
            for selected_id in &selected {
                prop_assert!(controller.visible().contains(selected_id));
            }
            if let Some(max) = max {
                prop_assert!(controller.selected_count() <= max);
            }
            if controller.mode() == SelectionMode::Idle {
                prop_assert_eq!(controller.selected_count(), 0);
            }
            if let Some(anchor) = controller.selection().anchor() {
                prop_assert!(controller.visible().contains(anchor));
            }
        }
    }

    #[test]
    fn prop_select_all_takes_display_prefix(len in 0usize..12, max in 1usize..8) {
        let mut controller = BatchSelectionController::new(Some(max));
        let visible: Vec<EntityId> = (0..len).map(id).collect();
        controller.set_visible(visible.clone());

        let added = controller.select_all();
        prop_assert_eq!(added, len.min(max));
        prop_assert_eq!(controller.selected_ids(), visible[..len.min(max)].to_vec());
    }
}
