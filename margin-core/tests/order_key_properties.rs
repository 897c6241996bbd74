//! Property tests for order key allocation and normalization.

use margin_core::{is_strictly_increasing, Allocation, OrderKey, OrderKeyAllocator};
use proptest::prelude::*;

fn arb_sorted_keys() -> impl Strategy<Value = Vec<OrderKey>> {
    prop::collection::btree_set(-1_000_000i64..1_000_000, 0..40)
        .prop_map(|set| set.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_allocated_key_sorts_between_neighbours(
        keys in arb_sorted_keys(),
        index in 0usize..50,
        gap in 2i64..5000,
    ) {
        let allocator = OrderKeyAllocator::new(gap);
        let index = index.min(keys.len());
        match allocator.allocate(&keys, index) {
            Allocation::Key(key) => {
                let mut placed = keys.clone();
                placed.insert(index, key);
                prop_assert!(is_strictly_increasing(&placed));
            }
            Allocation::NeedsNormalize => {
                // Only a middle insert between adjacent integers can run out of room.
                prop_assert!(index > 0 && index < keys.len());
                prop_assert!(keys[index] - keys[index - 1] < 2);
            }
        }
    }

    #[test]
    fn prop_normalize_shape(len in 0usize..200, gap in 2i64..10_000) {
        let allocator = OrderKeyAllocator::new(gap);
        let normalized = allocator.normalize(0..len);
        prop_assert_eq!(normalized.len(), len);
        for (position, (item, key)) in normalized.iter().enumerate() {
            prop_assert_eq!(*item, position);
            prop_assert_eq!(*key, (position as i64 + 1) * gap);
        }
        let keys: Vec<OrderKey> = normalized.iter().map(|(_, k)| *k).collect();
        prop_assert!(is_strictly_increasing(&keys));
    }

    #[test]
    fn prop_repeated_head_inserts_stay_ordered(count in 1usize..30) {
        let allocator = OrderKeyAllocator::default();
        let mut keys: Vec<OrderKey> = vec![1000, 2000, 3000];
        for _ in 0..count {
            let key = allocator.allocate(&keys, 0).key();
            prop_assert!(key.is_some());
            if let Some(key) = key {
                keys.insert(0, key);
            }
        }
        prop_assert!(is_strictly_increasing(&keys));
    }
}
