//! Order keys for manually ordered lists.
//!
//! Reordering an item assigns it a single new key that sorts between its new
//! neighbours, so a drag never rewrites the keys of the rest of the list.
//! When two neighbours end up adjacent integers there is no room left between
//! them and the whole visible ordering is renormalized to `(index + 1) * gap`.

use crate::EntityId;
use std::cmp::Ordering;

/// Position value of an item in a manually ordered list.
pub type OrderKey = i64;

/// Spacing between consecutive keys after normalization.
pub const DEFAULT_ORDER_GAP: OrderKey = 1000;

/// Result of asking for a key at a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A key that sorts strictly between the requested neighbours.
    Key(OrderKey),
    /// The neighbours are too close together; renormalize first.
    NeedsNormalize,
}

impl Allocation {
    pub fn key(self) -> Option<OrderKey> {
        match self {
            Allocation::Key(key) => Some(key),
            Allocation::NeedsNormalize => None,
        }
    }
}

/// Computes order keys for inserts and renormalizes exhausted orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKeyAllocator {
    gap: OrderKey,
}

impl Default for OrderKeyAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER_GAP)
    }
}

impl OrderKeyAllocator {
    /// Create an allocator. Gaps below 2 leave no room for a head insert and
    /// are raised to 2.
    pub fn new(gap: OrderKey) -> Self {
        Self { gap: gap.max(2) }
    }

    pub fn gap(&self) -> OrderKey {
        self.gap
    }

    /// Key for an item inserted at `target_index` of `siblings`.
    ///
    /// `siblings` are the keys of the other items in display order (the item
    /// being moved excluded). `target_index` is clamped to `siblings.len()`.
    ///
    /// - empty list: `gap`
    /// - head: half a gap below the first key
    /// - tail: one gap above the last key
    /// - middle: floor of the midpoint of the two neighbours
    pub fn allocate(&self, siblings: &[OrderKey], target_index: usize) -> Allocation {
        let Some((&first, &last)) = siblings.first().zip(siblings.last()) else {
            return Allocation::Key(self.gap);
        };
        let index = target_index.min(siblings.len());

        if index == 0 {
            return first
                .checked_sub(self.gap / 2)
                .map_or(Allocation::NeedsNormalize, Allocation::Key);
        }
        if index == siblings.len() {
            return last
                .checked_add(self.gap)
                .map_or(Allocation::NeedsNormalize, Allocation::Key);
        }

        let before = siblings[index - 1];
        let after = siblings[index];
        match midpoint(before, after) {
            Some(key) => Allocation::Key(key),
            None => Allocation::NeedsNormalize,
        }
    }

    /// Reassign every key to `(index + 1) * gap`, keeping the given order.
    ///
    /// Always applied to the whole visible ordering at once so that a partial
    /// pass can never leave two items sharing a key.
    pub fn normalize<I, T>(&self, items: I) -> Vec<(T, OrderKey)>
    where
        I: IntoIterator<Item = T>,
    {
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let key = (index as OrderKey + 1).saturating_mul(self.gap);
                (item, key)
            })
            .collect()
    }

    /// Insert `moving` at `target_index` of `ordered` and normalize the result.
    pub fn place_and_normalize<T: Clone>(
        &self,
        ordered: &[T],
        moving: T,
        target_index: usize,
    ) -> Vec<(T, OrderKey)> {
        let mut placed: Vec<T> = ordered.to_vec();
        let index = target_index.min(placed.len());
        placed.insert(index, moving);
        self.normalize(placed)
    }
}

/// Floor midpoint strictly between `before` and `after`, if one exists.
fn midpoint(before: OrderKey, after: OrderKey) -> Option<OrderKey> {
    let (lo, hi) = (before as i128, after as i128);
    if hi - lo < 2 {
        return None;
    }
    Some((lo + hi).div_euclid(2) as OrderKey)
}

/// True when `keys` are strictly increasing.
pub fn is_strictly_increasing(keys: &[OrderKey]) -> bool {
    keys.windows(2).all(|pair| pair[0] < pair[1])
}

/// Display order of two items: by key, unkeyed items last, ties by id.
pub fn compare_display_order(
    a_key: Option<OrderKey>,
    a_id: &EntityId,
    b_key: Option<OrderKey>,
    b_id: &EntityId,
) -> Ordering {
    match (a_key, b_key) {
        (Some(a), Some(b)) => a.cmp(&b).then_with(|| a_id.cmp(b_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a_id.cmp(b_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_gets_one_gap() {
        let allocator = OrderKeyAllocator::default();
        assert_eq!(allocator.allocate(&[], 0), Allocation::Key(1000));
        assert_eq!(allocator.allocate(&[], 7), Allocation::Key(1000));
    }

    #[test]
    fn test_head_insert_lands_half_a_gap_below() {
        // Dragging the third of [1000, 2000, 3000] to the top.
        let allocator = OrderKeyAllocator::default();
        assert_eq!(allocator.allocate(&[1000, 2000], 0), Allocation::Key(500));
    }

    #[test]
    fn test_tail_insert_adds_gap() {
        let allocator = OrderKeyAllocator::default();
        assert_eq!(allocator.allocate(&[1000, 2000], 2), Allocation::Key(3000));
        assert_eq!(allocator.allocate(&[1000, 2000], 99), Allocation::Key(3000));
    }

    #[test]
    fn test_middle_insert_uses_floor_midpoint() {
        let allocator = OrderKeyAllocator::default();
        assert_eq!(allocator.allocate(&[1000, 2000], 1), Allocation::Key(1500));
        assert_eq!(allocator.allocate(&[1000, 1003], 1), Allocation::Key(1001));
        assert_eq!(allocator.allocate(&[-3, 0], 1), Allocation::Key(-2));
    }

    #[test]
    fn test_adjacent_neighbours_need_normalize() {
        let allocator = OrderKeyAllocator::default();
        assert_eq!(
            allocator.allocate(&[1000, 1001], 1),
            Allocation::NeedsNormalize
        );
        assert_eq!(
            allocator.allocate(&[1000, 1000], 1),
            Allocation::NeedsNormalize
        );
    }

    #[test]
    fn test_overflow_needs_normalize() {
        let allocator = OrderKeyAllocator::default();
        assert_eq!(
            allocator.allocate(&[OrderKey::MIN + 10], 0),
            Allocation::NeedsNormalize
        );
        assert_eq!(
            allocator.allocate(&[OrderKey::MAX - 10], 1),
            Allocation::NeedsNormalize
        );
    }

    #[test]
    fn test_normalize_assigns_multiples_of_gap() {
        let allocator = OrderKeyAllocator::new(10);
        let normalized = allocator.normalize(["a", "b", "c"]);
        assert_eq!(normalized, vec![("a", 10), ("b", 20), ("c", 30)]);
    }

    #[test]
    fn test_place_and_normalize() {
        let allocator = OrderKeyAllocator::default();
        let placed = allocator.place_and_normalize(&["a", "b", "c"], "z", 1);
        assert_eq!(
            placed,
            vec![("a", 1000), ("z", 2000), ("b", 3000), ("c", 4000)]
        );
    }

    #[test]
    fn test_tiny_gap_is_raised() {
        assert_eq!(OrderKeyAllocator::new(1).gap(), 2);
        assert_eq!(OrderKeyAllocator::new(-5).gap(), 2);
    }

    #[test]
    fn test_display_order_ties_and_unkeyed() {
        let a = EntityId::new("a");
        let b = EntityId::new("b");
        assert_eq!(
            compare_display_order(Some(5), &b, Some(5), &a),
            Ordering::Greater
        );
        assert_eq!(compare_display_order(None, &a, Some(1), &b), Ordering::Greater);
        assert_eq!(compare_display_order(Some(1), &b, None, &a), Ordering::Less);
    }
}
