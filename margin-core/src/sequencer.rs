//! Last-response-wins sequencing for read paths.
//!
//! Every request takes a ticket before it is issued. When it completes, its
//! result is accepted only if no request issued *later* has already completed.
//! Ordering is by completion, so an older request that finishes after a newer
//! one is dropped, while an older request that finishes first is still shown
//! until the newer one lands.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Ticket returned by [`RequestSequencer::issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
pub struct RequestSequencer {
    next: AtomicU64,
    latest_completed: AtomicU64,
}

impl RequestSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> Ticket {
        Ticket(self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Record completion of `ticket`. Returns false when the result is outdated.
    pub fn complete(&self, ticket: Ticket) -> bool {
        let previous = self.latest_completed.fetch_max(ticket.0, Ordering::SeqCst);
        ticket.0 > previous
    }
}

/// One [`RequestSequencer`] per key, for caches keyed by query.
#[derive(Debug)]
pub struct KeyedSequencer<K> {
    tickets: Mutex<HashMap<K, (u64, u64)>>,
}

impl<K> Default for KeyedSequencer<K> {
    fn default() -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedSequencer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, key: &K) -> Ticket {
        let mut tickets = self.tickets.lock().unwrap_or_else(|e| e.into_inner());
        let entry = tickets.entry(key.clone()).or_insert((0, 0));
        entry.0 += 1;
        Ticket(entry.0)
    }

    /// True once a request for `key` issued after `ticket` has completed.
    /// Does not record anything.
    pub fn is_superseded(&self, key: &K, ticket: Ticket) -> bool {
        let tickets = self.tickets.lock().unwrap_or_else(|e| e.into_inner());
        tickets
            .get(key)
            .is_some_and(|&(_, completed)| completed > ticket.0)
    }

    pub fn complete(&self, key: &K, ticket: Ticket) -> bool {
        let mut tickets = self.tickets.lock().unwrap_or_else(|e| e.into_inner());
        let entry = tickets.entry(key.clone()).or_insert((0, 0));
        if ticket.0 > entry.1 {
            entry.1 = ticket.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superseded_check_does_not_complete() {
        let seq = KeyedSequencer::new();
        let key = "tasks".to_string();
        let first = seq.issue(&key);
        let second = seq.issue(&key);
        assert!(!seq.is_superseded(&key, first));
        assert!(seq.complete(&key, second));
        assert!(seq.is_superseded(&key, first));
        assert!(!seq.is_superseded(&key, second));
    }

    #[test]
    fn test_late_older_response_is_dropped() {
        let seq = RequestSequencer::new();
        let first = seq.issue();
        let second = seq.issue();
        assert!(seq.complete(second));
        assert!(!seq.complete(first));
    }

    #[test]
    fn test_in_order_completion_accepts_both() {
        let seq = RequestSequencer::new();
        let first = seq.issue();
        let second = seq.issue();
        assert!(seq.complete(first));
        assert!(seq.complete(second));
    }

    #[test]
    fn test_keys_are_independent() {
        let seq = KeyedSequencer::new();
        let a1 = seq.issue(&"a");
        let b1 = seq.issue(&"b");
        let a2 = seq.issue(&"a");
        assert!(seq.complete(&"a", a2));
        assert!(seq.complete(&"b", b1));
        assert!(!seq.complete(&"a", a1));
    }
}
