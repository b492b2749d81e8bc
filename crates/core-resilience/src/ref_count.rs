//! Reference counting with explicit transitions
//!
//! Shared resources (an event subscription, a server connection) are set up
//! when the first consumer arrives and torn down when the last one leaves.
//! `RefCountMap` reports which transition an increment or decrement caused so
//! the caller can perform the setup or teardown exactly once.
//!
//! # Example
//!
//! ```
//! use virtmgmt_core_resilience::ref_count::{RefCountMap, Transition};
//!
//! let mut refs = RefCountMap::new();
//!
//! assert_eq!(refs.increment("deleted:vm1"), Transition::First);
//! assert_eq!(refs.increment("deleted:vm1"), Transition::Shared(2));
//!
//! assert_eq!(refs.decrement(&"deleted:vm1"), Transition::Shared(1));
//! assert_eq!(refs.decrement(&"deleted:vm1"), Transition::Last);
//! assert_eq!(refs.decrement(&"deleted:vm1"), Transition::Untracked);
//! ```

use std::collections::HashMap;
use std::hash::Hash;

/// What a count change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 0 -> 1: set the shared resource up
    First,
    /// Count changed but stays above zero
    Shared(u64),
    /// 1 -> 0: tear the shared resource down
    Last,
    /// Decrement of a key that had no references
    Untracked,
}

impl Transition {
    pub fn is_first(self) -> bool {
        self == Transition::First
    }

    pub fn is_last(self) -> bool {
        self == Transition::Last
    }
}

/// Tracks reference counts per key. Keys are removed when they reach zero.
#[derive(Debug)]
pub struct RefCountMap<K> {
    counts: HashMap<K, u64>,
}

impl<K> Default for RefCountMap<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> RefCountMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: K) -> Transition {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 {
            Transition::First
        } else {
            Transition::Shared(*count)
        }
    }

    pub fn decrement(&mut self, key: &K) -> Transition {
        match self.counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Transition::Shared(*count)
            }
            Some(_) => {
                self.counts.remove(key);
                Transition::Last
            }
            None => Transition::Untracked,
        }
    }

    pub fn count(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Number of keys with at least one reference
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Forget every key, returning them so the caller can tear down
    pub fn drain(&mut self) -> Vec<K> {
        self.counts.drain().map(|(k, _)| k).collect()
    }
}
