//! Replay stores.
//!
//! A receiver must never accept an input twice and a relay listener must
//! never handle an event twice. Both use [`SeenSet`], which makes the
//! membership check and the insert a single step under one write lock.
//!
//! The sets live in memory for the lifetime of the process. A restart
//! forgets everything that was seen before it.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::RwLock;

use bitcoin::OutPoint;

/// A thread-safe set with insert-if-absent semantics.
#[derive(Debug)]
pub struct SeenSet<T> {
    items: RwLock<HashSet<T>>,
}

impl<T> Default for SeenSet<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashSet::new()),
        }
    }
}

impl<T: Eq + Hash + Clone> SeenSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `item`. Returns `true` if it was not seen before.
    pub fn insert_if_absent(&self, item: T) -> bool {
        self.items.write().expect("lock poisoned").insert(item)
    }

    /// Record every item only if none was seen before.
    ///
    /// Returns `false` and records nothing when any item is already present.
    pub fn check_and_mark(&self, items: &[T]) -> bool {
        let mut seen = self.items.write().expect("lock poisoned");
        let mut batch = HashSet::with_capacity(items.len());
        if items.iter().any(|item| seen.contains(item) || !batch.insert(item)) {
            return false;
        }
        seen.extend(items.iter().cloned());
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.read().expect("lock poisoned").contains(item)
    }

    /// Keep only the items for which `keep` returns `true`.
    pub fn retain(&self, keep: impl FnMut(&T) -> bool) {
        self.items.write().expect("lock poisoned").retain(keep);
    }

    pub fn len(&self) -> usize {
        self.items.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outpoints already consumed by an accepted original PSBT.
pub type SeenInputs = SeenSet<OutPoint>;
