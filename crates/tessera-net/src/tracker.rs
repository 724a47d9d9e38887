//! Shared keyed state with freeze/unfreeze snapshots.
//!
//! While at least one consumer holds the tracker frozen, writes are queued
//! as delayed changes instead of touching the values. When the freeze
//! counter drops back to zero the queue is applied in order.
//!
//! The freeze counter and the delayed queue have separate locks: the
//! counter lock is held only for the check and the enqueue, the flush takes
//! only the narrower queue lock while swapping the list out.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, RwLock};

use crate::sync::{lock, read, write};

enum Change<K, V> {
    Set(K, V),
    Remove(K),
}

/// Keyed state consulted by several peer-handling paths.
pub struct StateTracker<K, V> {
    values: RwLock<HashMap<K, V>>,
    freezes: Mutex<usize>,
    delayed: Mutex<Vec<Change<K, V>>>,
}

impl<K, V> StateTracker<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty, unfrozen tracker.
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            freezes: Mutex::new(0),
            delayed: Mutex::new(Vec::new()),
        }
    }

    /// Increment the freeze counter.
    pub fn freeze(&self) {
        *lock(&self.freezes) += 1;
    }

    /// Decrement the freeze counter, flushing delayed changes when it
    /// reaches zero.
    pub fn unfreeze(&self) {
        let thawed = {
            let mut freezes = lock(&self.freezes);
            if *freezes == 0 {
                tracing::warn!("unfreeze without matching freeze");
                return;
            }
            *freezes -= 1;
            *freezes == 0
        };
        if thawed {
            self.flush();
        }
    }

    /// Freeze until the returned guard is dropped.
    pub fn frozen(&self) -> FreezeGuard<'_, K, V> {
        self.freeze();
        FreezeGuard { tracker: self }
    }

    /// Whether any consumer holds the tracker frozen.
    pub fn is_frozen(&self) -> bool {
        *lock(&self.freezes) > 0
    }

    fn apply(&self, change: Change<K, V>) {
        let mut values = write(&self.values);
        match change {
            Change::Set(key, value) => {
                values.insert(key, value);
            }
            Change::Remove(key) => {
                values.remove(&key);
            }
        }
    }

    fn submit(&self, change: Change<K, V>) {
        let freezes = lock(&self.freezes);
        if *freezes > 0 {
            lock(&self.delayed).push(change);
            return;
        }
        drop(freezes);
        self.apply(change);
    }

    /// Set `key`, or queue the write while frozen.
    pub fn set(&self, key: K, value: V) {
        self.submit(Change::Set(key, value));
    }

    /// Remove `key`, or queue the removal while frozen.
    pub fn remove(&self, key: K) {
        self.submit(Change::Remove(key));
    }

    /// Apply every delayed change in submission order.
    pub fn flush(&self) -> usize {
        let changes = std::mem::take(&mut *lock(&self.delayed));
        let count = changes.len();
        for change in changes {
            self.apply(change);
        }
        if count > 0 {
            tracing::trace!(count, "delayed state changes applied");
        }
        count
    }

    /// Discard every delayed change.
    pub fn clear_delayed(&self) {
        lock(&self.delayed).clear();
    }

    /// Number of queued changes.
    pub fn delayed_len(&self) -> usize {
        lock(&self.delayed).len()
    }

    /// Current value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        read(&self.values).get(key).cloned()
    }

    /// Copy of every value.
    pub fn snapshot(&self) -> HashMap<K, V> {
        read(&self.values).clone()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        read(&self.values).len()
    }

    /// Whether no keys are set.
    pub fn is_empty(&self) -> bool {
        read(&self.values).is_empty()
    }
}

impl<K, V> Default for StateTracker<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a [`StateTracker`] frozen.
pub struct FreezeGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    tracker: &'a StateTracker<K, V>,
}

impl<K, V> FreezeGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Copy of the values as they stood when frozen.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.tracker.snapshot()
    }
}

impl<K, V> Drop for FreezeGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.tracker.unfreeze();
    }
}
