use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::trace;

use crate::{
    timestamp::Timestamp,
    value::{MapKey, MapVal, MapValue},
};

// ============================================================================
// Replicated State Store - LWW Cells Over a Sharded Map
// ============================================================================

/// Result of [`ReplicatedStore::apply_remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome<V> {
    /// A newer entry or tombstone already exists, or the expected value did
    /// not match.
    Rejected,
    /// The tombstone was recorded. `previous` is the live value it replaced.
    Tombstoned { previous: Option<V> },
}

impl<V> RemoveOutcome<V> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Tombstoned { .. })
    }

    pub fn into_previous(self) -> Option<V> {
        match self {
            Self::Tombstoned { previous } => previous,
            Self::Rejected => None,
        }
    }
}

/// Result of [`ReplicatedStore::compute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeOutcome<V, T> {
    /// The computed cell did not supersede the stored one. `current` is the
    /// live value the key still holds.
    Unchanged { current: Option<V> },
    /// `cell` replaced the stored cell. `previous` is the live value it
    /// replaced.
    Applied {
        cell: MapValue<V, T>,
        previous: Option<V>,
    },
}

impl<V, T> ComputeOutcome<V, T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Local replica of the map.
///
/// Every mutation runs under the `DashMap` entry guard of its key, so the
/// compare-and-replace of one key is atomic while unrelated keys on other
/// shards proceed in parallel. A key holds either a live value or a
/// tombstone, never both.
#[derive(Debug)]
pub struct ReplicatedStore<K, V, T>
where
    K: MapKey,
{
    items: DashMap<K, MapValue<V, T>>,
    live: AtomicUsize,
}

impl<K, V, T> Default for ReplicatedStore<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, T> ReplicatedStore<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            live: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.items
            .get(key)
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Raw cell for `key`, tombstones included.
    pub fn cell(&self, key: &K) -> Option<MapValue<V, T>> {
        self.items.get(key).map(|cell| cell.value().clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.items
            .get(key)
            .map(|cell| cell.value().is_alive())
            .unwrap_or(false)
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.items
            .iter()
            .any(|cell| cell.value().get() == Some(value))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.items
            .iter()
            .filter(|cell| cell.value().is_tombstone())
            .count()
    }

    pub fn keys(&self) -> Vec<K> {
        self.items
            .iter()
            .filter(|cell| cell.value().is_alive())
            .map(|cell| cell.key().clone())
            .collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.items
            .iter()
            .filter_map(|cell| cell.value().get().cloned())
            .collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.items
            .iter()
            .filter_map(|cell| {
                cell.value()
                    .get()
                    .map(|value| (cell.key().clone(), value.clone()))
            })
            .collect()
    }

    /// Copy of every cell. Shard locks are released before this returns.
    pub fn snapshot(&self) -> Vec<(K, MapValue<V, T>)> {
        self.items
            .iter()
            .map(|cell| (cell.key().clone(), cell.value().clone()))
            .collect()
    }

    /// Timestamps of live entries and of tombstones, as advertised to peers.
    pub fn digest(&self) -> (HashMap<K, T>, HashMap<K, T>) {
        let mut timestamps = HashMap::new();
        let mut tombstones = HashMap::new();
        for cell in self.items.iter() {
            match cell.value() {
                MapValue::Value { timestamp, .. } => {
                    timestamps.insert(cell.key().clone(), timestamp.clone());
                }
                MapValue::Tombstone { timestamp } => {
                    tombstones.insert(cell.key().clone(), timestamp.clone());
                }
            }
        }
        (timestamps, tombstones)
    }

    /// Store `value` unless the key already holds an entry or tombstone whose
    /// timestamp is not older than `timestamp`. Replaying the same or an older
    /// put is a no-op.
    pub fn apply_put(&self, key: K, value: V, timestamp: T) -> bool {
        match self.items.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().timestamp() >= &timestamp {
                    trace!(key = ?entry.key(), "Rejected stale put");
                    return false;
                }
                let was_alive = entry.get().is_alive();
                entry.insert(MapValue::value(value, timestamp));
                if !was_alive {
                    self.live.fetch_add(1, Ordering::AcqRel);
                }
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(MapValue::value(value, timestamp));
                self.live.fetch_add(1, Ordering::AcqRel);
                true
            }
        }
    }

    /// Replace the key's cell with a tombstone at `timestamp`.
    ///
    /// Rejected when a live entry is newer than `timestamp`, when an existing
    /// tombstone is not older than `timestamp`, or when `expected` is given and
    /// differs from the live value.
    pub fn apply_remove(&self, key: &K, timestamp: T, expected: Option<&V>) -> RemoveOutcome<V> {
        match self.items.entry(key.clone()) {
            Entry::Occupied(mut entry) => match entry.get() {
                MapValue::Value {
                    value,
                    timestamp: current,
                } => {
                    if current > &timestamp {
                        trace!(?key, "Rejected stale remove");
                        return RemoveOutcome::Rejected;
                    }
                    if expected.is_some_and(|expected| expected != value) {
                        return RemoveOutcome::Rejected;
                    }
                    let previous = entry.insert(MapValue::tombstone(timestamp));
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    RemoveOutcome::Tombstoned {
                        previous: previous.into_value(),
                    }
                }
                MapValue::Tombstone { timestamp: current } => {
                    if &timestamp > current {
                        entry.insert(MapValue::tombstone(timestamp));
                        RemoveOutcome::Tombstoned { previous: None }
                    } else {
                        RemoveOutcome::Rejected
                    }
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(MapValue::tombstone(timestamp));
                RemoveOutcome::Tombstoned { previous: None }
            }
        }
    }

    /// Build a new cell from the current live value and store it if it
    /// supersedes the stored cell. `f` runs under the key's entry guard.
    pub fn compute<F>(&self, key: K, f: F) -> ComputeOutcome<V, T>
    where
        F: FnOnce(&K, Option<&V>) -> MapValue<V, T>,
    {
        match self.items.entry(key) {
            Entry::Occupied(mut entry) => {
                let cell = f(entry.key(), entry.get().get());
                if !cell.supersedes(entry.get()) {
                    trace!(key = ?entry.key(), "Computed value lost to stored cell");
                    return ComputeOutcome::Unchanged {
                        current: entry.get().get().cloned(),
                    };
                }
                let was_alive = entry.get().is_alive();
                let previous = entry.insert(cell.clone()).into_value();
                match (was_alive, cell.is_alive()) {
                    (false, true) => {
                        self.live.fetch_add(1, Ordering::AcqRel);
                    }
                    (true, false) => {
                        self.live.fetch_sub(1, Ordering::AcqRel);
                    }
                    _ => {}
                }
                ComputeOutcome::Applied { cell, previous }
            }
            Entry::Vacant(entry) => {
                let cell = f(entry.key(), None);
                if cell.is_alive() {
                    self.live.fetch_add(1, Ordering::AcqRel);
                }
                entry.insert(cell.clone());
                ComputeOutcome::Applied {
                    cell,
                    previous: None,
                }
            }
        }
    }

    /// Apply an arbitrary cell with the same ordering rules as the put and
    /// remove paths. Used when recovering from persistent storage.
    pub fn merge_value(&self, key: K, cell: MapValue<V, T>) -> bool {
        match cell {
            MapValue::Value { value, timestamp } => self.apply_put(key, value, timestamp),
            MapValue::Tombstone { timestamp } => {
                self.apply_remove(&key, timestamp, None).is_applied()
            }
        }
    }
}
