use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

use super::PersistentStore;
use crate::{
    error::PersistenceError,
    store::ReplicatedStore,
    timestamp::Timestamp,
    value::{MapKey, MapVal, MapValue},
};

/// Process-local [`PersistentStore`]. Survives a map being destroyed and
/// rebuilt, which is enough for tests and for embedders that restart maps
/// without restarting the process.
#[derive(Debug)]
pub struct MemoryPersistentStore<K, V, T>
where
    K: MapKey,
{
    items: DashMap<K, MapValue<V, T>>,
}

impl<K, V, T> Default for MemoryPersistentStore<K, V, T>
where
    K: MapKey,
{
    fn default() -> Self {
        Self {
            items: DashMap::new(),
        }
    }
}

impl<K, V, T> MemoryPersistentStore<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<MapValue<V, T>> {
        self.items.get(key).map(|cell| cell.value().clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl<K, V, T> PersistentStore<K, V, T> for MemoryPersistentStore<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    async fn read_into(&self, store: &ReplicatedStore<K, V, T>) -> Result<usize, PersistenceError> {
        let cells: Vec<_> = self
            .items
            .iter()
            .map(|cell| (cell.key().clone(), cell.value().clone()))
            .collect();
        Ok(cells
            .into_iter()
            .map(|(key, cell)| store.merge_value(key, cell))
            .filter(|applied| *applied)
            .count())
    }

    async fn update(&self, key: K, value: MapValue<V, T>) -> Result<(), PersistenceError> {
        match self.items.entry(key) {
            Entry::Occupied(mut entry) => {
                if value.supersedes(entry.get()) {
                    entry.insert(value);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<(), PersistenceError> {
        self.items.remove(key);
        Ok(())
    }
}
