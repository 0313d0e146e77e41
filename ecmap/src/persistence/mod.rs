//! Optional durable backing for a map
//!
//! Applied mutations are handed to a single writer task per map, so client
//! calls never wait for storage. Backends apply the same last-writer-wins rule
//! as the replica, which makes out-of-order or repeated writes harmless.

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

pub use file::FilePersistentStore;
pub use memory::MemoryPersistentStore;

use crate::{
    error::PersistenceError,
    metrics,
    store::ReplicatedStore,
    timestamp::Timestamp,
    value::{MapKey, MapVal, MapValue},
};

#[async_trait]
pub trait PersistentStore<K, V, T>: Send + Sync + 'static
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    /// Load every persisted cell into `store`. Returns how many cells changed
    /// the store.
    async fn read_into(&self, store: &ReplicatedStore<K, V, T>) -> Result<usize, PersistenceError>;

    /// Record `value` unless a newer cell is already stored for `key`.
    async fn update(&self, key: K, value: MapValue<V, T>) -> Result<(), PersistenceError>;

    /// Forget `key` entirely.
    async fn remove(&self, key: &K) -> Result<(), PersistenceError>;
}

/// Queue in front of a [`PersistentStore`], drained by one background task.
pub(crate) struct WriteBehind<K, V, T> {
    sender: Mutex<Option<mpsc::UnboundedSender<(K, MapValue<V, T>)>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V, T> WriteBehind<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    pub fn spawn(map: String, store: Arc<dyn PersistentStore<K, V, T>>, runtime: &Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = runtime.spawn(write_loop(map, store, receiver));
        Self {
            sender: Mutex::new(Some(sender)),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn submit(&self, key: K, value: MapValue<V, T>) {
        if let Some(sender) = self.sender.lock().as_ref() {
            if sender.send((key, value)).is_err() {
                warn!("Write-behind task is gone, dropping update");
            }
        }
    }

    /// Stop accepting writes. Queued writes are still flushed.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Wait for the writer task to flush its queue after [`Self::close`].
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn write_loop<K, V, T>(
    map: String,
    store: Arc<dyn PersistentStore<K, V, T>>,
    mut receiver: mpsc::UnboundedReceiver<(K, MapValue<V, T>)>,
) where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    let mut written = 0u64;
    while let Some((key, value)) = receiver.recv().await {
        match store.update(key, value).await {
            Ok(()) => written += 1,
            Err(e) => {
                warn!(map = %map, error = %e, "Failed to persist update");
                metrics::record_persistence_failure(&map);
            }
        }
    }
    debug!(map = %map, written, "Write-behind queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_behind_flushes_queue_on_close() {
        let backend = Arc::new(MemoryPersistentStore::<String, String, u64>::new());
        let writer = WriteBehind::spawn(
            "m".to_string(),
            backend.clone() as Arc<dyn PersistentStore<_, _, _>>,
            &Handle::current(),
        );

        for ts in 1..=50u64 {
            writer.submit("k".to_string(), MapValue::value(format!("v{}", ts), ts));
        }
        writer.submit("gone".to_string(), MapValue::tombstone(9));
        writer.close();
        writer.join().await;

        assert_eq!(
            backend.get(&"k".to_string()),
            Some(MapValue::value("v50".to_string(), 50))
        );
        assert_eq!(
            backend.get(&"gone".to_string()),
            Some(MapValue::tombstone(9))
        );

        // Submissions after close are ignored.
        writer.submit("late".to_string(), MapValue::value("x".to_string(), 1));
        assert!(backend.get(&"late".to_string()).is_none());
    }
}
