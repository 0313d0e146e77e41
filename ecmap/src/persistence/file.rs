//! Append-only JSON-lines persistence
//!
//! Every update is appended as one line. Recovery replays the log and keeps
//! the newest cell per key, so the log never has to be rewritten in place.
//! [`FilePersistentStore::compact`] rewrites it with one line per key.

use std::{
    collections::{hash_map::Entry, HashMap},
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info, warn};

use super::PersistentStore;
use crate::{
    error::PersistenceError,
    store::ReplicatedStore,
    timestamp::Timestamp,
    value::{MapKey, MapVal, MapValue},
};

/// One log line. `value: None` forgets the key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize, T: Serialize",
    deserialize = "K: DeserializeOwned, V: DeserializeOwned, T: DeserializeOwned"
))]
struct LogRecord<K, V, T> {
    key: K,
    value: Option<MapValue<V, T>>,
}

pub struct FilePersistentStore<K, V, T> {
    path: PathBuf,
    log: Mutex<File>,
    _marker: PhantomData<fn() -> (K, V, T)>,
}

async fn open_append(path: &Path) -> Result<File, PersistenceError> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

impl<K, V, T> FilePersistentStore<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    /// Open or create the log at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let log = open_append(&path).await?;
        debug!(path = %path.display(), "Opened persistence log");
        Ok(Self {
            path,
            log: Mutex::new(log),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log into the newest cell per key.
    async fn load(&self) -> Result<HashMap<K, MapValue<V, T>>, PersistenceError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut cells = HashMap::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord<K, V, T> = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %e,
                        "Skipping unreadable persistence record"
                    );
                    continue;
                }
            };
            match record.value {
                Some(cell) => match cells.entry(record.key) {
                    Entry::Occupied(mut entry) => {
                        if cell.supersedes(entry.get()) {
                            entry.insert(cell);
                        }
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(cell);
                    }
                },
                None => {
                    cells.remove(&record.key);
                }
            }
        }
        Ok(cells)
    }

    async fn append(&self, record: &LogRecord<K, V, T>) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut log = self.log.lock().await;
        log.write_all(&line).await?;
        log.flush().await?;
        Ok(())
    }

    /// Rewrite the log with one record per key. Returns the number of records
    /// kept.
    pub async fn compact(&self) -> Result<usize, PersistenceError> {
        // Appends wait until the new log is in place.
        let mut log = self.log.lock().await;
        log.flush().await?;
        let cells = self.load().await?;

        let mut contents = Vec::new();
        let kept = cells.len();
        for (key, value) in cells {
            serde_json::to_writer(
                &mut contents,
                &LogRecord {
                    key,
                    value: Some(value),
                },
            )?;
            contents.push(b'\n');
        }

        let staging = self.path.with_extension("compact");
        fs::write(&staging, &contents).await?;
        fs::rename(&staging, &self.path).await?;
        *log = open_append(&self.path).await?;

        info!(path = %self.path.display(), kept, "Compacted persistence log");
        Ok(kept)
    }
}

#[async_trait]
impl<K, V, T> PersistentStore<K, V, T> for FilePersistentStore<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    async fn read_into(&self, store: &ReplicatedStore<K, V, T>) -> Result<usize, PersistenceError> {
        let cells = self.load().await?;
        let total = cells.len();
        let applied = cells
            .into_iter()
            .map(|(key, cell)| store.merge_value(key, cell))
            .filter(|applied| *applied)
            .count();
        info!(path = %self.path.display(), total, applied, "Recovered map from persistence log");
        Ok(applied)
    }

    async fn update(&self, key: K, value: MapValue<V, T>) -> Result<(), PersistenceError> {
        self.append(&LogRecord {
            key,
            value: Some(value),
        })
        .await
    }

    async fn remove(&self, key: &K) -> Result<(), PersistenceError> {
        self.append(&LogRecord {
            key: key.clone(),
            value: None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    type Backend = FilePersistentStore<String, String, u64>;

    async fn recovered(backend: &Backend) -> ReplicatedStore<String, String, u64> {
        let store = ReplicatedStore::new();
        backend.read_into(&store).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_newest_record_wins_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path().join("map.log")).await.unwrap();

        backend
            .update("a".into(), MapValue::value("v2".into(), 2))
            .await
            .unwrap();
        backend
            .update("a".into(), MapValue::value("v1".into(), 1))
            .await
            .unwrap();
        backend
            .update("b".into(), MapValue::value("x".into(), 1))
            .await
            .unwrap();
        backend
            .update("b".into(), MapValue::tombstone(3))
            .await
            .unwrap();

        let store = recovered(&backend).await;
        assert_eq!(store.get(&"a".to_string()), Some("v2".to_string()));
        assert!(!store.contains_key(&"b".to_string()));
        assert_eq!(store.tombstone_count(), 1);
    }

    #[tokio::test]
    async fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("map.log");
        {
            let backend = Backend::open(&path).await.unwrap();
            backend
                .update("a".into(), MapValue::value("v".into(), 1))
                .await
                .unwrap();
        }

        let reopened = Backend::open(&path).await.unwrap();
        let store = recovered(&reopened).await;
        assert_eq!(store.get(&"a".to_string()), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_remove_forgets_key() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(dir.path().join("map.log")).await.unwrap();
        backend
            .update("a".into(), MapValue::value("v".into(), 1))
            .await
            .unwrap();
        backend.remove(&"a".to_string()).await.unwrap();

        let store = recovered(&backend).await;
        assert!(store.cell(&"a".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_unreadable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.log");
        let backend = Backend::open(&path).await.unwrap();
        backend
            .update("a".into(), MapValue::value("v".into(), 1))
            .await
            .unwrap();

        {
            let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            raw.write_all(b"{\"key\":\"b\",\"val\n").unwrap();
        }
        backend
            .update("c".into(), MapValue::value("w".into(), 2))
            .await
            .unwrap();

        let store = recovered(&backend).await;
        assert_eq!(store.len(), 2);
        assert!(store.contains_key(&"a".to_string()));
        assert!(store.contains_key(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_compact_keeps_one_record_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.log");
        let backend = Backend::open(&path).await.unwrap();
        for ts in 1..=10u64 {
            backend
                .update("a".into(), MapValue::value(format!("v{}", ts), ts))
                .await
                .unwrap();
        }
        backend
            .update("b".into(), MapValue::tombstone(4))
            .await
            .unwrap();

        assert_eq!(backend.compact().await.unwrap(), 2);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        // Appends after compaction land in the new log.
        backend
            .update("c".into(), MapValue::value("z".into(), 1))
            .await
            .unwrap();
        let store = recovered(&backend).await;
        assert_eq!(store.get(&"a".to_string()), Some("v10".to_string()));
        assert_eq!(store.get(&"c".to_string()), Some("z".to_string()));
        assert_eq!(store.tombstone_count(), 1);
    }
}
