use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::{
    config::EcMapConfig,
    error::{EcMapError, EcMapResult},
    event::{ListenerId, ListenerRegistry, MapEvent, MapEventListener},
    gossip::{self, RoundOutcome},
    load::LoadMonitor,
    message::{Message, PutEntry, RemoveEntry, Topics, TopicKind},
    metrics::{self, Origin},
    persistence::{PersistentStore, WriteBehind},
    store::{ComputeOutcome, RemoveOutcome, ReplicatedStore},
    timestamp::{Timestamp, TimestampProvider},
    transport::{ClusterTransport, InboundMessage, NodeId},
    value::{MapKey, MapVal, MapValue},
};

// ============================================================================
// Map Internals - Shared by Handles, Workers and the Gossip Task
// ============================================================================

pub(crate) struct Inner<K, V, T>
where
    K: MapKey,
{
    pub(crate) name: String,
    pub(crate) local: NodeId,
    pub(crate) config: EcMapConfig,
    pub(crate) topics: Topics,
    pub(crate) store: ReplicatedStore<K, V, T>,
    pub(crate) listeners: ListenerRegistry<K, V>,
    pub(crate) load: LoadMonitor,
    pub(crate) transport: Arc<dyn ClusterTransport>,
    pub(crate) clock: Arc<dyn TimestampProvider<K, V, T>>,
    persistence: Option<WriteBehind<K, V, T>>,
    runtime: Handle,
    destroyed: AtomicBool,
    shutdown: watch::Sender<bool>,
    gossip_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V, T> Inner<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn check_alive(&self) -> EcMapResult<()> {
        if self.is_destroyed() {
            return Err(EcMapError::Destroyed(self.name.clone()));
        }
        Ok(())
    }

    /// Shared put path for local and remote mutations. Returns whether the
    /// put changed the replica.
    pub(crate) fn apply_put(&self, key: K, value: V, timestamp: T, origin: Origin) -> bool {
        self.load.record();
        let applied = self
            .store
            .apply_put(key.clone(), value.clone(), timestamp.clone());
        metrics::record_update(&self.name, origin, applied);
        if applied {
            if let Some(persistence) = &self.persistence {
                persistence.submit(key.clone(), MapValue::value(value.clone(), timestamp));
            }
            self.listeners.notify(&MapEvent::put(&self.name, key, value));
        }
        applied
    }

    /// Shared remove path. A REMOVE event is emitted only when a live value
    /// was replaced.
    pub(crate) fn apply_remove(
        &self,
        key: &K,
        timestamp: T,
        expected: Option<&V>,
        origin: Origin,
    ) -> RemoveOutcome<V> {
        self.load.record();
        let outcome = self.store.apply_remove(key, timestamp.clone(), expected);
        metrics::record_update(&self.name, origin, outcome.is_applied());
        if let RemoveOutcome::Tombstoned { previous } = &outcome {
            if let Some(persistence) = &self.persistence {
                persistence.submit(key.clone(), MapValue::tombstone(timestamp));
            }
            if let Some(previous) = previous {
                self.listeners
                    .notify(&MapEvent::remove(&self.name, key.clone(), previous.clone()));
            }
        }
        outcome
    }

    /// Local read-modify-write path behind [`EcMap::compute`].
    fn apply_compute<F>(&self, key: K, f: F) -> ComputeOutcome<V, T>
    where
        F: FnOnce(&K, Option<&V>) -> MapValue<V, T>,
    {
        self.load.record();
        let outcome = self.store.compute(key.clone(), f);
        metrics::record_update(&self.name, Origin::Local, outcome.is_applied());
        if let ComputeOutcome::Applied { cell, previous } = &outcome {
            if let Some(persistence) = &self.persistence {
                persistence.submit(key.clone(), cell.clone());
            }
            match (cell.get(), previous) {
                (Some(value), _) => self
                    .listeners
                    .notify(&MapEvent::put(&self.name, key, value.clone())),
                (None, Some(previous)) => self
                    .listeners
                    .notify(&MapEvent::remove(&self.name, key, previous.clone())),
                (None, None) => {}
            }
        }
        outcome
    }

    fn encode(&self, message: &Message<K, V, T>) -> Option<(String, bytes::Bytes)> {
        let topic = self.topics.name(message.kind()).to_string();
        match message.encode() {
            Ok(payload) => Some((topic, payload)),
            Err(e) => {
                warn!(map = %self.name, topic, error = %e, "Failed to encode message");
                None
            }
        }
    }

    /// Fire-and-forget broadcast to every other member.
    pub(crate) fn broadcast(&self, message: Message<K, V, T>) {
        let Some((topic, payload)) = self.encode(&message) else {
            return;
        };
        let transport = self.transport.clone();
        let map = self.name.clone();
        self.runtime.spawn(async move {
            if let Err(e) = transport.broadcast(&topic, payload).await {
                debug!(map = %map, topic, error = %e, "Broadcast did not reach every peer");
                metrics::record_send_failure(&map, &topic);
            }
        });
    }

    /// Fire-and-forget unicast to one peer.
    pub(crate) fn send_to(&self, peer: &NodeId, message: Message<K, V, T>) {
        let Some((topic, payload)) = self.encode(&message) else {
            return;
        };
        let transport = self.transport.clone();
        let map = self.name.clone();
        let peer = peer.clone();
        self.runtime.spawn(async move {
            if let Err(e) = transport.unicast(&topic, &peer, payload).await {
                warn!(map = %map, %peer, topic, error = %e, "Failed to send to peer");
                metrics::record_send_failure(&map, &topic);
            }
        });
    }

    /// Dispatch one message received from a peer.
    pub(crate) fn handle_inbound(&self, inbound: InboundMessage) {
        if self.is_destroyed() {
            return;
        }
        let message = match Message::<K, V, T>::decode(&inbound.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    map = %self.name,
                    sender = %inbound.sender,
                    topic = %inbound.topic,
                    error = %e,
                    "Dropping undecodable message"
                );
                metrics::record_decode_failure(&self.name);
                return;
            }
        };
        if self.topics.kind_of(&inbound.topic) != Some(message.kind()) {
            debug!(map = %self.name, topic = %inbound.topic, "Message arrived on unexpected topic");
        }

        match message {
            Message::Put(entries) => {
                trace!(map = %self.name, sender = %inbound.sender, count = entries.len(), "Applying remote puts");
                for entry in entries {
                    self.clock.observe(&entry.timestamp);
                    self.apply_put(entry.key, entry.value, entry.timestamp, Origin::Remote);
                }
            }
            Message::Remove(entries) => {
                trace!(map = %self.name, sender = %inbound.sender, count = entries.len(), "Applying remote removes");
                for entry in entries {
                    self.clock.observe(&entry.timestamp);
                    self.apply_remove(&entry.key, entry.timestamp, None, Origin::Remote);
                }
            }
            Message::Advertisement(advertisement) => self.handle_advertisement(advertisement),
        }
    }

    fn shut_down(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.gossip_task.lock().take() {
            task.abort();
        }
        self.listeners.clear();
        for kind in TopicKind::ALL {
            self.transport.unsubscribe(self.topics.name(kind));
        }
        if let Some(persistence) = &self.persistence {
            persistence.close();
        }
    }
}

impl<K, V, T> Drop for Inner<K, V, T>
where
    K: MapKey,
{
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(true);
            if let Some(task) = self.gossip_task.lock().take() {
                task.abort();
            }
            for kind in TopicKind::ALL {
                self.transport.unsubscribe(self.topics.name(kind));
            }
        }
    }
}

async fn worker_loop<K, V, T>(
    inner: Weak<Inner<K, V, T>>,
    inbound: async_channel::Receiver<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Ok(message) = message else {
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_inbound(message);
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
}

// ============================================================================
// EcMap - Public Handle
// ============================================================================

/// Eventually consistent map replicated across the members of a cluster.
///
/// Handles are cheap to clone and share one replica. Mutations apply locally
/// and are broadcast to peers in the background; periodic anti-entropy
/// repairs whatever the broadcasts missed. Concurrent writes to the same key
/// resolve by timestamp, newest wins.
pub struct EcMap<K, V, T>
where
    K: MapKey,
{
    inner: Arc<Inner<K, V, T>>,
}

impl<K, V, T> Clone for EcMap<K, V, T>
where
    K: MapKey,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, T> fmt::Debug for EcMap<K, V, T>
where
    K: MapKey,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcMap")
            .field("name", &self.inner.name)
            .field("local", &self.inner.local)
            .field("destroyed", &self.inner.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V, T> EcMap<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local_node(&self) -> &NodeId {
        &self.inner.local
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn get(&self, key: &K) -> EcMapResult<Option<V>> {
        self.inner.check_alive()?;
        Ok(self.inner.store.get(key))
    }

    pub fn contains_key(&self, key: &K) -> EcMapResult<bool> {
        self.inner.check_alive()?;
        Ok(self.inner.store.contains_key(key))
    }

    pub fn contains_value(&self, value: &V) -> EcMapResult<bool> {
        self.inner.check_alive()?;
        Ok(self.inner.store.contains_value(value))
    }

    pub fn size(&self) -> EcMapResult<usize> {
        self.inner.check_alive()?;
        Ok(self.inner.store.len())
    }

    pub fn is_empty(&self) -> EcMapResult<bool> {
        self.inner.check_alive()?;
        Ok(self.inner.store.is_empty())
    }

    pub fn keys(&self) -> EcMapResult<Vec<K>> {
        self.inner.check_alive()?;
        Ok(self.inner.store.keys())
    }

    pub fn values(&self) -> EcMapResult<Vec<V>> {
        self.inner.check_alive()?;
        Ok(self.inner.store.values())
    }

    pub fn entries(&self) -> EcMapResult<Vec<(K, V)>> {
        self.inner.check_alive()?;
        Ok(self.inner.store.entries())
    }

    /// Store `value` under `key`. A put that loses to a newer entry or
    /// tombstone is silently dropped.
    pub fn put(&self, key: K, value: V) -> EcMapResult<()> {
        self.inner.check_alive()?;
        let timestamp = self.inner.clock.timestamp(&key, Some(&value));
        let entry = PutEntry {
            key: key.clone(),
            value: value.clone(),
            timestamp: timestamp.clone(),
        };
        if self.inner.apply_put(key, value, timestamp, Origin::Local) {
            self.inner.broadcast(Message::Put(vec![entry]));
        }
        Ok(())
    }

    /// Put every entry, sending the applied ones to peers as one batch.
    pub fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) -> EcMapResult<()> {
        self.inner.check_alive()?;
        let mut applied = Vec::new();
        for (key, value) in entries {
            let timestamp = self.inner.clock.timestamp(&key, Some(&value));
            if self
                .inner
                .apply_put(key.clone(), value.clone(), timestamp.clone(), Origin::Local)
            {
                applied.push(PutEntry {
                    key,
                    value,
                    timestamp,
                });
            }
        }
        if !applied.is_empty() {
            self.inner.broadcast(Message::Put(applied));
        }
        Ok(())
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(&self, key: &K) -> EcMapResult<Option<V>> {
        self.inner.check_alive()?;
        Ok(self.remove_internal(key, None))
    }

    /// Remove `key` only if it currently maps to `value`. Returns whether a
    /// value was removed.
    pub fn remove_value(&self, key: &K, value: &V) -> EcMapResult<bool> {
        self.inner.check_alive()?;
        Ok(self.remove_internal(key, Some(value)).is_some())
    }

    fn remove_internal(&self, key: &K, expected: Option<&V>) -> Option<V> {
        let timestamp = self.inner.clock.timestamp(key, None);
        let outcome = self
            .inner
            .apply_remove(key, timestamp.clone(), expected, Origin::Local);
        // A tombstone for a key that held no value stays local until the
        // next anti-entropy exchange.
        let previous = outcome.into_previous();
        if previous.is_some() {
            self.inner.broadcast(Message::Remove(vec![RemoveEntry {
                key: key.clone(),
                timestamp,
            }]));
        }
        previous
    }

    /// Remove every live key, sending the tombstones to peers as one batch.
    pub fn clear(&self) -> EcMapResult<()> {
        self.inner.check_alive()?;
        let mut removed = Vec::new();
        for key in self.inner.store.keys() {
            let timestamp = self.inner.clock.timestamp(&key, None);
            let outcome = self
                .inner
                .apply_remove(&key, timestamp.clone(), None, Origin::Local);
            if matches!(outcome, RemoveOutcome::Tombstoned { previous: Some(_) }) {
                removed.push(RemoveEntry { key, timestamp });
            }
        }
        if !removed.is_empty() {
            self.inner.broadcast(Message::Remove(removed));
        }
        Ok(())
    }

    /// Atomically replace the value of `key` with `f(key, current)`.
    ///
    /// `current` is the live value, if any. Returning `None` removes the key.
    /// The result is timestamped and applied under the key's lock, so it is
    /// dropped if it does not supersede the stored cell. Returns the value
    /// the key holds afterwards. `f` runs while the key is locked and must not
    /// access this map.
    pub fn compute<F>(&self, key: K, f: F) -> EcMapResult<Option<V>>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        self.inner.check_alive()?;
        let clock = &self.inner.clock;
        let outcome = self.inner.apply_compute(key.clone(), |key, current| {
            let value = f(key, current);
            let timestamp = clock.timestamp(key, value.as_ref());
            match value {
                Some(value) => MapValue::value(value, timestamp),
                None => MapValue::tombstone(timestamp),
            }
        });
        match outcome {
            ComputeOutcome::Unchanged { current } => Ok(current),
            ComputeOutcome::Applied { cell, previous } => match cell {
                MapValue::Value { value, timestamp } => {
                    self.inner.broadcast(Message::Put(vec![PutEntry {
                        key,
                        value: value.clone(),
                        timestamp,
                    }]));
                    Ok(Some(value))
                }
                MapValue::Tombstone { timestamp } => {
                    if previous.is_some() {
                        self.inner
                            .broadcast(Message::Remove(vec![RemoveEntry { key, timestamp }]));
                    }
                    Ok(None)
                }
            },
        }
    }

    /// Register a listener for every visible change, local or remote.
    /// Listeners run synchronously in the context that applied the change.
    pub fn add_listener<L>(&self, listener: L) -> EcMapResult<ListenerId>
    where
        L: MapEventListener<K, V> + 'static,
    {
        self.inner.check_alive()?;
        Ok(self.inner.listeners.add(Arc::new(listener)))
    }

    /// Unregister a listener. Waits for deliveries to it already running on
    /// other threads, so it is not called after this returns. A listener may
    /// remove itself.
    pub fn remove_listener(&self, id: ListenerId) -> EcMapResult<bool> {
        self.inner.check_alive()?;
        Ok(self.inner.listeners.remove(id))
    }

    /// Run one anti-entropy round now, independent of the periodic schedule.
    pub async fn run_anti_entropy_round(&self) -> RoundOutcome {
        self.inner.anti_entropy_round().await
    }

    /// Stop the map. Every later operation fails with
    /// [`EcMapError::Destroyed`]. Calling it again is a no-op.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shut_down();
        info!(map = %self.inner.name, node = %self.inner.local, "Destroyed map");
    }

    /// Destroy the map and wait until queued writes reach the persistent
    /// store.
    pub async fn shutdown(&self) {
        self.destroy();
        if let Some(persistence) = &self.inner.persistence {
            persistence.join().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Inner<K, V, T> {
        &self.inner
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct EcMapBuilder<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    name: String,
    transport: Arc<dyn ClusterTransport>,
    clock: Arc<dyn TimestampProvider<K, V, T>>,
    config: EcMapConfig,
    persistence: Option<Arc<dyn PersistentStore<K, V, T>>>,
}

impl<K, V, T> EcMapBuilder<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn ClusterTransport>,
        clock: Arc<dyn TimestampProvider<K, V, T>>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            clock,
            config: EcMapConfig::default(),
            persistence: None,
        }
    }

    pub fn with_config(mut self, config: EcMapConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_persistence(mut self, store: Arc<dyn PersistentStore<K, V, T>>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Recover from persistence, subscribe to the map's topics and start the
    /// background tasks. Must be called from within a tokio runtime.
    pub async fn build(self) -> EcMapResult<EcMap<K, V, T>> {
        self.config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| EcMapError::Config(format!("no tokio runtime available: {}", e)))?;
        metrics::describe();

        let store = ReplicatedStore::new();
        if let Some(persistence) = &self.persistence {
            let recovered = persistence.read_into(&store).await?;
            info!(map = %self.name, recovered, "Recovered entries from persistence");
        }

        let (shutdown, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = async_channel::bounded(self.config.inbound_queue_capacity);
        let local = self.transport.local_node();
        let topics = Topics::for_map(&self.name);
        let persistence = self
            .persistence
            .map(|backend| WriteBehind::spawn(self.name.clone(), backend, &runtime));

        let inner = Arc::new(Inner {
            load: LoadMonitor::from_config(&self.config),
            name: self.name,
            local,
            config: self.config,
            topics,
            store,
            listeners: ListenerRegistry::new(),
            transport: self.transport,
            clock: self.clock,
            persistence,
            runtime: runtime.clone(),
            destroyed: AtomicBool::new(false),
            shutdown,
            gossip_task: Mutex::new(None),
        });

        // On failure the dropped `inner` unsubscribes whatever was registered.
        for kind in TopicKind::ALL {
            inner
                .transport
                .subscribe(inner.topics.name(kind), inbound_tx.clone())?;
        }
        drop(inbound_tx);

        for _ in 0..inner.config.worker_pool_size {
            runtime.spawn(worker_loop(
                Arc::downgrade(&inner),
                inbound_rx.clone(),
                inner.shutdown.subscribe(),
            ));
        }
        let gossip_task = runtime.spawn(gossip::gossip_loop(
            Arc::downgrade(&inner),
            inner.config.anti_entropy_initial_delay(),
            inner.config.anti_entropy_period(),
            inner.shutdown.subscribe(),
        ));
        *inner.gossip_task.lock() = Some(gossip_task);

        info!(
            map = %inner.name,
            node = %inner.local,
            workers = inner.config.worker_pool_size,
            reconciliation = ?inner.config.reconciliation,
            "Started eventually consistent map"
        );
        Ok(EcMap { inner })
    }
}
