//! Map events and listener fan-out
//!
//! Events are delivered synchronously in the context that applied the
//! mutation. Removing a listener waits for deliveries to that listener running
//! on other threads, so a listener is never invoked after
//! [`ListenerRegistry::remove`] returns. A listener may remove itself, clear
//! the registry or destroy the map from inside its own callback.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Put,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEvent<K, V> {
    pub map: String,
    pub kind: EventKind,
    pub key: K,
    /// New value for `Put`, removed value for `Remove`
    pub value: Option<V>,
}

impl<K, V> MapEvent<K, V> {
    pub fn put(map: &str, key: K, value: V) -> Self {
        Self {
            map: map.to_string(),
            kind: EventKind::Put,
            key,
            value: Some(value),
        }
    }

    pub fn remove(map: &str, key: K, previous: V) -> Self {
        Self {
            map: map.to_string(),
            kind: EventKind::Remove,
            key,
            value: Some(previous),
        }
    }
}

pub trait MapEventListener<K, V>: Send + Sync {
    fn event(&self, event: &MapEvent<K, V>);
}

impl<K, V, F> MapEventListener<K, V> for F
where
    F: Fn(&MapEvent<K, V>) + Send + Sync,
{
    fn event(&self, event: &MapEvent<K, V>) {
        self(event)
    }
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Registration<K, V> {
    id: ListenerId,
    listener: Arc<dyn MapEventListener<K, V>>,
    active: AtomicBool,
    /// Threads currently inside `listener`, one slot per nested call.
    delivering: Mutex<Vec<ThreadId>>,
    idle: Condvar,
}

impl<K, V> Registration<K, V> {
    fn deliver(&self, event: &MapEvent<K, V>) {
        let current = thread::current().id();
        self.delivering.lock().push(current);
        let _guard = DeliveryGuard {
            registration: self,
            thread: current,
        };
        if self.active.load(Ordering::SeqCst) {
            self.listener.event(event);
        } else {
            debug!(listener = ?self.id, "Skipping removed listener");
        }
    }

    /// Stop new deliveries and wait for the ones running on other threads.
    /// A delivery on the calling thread is the caller itself and is not
    /// waited for.
    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        let current = thread::current().id();
        let mut delivering = self.delivering.lock();
        while delivering.iter().any(|thread| *thread != current) {
            self.idle.wait(&mut delivering);
        }
    }
}

struct DeliveryGuard<'a, K, V> {
    registration: &'a Registration<K, V>,
    thread: ThreadId,
}

impl<K, V> Drop for DeliveryGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut delivering = self.registration.delivering.lock();
        if let Some(index) = delivering.iter().position(|thread| *thread == self.thread) {
            delivering.swap_remove(index);
        }
        self.registration.idle.notify_all();
    }
}

pub struct ListenerRegistry<K, V> {
    registrations: RwLock<Vec<Arc<Registration<K, V>>>>,
    next_id: AtomicU64,
}

impl<K, V> Default for ListenerRegistry<K, V> {
    fn default() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<K, V> ListenerRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn MapEventListener<K, V>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.write().push(Arc::new(Registration {
            id,
            listener,
            active: AtomicBool::new(true),
            delivering: Mutex::new(Vec::new()),
            idle: Condvar::new(),
        }));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let removed = {
            let mut registrations = self.registrations.write();
            registrations
                .iter()
                .position(|r| r.id == id)
                .map(|index| registrations.remove(index))
        };
        match removed {
            Some(registration) => {
                registration.deactivate();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let drained: Vec<_> = self.registrations.write().drain(..).collect();
        for registration in drained {
            registration.deactivate();
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: &MapEvent<K, V>) {
        let snapshot: Vec<_> = self.registrations.read().clone();
        for registration in snapshot {
            registration.deliver(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicUsize, Barrier, Weak},
        thread,
        time::Duration,
    };

    use super::*;

    fn recorder() -> (
        Arc<Mutex<Vec<MapEvent<String, u32>>>>,
        Arc<dyn MapEventListener<String, u32>>,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: Arc<dyn MapEventListener<String, u32>> =
            Arc::new(move |event: &MapEvent<String, u32>| sink.lock().push(event.clone()));
        (events, listener)
    }

    #[test]
    fn test_every_listener_gets_each_event_once() {
        let registry = ListenerRegistry::new();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        registry.add(l1);
        registry.add(l2);

        registry.notify(&MapEvent::put("m", "a".to_string(), 1));
        registry.notify(&MapEvent::remove("m", "a".to_string(), 1));

        for events in [first, second] {
            let events = events.lock();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].kind, EventKind::Put);
            assert_eq!(events[1].kind, EventKind::Remove);
            assert_eq!(events[1].value, Some(1));
        }
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let registry = ListenerRegistry::new();
        let (events, listener) = recorder();
        let id = registry.add(listener);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.notify(&MapEvent::put("m", "a".to_string(), 1));
        assert!(events.lock().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_drops_all_listeners() {
        let registry = ListenerRegistry::new();
        let (events, listener) = recorder();
        registry.add(listener.clone());
        registry.add(listener);
        assert_eq!(registry.len(), 2);

        registry.clear();
        registry.notify(&MapEvent::put("m", "a".to_string(), 1));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_remove_waits_for_in_flight_delivery() {
        let registry = Arc::new(ListenerRegistry::<String, u32>::new());
        let entered = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicUsize::new(0));

        let listener_entered = entered.clone();
        let listener_calls = calls.clone();
        let id = registry.add(Arc::new(move |_: &MapEvent<String, u32>| {
            listener_calls.fetch_add(1, Ordering::SeqCst);
            listener_entered.wait();
            thread::sleep(Duration::from_millis(50));
        }));

        let notifier = {
            let registry = registry.clone();
            thread::spawn(move || registry.notify(&MapEvent::put("m", "a".to_string(), 1)))
        };

        entered.wait();
        assert!(registry.remove(id));
        // The delivery that was running when remove started has completed.
        notifier.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.notify(&MapEvent::put("m", "b".to_string(), 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_remove_itself() {
        let registry = Arc::new(ListenerRegistry::<String, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let weak: Weak<ListenerRegistry<String, u32>> = Arc::downgrade(&registry);
        let listener_calls = calls.clone();
        let listener_id = own_id.clone();
        let id = registry.add(Arc::new(move |_: &MapEvent<String, u32>| {
            listener_calls.fetch_add(1, Ordering::SeqCst);
            let id = listener_id.lock().take();
            if let (Some(registry), Some(id)) = (weak.upgrade(), id) {
                assert!(registry.remove(id));
            }
        }));
        *own_id.lock() = Some(id);

        registry.notify(&MapEvent::put("m", "a".to_string(), 1));
        registry.notify(&MapEvent::put("m", "b".to_string(), 2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_from_inside_listener_stops_later_listeners() {
        let registry = Arc::new(ListenerRegistry::<String, u32>::new());
        let weak = Arc::downgrade(&registry);
        registry.add(Arc::new(move |_: &MapEvent<String, u32>| {
            if let Some(registry) = weak.upgrade() {
                registry.clear();
            }
        }));
        let (events, listener) = recorder();
        registry.add(listener);

        let notifier = {
            let registry = registry.clone();
            thread::spawn(move || registry.notify(&MapEvent::put("m", "a".to_string(), 1)))
        };
        notifier.join().unwrap();

        assert!(registry.is_empty());
        assert!(events.lock().is_empty());
    }
}
