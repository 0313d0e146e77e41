use std::{
    fmt::Debug,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::transport::NodeId;

// ============================================================================
// Timestamp - Totally Ordered Version of a Key
// ============================================================================

/// Opaque, totally ordered version attached to every entry and tombstone.
///
/// `a > b` means `a` is newer than `b`.
pub trait Timestamp: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Timestamp for T where T: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Source of timestamps for local mutations.
///
/// `value` is `None` when timestamping a remove.
pub trait TimestampProvider<K, V, T>: Send + Sync {
    fn timestamp(&self, key: &K, value: Option<&V>) -> T;

    /// Called with every timestamp received from a peer.
    fn observe(&self, _remote: &T) {}
}

impl<K, V, T, F> TimestampProvider<K, V, T> for F
where
    F: Fn(&K, Option<&V>) -> T + Send + Sync,
{
    fn timestamp(&self, key: &K, value: Option<&V>) -> T {
        self(key, value)
    }
}

// ============================================================================
// Logical Clock - Lamport Counter
// ============================================================================

/// Lamport timestamp. Ordered by counter first, then by the writing node, so
/// concurrent writes to one key from two nodes still have a single winner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    pub counter: u64,
    pub node: NodeId,
}

impl LogicalTimestamp {
    pub fn new(counter: u64, node: impl Into<NodeId>) -> Self {
        Self {
            counter,
            node: node.into(),
        }
    }
}

impl std::fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.counter, self.node)
    }
}

/// Lamport clock shared by every key of a map on one node.
///
/// Observing remote timestamps keeps local writes ordered after everything
/// this replica has already seen.
#[derive(Debug)]
pub struct LogicalClock {
    node: NodeId,
    counter: AtomicU64,
}

impl LogicalClock {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            counter: AtomicU64::new(0),
        }
    }

    pub fn tick(&self) -> LogicalTimestamp {
        LogicalTimestamp {
            counter: self.counter.fetch_add(1, Ordering::SeqCst) + 1,
            node: self.node.clone(),
        }
    }

    /// Move the clock to at least `remote`.
    pub fn update(&self, remote: &LogicalTimestamp) {
        self.counter.fetch_max(remote.counter, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl<K, V> TimestampProvider<K, V, LogicalTimestamp> for LogicalClock {
    fn timestamp(&self, _key: &K, _value: Option<&V>) -> LogicalTimestamp {
        self.tick()
    }

    fn observe(&self, remote: &LogicalTimestamp) {
        self.update(remote);
    }
}

// ============================================================================
// Wall Clock - Milliseconds With Node Tie-Break
// ============================================================================

/// Wall-clock timestamp. Ordered by milliseconds first, then by node id so
/// that concurrent writes from two nodes in the same millisecond still have a
/// single winner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallClockTimestamp {
    pub millis: i64,
    pub node: NodeId,
}

/// Millisecond wall clock, strictly increasing per node even when the system
/// clock stalls or steps backwards.
#[derive(Debug)]
pub struct WallClock {
    node: NodeId,
    last: AtomicI64,
}

impl WallClock {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            last: AtomicI64::new(i64::MIN),
        }
    }

    pub fn now(&self) -> WallClockTimestamp {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut millis = wall;
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                millis = wall.max(last.saturating_add(1));
                Some(millis)
            });
        WallClockTimestamp {
            millis,
            node: self.node.clone(),
        }
    }
}

impl<K, V> TimestampProvider<K, V, WallClockTimestamp> for WallClock {
    fn timestamp(&self, _key: &K, _value: Option<&V>) -> WallClockTimestamp {
        self.now()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_logical_clock_ticks_monotonically() {
        let clock = LogicalClock::new(NodeId::from("a"));
        let t1 = clock.tick();
        let t2 = clock.tick();
        assert!(t2 > t1);
        assert_eq!(t2, LogicalTimestamp::new(2, "a"));
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn test_logical_clock_observes_remote() {
        let clock = LogicalClock::new(NodeId::from("a"));
        clock.tick();
        TimestampProvider::<String, String, _>::observe(&clock, &LogicalTimestamp::new(41, "b"));
        let next = TimestampProvider::<String, String, _>::timestamp(&clock, &"k".to_string(), None);
        assert_eq!(next, LogicalTimestamp::new(42, "a"));

        // An older remote timestamp never moves the clock back.
        clock.update(&LogicalTimestamp::new(3, "b"));
        assert_eq!(clock.current(), 42);
    }

    #[test]
    fn test_logical_timestamps_from_two_nodes_never_tie() {
        let a = LogicalClock::new(NodeId::from("a"));
        let b = LogicalClock::new(NodeId::from("b"));
        let from_a = a.tick();
        let from_b = b.tick();
        assert_eq!(from_a.counter, from_b.counter);
        assert_ne!(from_a, from_b);
        assert!(from_b > from_a);

        // The counter dominates the node.
        assert!(a.tick() > from_b);
    }

    #[test]
    fn test_logical_clock_concurrent_ticks_are_unique() {
        let clock = Arc::new(LogicalClock::new(NodeId::from("a")));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || (0..250).map(|_| clock.tick().counter).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn test_wall_clock_strictly_increasing() {
        let clock = WallClock::new(NodeId::from("node1"));
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_wall_clock_ties_broken_by_node() {
        let a = WallClockTimestamp {
            millis: 100,
            node: NodeId::from("a"),
        };
        let b = WallClockTimestamp {
            millis: 100,
            node: NodeId::from("b"),
        };
        assert!(b > a);
        let later = WallClockTimestamp {
            millis: 101,
            node: NodeId::from("a"),
        };
        assert!(later > b);
    }

    #[test]
    fn test_closure_provider() {
        let provider = |key: &String, value: Option<&u32>| -> u64 {
            key.len() as u64 + value.copied().unwrap_or(0) as u64
        };
        assert_eq!(provider.timestamp(&"abc".to_string(), Some(&2)), 5);
        assert_eq!(provider.timestamp(&"abc".to_string(), None), 3);
    }
}
