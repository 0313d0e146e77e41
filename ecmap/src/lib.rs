//! Eventually Consistent Distributed Map
//!
//! This crate provides a key-value map replicated across cluster members:
//! - Last-writer-wins conflict resolution on caller-supplied timestamps
//! - Tombstones so deletes propagate and stale puts cannot resurrect keys
//! - Periodic anti-entropy gossip that repairs missed updates
//! - Synchronous change listeners and optional write-behind persistence

pub mod config;
pub mod error;
pub mod event;
pub mod gossip;
pub mod load;
pub mod map;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod store;
pub mod timestamp;
pub mod transport;
pub mod value;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::{EcMapConfig, ReconciliationMode};
pub use error::{EcMapError, EcMapResult, PersistenceError, TransportError};
pub use event::{EventKind, ListenerId, MapEvent, MapEventListener};
pub use gossip::{RoundOutcome, SkipReason};
pub use map::{EcMap, EcMapBuilder};
pub use persistence::{FilePersistentStore, MemoryPersistentStore, PersistentStore};
pub use timestamp::{
    LogicalClock, LogicalTimestamp, Timestamp, TimestampProvider, WallClock, WallClockTimestamp,
};
pub use transport::{
    memory::{MemoryCluster, MemoryTransport},
    ClusterTransport, InboundMessage, NodeId,
};
pub use value::{MapKey, MapVal, MapValue};
