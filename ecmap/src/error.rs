//! Error types for the eventually consistent map.
//!
//! Only precondition failures (operations on a destroyed map) and builder
//! failures reach callers. Conflict rejection is not an error, and transport or
//! persistence failures are logged by the map instead of being propagated.

use thiserror::Error;

use crate::transport::NodeId;

pub type EcMapResult<T> = Result<T, EcMapError>;

#[derive(Debug, Error)]
pub enum EcMapError {
    #[error("map '{0}' is already destroyed")]
    Destroyed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Failures reported by a [`crate::transport::ClusterTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("peer {node} has no subscriber for topic {topic}")]
    NoSubscriber { node: NodeId, topic: String },

    #[error("inbound channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(String),
}

/// Failures reported by a [`crate::persistence::PersistentStore`].
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}
