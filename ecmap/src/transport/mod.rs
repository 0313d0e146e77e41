//! Peer transport abstraction
//!
//! The map does not know how messages travel between cluster members. It
//! needs unicast and broadcast on named topics, a view of the currently active
//! members, and a way to receive inbound messages for the topics it subscribes
//! to.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// Cluster member identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identity, for nodes that have no configured name.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub sender: NodeId,
    pub payload: Bytes,
}

#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    fn local_node(&self) -> NodeId;

    /// Members currently able to receive messages. May include the local node.
    fn active_peers(&self) -> Vec<NodeId>;

    async fn unicast(&self, topic: &str, to: &NodeId, payload: Bytes)
        -> Result<(), TransportError>;

    /// Send to every active member except the local node.
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Route messages arriving on `topic` into `sink`, replacing any previous
    /// subscription for that topic.
    fn subscribe(
        &self,
        topic: &str,
        sink: async_channel::Sender<InboundMessage>,
    ) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str);
}
