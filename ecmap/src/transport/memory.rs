//! In-process transport
//!
//! Every node of a [`MemoryCluster`] lives in the same process. Nodes can be
//! isolated to simulate partitions, and every send attempt is recorded so
//! callers can inspect what went over the wire.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{ClusterTransport, InboundMessage, NodeId};
use crate::error::TransportError;

/// One recorded send attempt.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub from: NodeId,
    pub to: NodeId,
    pub payload: Bytes,
    pub delivered: bool,
}

#[derive(Default)]
struct Member {
    isolated: AtomicBool,
    subscriptions: DashMap<String, async_channel::Sender<InboundMessage>>,
}

#[derive(Default)]
struct ClusterInner {
    members: DashMap<NodeId, Arc<Member>>,
    sent: Mutex<Vec<SentMessage>>,
}

/// Registry of in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its transport handle.
    pub fn join(&self, node: impl Into<NodeId>) -> Arc<MemoryTransport> {
        let node = node.into();
        self.inner
            .members
            .entry(node.clone())
            .or_insert_with(|| Arc::new(Member::default()));
        Arc::new(MemoryTransport {
            cluster: self.inner.clone(),
            local: node,
        })
    }

    pub fn leave(&self, node: &NodeId) {
        self.inner.members.remove(node);
    }

    /// Drop every message to or from `node` until [`Self::heal`] is called.
    pub fn isolate(&self, node: &NodeId) {
        if let Some(member) = self.inner.members.get(node) {
            member.isolated.store(true, Ordering::SeqCst);
        }
    }

    pub fn heal(&self, node: &NodeId) {
        if let Some(member) = self.inner.members.get(node) {
            member.isolated.store(false, Ordering::SeqCst);
        }
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.inner.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.inner.sent.lock().clear();
    }

    /// Deliver a previously recorded message again, regardless of isolation.
    pub async fn redeliver(&self, message: &SentMessage) -> Result<(), TransportError> {
        let sink = self.inner.sink(&message.to, &message.topic)?;
        sink.send(InboundMessage {
            topic: message.topic.clone(),
            sender: message.from.clone(),
            payload: message.payload.clone(),
        })
        .await
        .map_err(|_| TransportError::ChannelClosed)
    }
}

impl ClusterInner {
    fn is_isolated(&self, node: &NodeId) -> bool {
        self.members
            .get(node)
            .map(|member| member.isolated.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    fn sink(
        &self,
        node: &NodeId,
        topic: &str,
    ) -> Result<async_channel::Sender<InboundMessage>, TransportError> {
        let member = self
            .members
            .get(node)
            .map(|member| member.value().clone())
            .ok_or_else(|| TransportError::Unreachable(node.clone()))?;
        let sink = member
            .subscriptions
            .get(topic)
            .map(|sink| sink.value().clone())
            .ok_or_else(|| TransportError::NoSubscriber {
                node: node.clone(),
                topic: topic.to_string(),
            })?;
        Ok(sink)
    }

    fn record(&self, topic: &str, from: &NodeId, to: &NodeId, payload: &Bytes, delivered: bool) {
        self.sent.lock().push(SentMessage {
            topic: topic.to_string(),
            from: from.clone(),
            to: to.clone(),
            payload: payload.clone(),
            delivered,
        });
    }

    async fn deliver(
        &self,
        topic: &str,
        from: &NodeId,
        to: &NodeId,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        if self.is_isolated(from) || self.is_isolated(to) {
            self.record(topic, from, to, &payload, false);
            return Err(TransportError::Unreachable(to.clone()));
        }
        let sink = match self.sink(to, topic) {
            Ok(sink) => sink,
            Err(e) => {
                self.record(topic, from, to, &payload, false);
                return Err(e);
            }
        };
        self.record(topic, from, to, &payload, true);
        trace!(%from, %to, topic, "Delivering in-memory message");
        sink.send(InboundMessage {
            topic: topic.to_string(),
            sender: from.clone(),
            payload,
        })
        .await
        .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Transport handle of one node in a [`MemoryCluster`].
pub struct MemoryTransport {
    cluster: Arc<ClusterInner>,
    local: NodeId,
}

#[async_trait]
impl ClusterTransport for MemoryTransport {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn active_peers(&self) -> Vec<NodeId> {
        self.cluster
            .members
            .iter()
            .filter(|member| !member.value().isolated.load(Ordering::SeqCst))
            .map(|member| member.key().clone())
            .collect()
    }

    async fn unicast(
        &self,
        topic: &str,
        to: &NodeId,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.cluster.deliver(topic, &self.local, to, payload).await
    }

    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let targets: Vec<NodeId> = self
            .cluster
            .members
            .iter()
            .map(|member| member.key().clone())
            .filter(|node| node != &self.local)
            .collect();

        let mut first_error = None;
        for target in targets {
            if let Err(e) = self
                .cluster
                .deliver(topic, &self.local, &target, payload.clone())
                .await
            {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn subscribe(
        &self,
        topic: &str,
        sink: async_channel::Sender<InboundMessage>,
    ) -> Result<(), TransportError> {
        let member = self
            .cluster
            .members
            .get(&self.local)
            .map(|member| member.value().clone())
            .ok_or_else(|| TransportError::Unreachable(self.local.clone()))?;
        member.subscriptions.insert(topic.to_string(), sink);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) {
        if let Some(member) = self.cluster.members.get(&self.local) {
            member.subscriptions.remove(topic);
        }
    }
}
