use std::{collections::HashMap, hash::Hash};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::transport::NodeId;

// ============================================================================
// Wire Messages - Units Exchanged Between Replicas
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutEntry<K, V, T> {
    pub key: K,
    pub value: V,
    pub timestamp: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveEntry<K, T> {
    pub key: K,
    pub timestamp: T,
}

/// Digest of one replica: the timestamp of every live entry and of every
/// tombstone it holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + std::hash::Hash, T: Serialize",
    deserialize = "K: DeserializeOwned + Eq + std::hash::Hash, T: DeserializeOwned"
))]
pub struct Advertisement<K, T> {
    pub sender: NodeId,
    pub timestamps: HashMap<K, T>,
    pub tombstones: HashMap<K, T>,
}

impl<K, T> PartialEq for Advertisement<K, T>
where
    K: Eq + Hash,
    T: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.sender == other.sender
            && self.timestamps == other.timestamps
            && self.tombstones == other.tombstones
    }
}

impl<K, T> Eq for Advertisement<K, T>
where
    K: Eq + Hash,
    T: Eq,
{
}

impl<K, T> Advertisement<K, T> {
    pub fn len(&self) -> usize {
        self.timestamps.len() + self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty() && self.tombstones.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize + Eq + std::hash::Hash, V: Serialize, T: Serialize",
    deserialize = "K: DeserializeOwned + Eq + std::hash::Hash, V: DeserializeOwned, T: DeserializeOwned"
))]
pub enum Message<K, V, T> {
    /// Ordered batch of puts
    Put(Vec<PutEntry<K, V, T>>),
    /// Ordered batch of removes
    Remove(Vec<RemoveEntry<K, T>>),
    Advertisement(Advertisement<K, T>),
}

impl<K, V, T> PartialEq for Message<K, V, T>
where
    K: Eq + Hash,
    V: PartialEq,
    T: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Put(a), Self::Put(b)) => a == b,
            (Self::Remove(a), Self::Remove(b)) => a == b,
            (Self::Advertisement(a), Self::Advertisement(b)) => a == b,
            _ => false,
        }
    }
}

impl<K, V, T> Eq for Message<K, V, T>
where
    K: Eq + Hash,
    V: Eq,
    T: Eq,
{
}

impl<K, V, T> Message<K, V, T>
where
    K: Serialize + DeserializeOwned + Eq + Hash,
    V: Serialize + DeserializeOwned,
    T: Serialize + DeserializeOwned,
{
    pub fn kind(&self) -> TopicKind {
        match self {
            Self::Put(_) => TopicKind::Update,
            Self::Remove(_) => TopicKind::Remove,
            Self::Advertisement(_) => TopicKind::AntiEntropy,
        }
    }

    pub fn encode(&self) -> Result<Bytes, bincode::Error> {
        bincode::serialize(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

// ============================================================================
// Topics - One Channel Per Message Kind Per Map
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Update,
    Remove,
    AntiEntropy,
}

impl TopicKind {
    pub const ALL: [TopicKind; 3] = [TopicKind::Update, TopicKind::Remove, TopicKind::AntiEntropy];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Update => "update",
            TopicKind::Remove => "remove",
            TopicKind::AntiEntropy => "anti-entropy",
        }
    }
}

/// Topic names of one map instance, derived from the map name so several
/// maps can share a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    update: String,
    remove: String,
    anti_entropy: String,
}

impl Topics {
    pub fn for_map(map_name: &str) -> Self {
        let name = |kind: TopicKind| format!("ecm-{}-{}", map_name, kind.as_str());
        Self {
            update: name(TopicKind::Update),
            remove: name(TopicKind::Remove),
            anti_entropy: name(TopicKind::AntiEntropy),
        }
    }

    pub fn name(&self, kind: TopicKind) -> &str {
        match kind {
            TopicKind::Update => &self.update,
            TopicKind::Remove => &self.remove,
            TopicKind::AntiEntropy => &self.anti_entropy,
        }
    }

    pub fn kind_of(&self, topic: &str) -> Option<TopicKind> {
        TopicKind::ALL
            .into_iter()
            .find(|kind| self.name(*kind) == topic)
    }
}
