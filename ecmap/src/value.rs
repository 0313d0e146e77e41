use std::{fmt::Debug, hash::Hash};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Bounds required of map keys.
pub trait MapKey:
    Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> MapKey for T where
    T: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds required of map values.
pub trait MapVal: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapVal for T where
    T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// The single cell kept per key: either a live value or a tombstone, each
/// carrying the timestamp of the mutation that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapValue<V, T> {
    Value { value: V, timestamp: T },
    Tombstone { timestamp: T },
}

impl<V, T: Timestamp> MapValue<V, T> {
    pub fn value(value: V, timestamp: T) -> Self {
        Self::Value { value, timestamp }
    }

    pub fn tombstone(timestamp: T) -> Self {
        Self::Tombstone { timestamp }
    }

    pub fn timestamp(&self) -> &T {
        match self {
            Self::Value { timestamp, .. } | Self::Tombstone { timestamp } => timestamp,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Value { .. })
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone { .. })
    }

    pub fn get(&self) -> Option<&V> {
        match self {
            Self::Value { value, .. } => Some(value),
            Self::Tombstone { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Value { value, .. } => Some(value),
            Self::Tombstone { .. } => None,
        }
    }

    pub fn is_newer_than(&self, other: &T) -> bool {
        self.timestamp() > other
    }

    /// Whether `self` replaces `current` under last-writer-wins. A tombstone
    /// wins a tie against a live value; every other case needs a strictly
    /// newer timestamp.
    pub fn supersedes(&self, current: &MapValue<V, T>) -> bool {
        match (self, current) {
            (Self::Tombstone { timestamp }, Self::Value { timestamp: live, .. }) => timestamp >= live,
            _ => self.is_newer_than(current.timestamp()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let live: MapValue<&str, u64> = MapValue::value("v", 3);
        let dead: MapValue<&str, u64> = MapValue::tombstone(4);

        assert!(live.is_alive() && !live.is_tombstone());
        assert!(dead.is_tombstone() && !dead.is_alive());
        assert_eq!(live.get(), Some(&"v"));
        assert_eq!(dead.get(), None);
        assert_eq!(*dead.timestamp(), 4);
    }

    #[test]
    fn test_is_newer_than_is_strict() {
        let value: MapValue<&str, u64> = MapValue::value("v", 3);
        assert!(value.is_newer_than(&2));
        assert!(!value.is_newer_than(&3));
        assert!(!value.is_newer_than(&4));
    }

    #[test]
    fn test_supersedes() {
        let live: MapValue<&str, u64> = MapValue::value("v", 3);
        assert!(MapValue::<&str, u64>::tombstone(3).supersedes(&live));
        assert!(!MapValue::value("w", 3).supersedes(&live));
        assert!(MapValue::value("w", 4).supersedes(&live));

        let dead: MapValue<&str, u64> = MapValue::tombstone(5);
        assert!(!MapValue::<&str, u64>::tombstone(5).supersedes(&dead));
        assert!(!MapValue::value("w", 5).supersedes(&dead));
        assert!(MapValue::value("w", 6).supersedes(&dead));
    }
}
