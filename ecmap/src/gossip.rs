//! Anti-entropy
//!
//! Each round one random peer receives this replica's advertisement: the
//! timestamp of every live entry and every tombstone. The receiver compares it
//! with its own state, pushes back what the sender is missing and reaps
//! entries the sender has already deleted.

use std::{sync::Weak, time::Duration};

use rand::seq::IndexedRandom;
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::ReconciliationMode,
    map::Inner,
    message::{Advertisement, Message, PutEntry, RemoveEntry, TopicKind},
    metrics::{self, Origin},
    timestamp::Timestamp,
    transport::NodeId,
    value::{MapKey, MapVal, MapValue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Destroyed,
    HighLoad,
    NoPeers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Skipped(SkipReason),
    /// Advertisement handed to the transport for this peer
    Sent(NodeId),
    Failed(NodeId),
}

impl RoundOutcome {
    fn label(&self) -> &'static str {
        match self {
            RoundOutcome::Skipped(SkipReason::Destroyed) => "skipped_destroyed",
            RoundOutcome::Skipped(SkipReason::HighLoad) => "skipped_high_load",
            RoundOutcome::Skipped(SkipReason::NoPeers) => "skipped_no_peers",
            RoundOutcome::Sent(_) => "sent",
            RoundOutcome::Failed(_) => "failed",
        }
    }
}

impl<K, V, T> Inner<K, V, T>
where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    pub(crate) fn advertisement(&self) -> Advertisement<K, T> {
        let (timestamps, tombstones) = self.store.digest();
        Advertisement {
            sender: self.local.clone(),
            timestamps,
            tombstones,
        }
    }

    #[instrument(skip(self), fields(map = %self.name))]
    pub(crate) async fn anti_entropy_round(&self) -> RoundOutcome {
        let outcome = self.try_round().await;
        metrics::record_round(&self.name, outcome.label());
        metrics::set_sizes(&self.name, self.store.len(), self.store.tombstone_count());
        outcome
    }

    async fn try_round(&self) -> RoundOutcome {
        if self.is_destroyed() {
            return RoundOutcome::Skipped(SkipReason::Destroyed);
        }
        if self.load.is_under_high_load() {
            debug!(
                recent = self.load.recent_operations(),
                "Skipping anti-entropy round under high load"
            );
            return RoundOutcome::Skipped(SkipReason::HighLoad);
        }

        let peers: Vec<NodeId> = self
            .transport
            .active_peers()
            .into_iter()
            .filter(|peer| peer != &self.local)
            .collect();
        let Some(peer) = peers.choose(&mut rand::rng()).cloned() else {
            trace!("No peers for anti-entropy");
            return RoundOutcome::Skipped(SkipReason::NoPeers);
        };

        let advertisement = self.advertisement();
        trace!(%peer, entries = advertisement.len(), "Sending advertisement");
        let payload = match Message::<K, V, T>::Advertisement(advertisement).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to encode advertisement");
                return RoundOutcome::Failed(peer);
            }
        };

        let topic = self.topics.name(TopicKind::AntiEntropy);
        match self.transport.unicast(topic, &peer, payload).await {
            Ok(()) => RoundOutcome::Sent(peer),
            Err(e) => {
                warn!(%peer, error = %e, "Failed to send advertisement");
                metrics::record_send_failure(&self.name, topic);
                RoundOutcome::Failed(peer)
            }
        }
    }

    /// Reconcile local state against a peer's advertisement.
    #[instrument(skip_all, fields(map = %self.name, peer = %advertisement.sender))]
    pub(crate) fn handle_advertisement(&self, advertisement: Advertisement<K, T>) {
        let peer = advertisement.sender.clone();
        let mut puts = Vec::new();
        let mut removes = Vec::new();

        for (key, cell) in self.store.snapshot() {
            match cell {
                MapValue::Value { value, timestamp } => {
                    if let Some(deleted) = advertisement.tombstones.get(&key) {
                        if deleted >= &timestamp {
                            // The peer deleted this entry after (or as) we wrote it.
                            self.clock.observe(deleted);
                            self.apply_remove(&key, deleted.clone(), None, Origin::AntiEntropy);
                            continue;
                        }
                    }
                    let remote = advertisement
                        .timestamps
                        .get(&key)
                        .or_else(|| advertisement.tombstones.get(&key));
                    if remote.is_none_or(|remote| remote < &timestamp) {
                        puts.push(PutEntry {
                            key,
                            value,
                            timestamp,
                        });
                    }
                }
                MapValue::Tombstone { timestamp } => {
                    if advertisement
                        .timestamps
                        .get(&key)
                        .is_some_and(|remote| remote <= &timestamp)
                    {
                        removes.push(RemoveEntry { key, timestamp });
                    }
                }
            }
        }

        if self.config.reconciliation == ReconciliationMode::Full {
            self.reconcile_full(&advertisement);
        }

        debug!(
            puts = puts.len(),
            removes = removes.len(),
            "Reconciled advertisement"
        );
        if !puts.is_empty() {
            self.send_to(&peer, Message::Put(puts));
        }
        if !removes.is_empty() {
            self.send_to(&peer, Message::Remove(removes));
        }
    }

    /// Adopt the peer's newer tombstones, then advertise back if the peer
    /// holds live entries this replica lacks or has older versions of.
    fn reconcile_full(&self, advertisement: &Advertisement<K, T>) {
        for (key, deleted) in &advertisement.tombstones {
            self.clock.observe(deleted);
            self.apply_remove(key, deleted.clone(), None, Origin::AntiEntropy);
        }

        let behind = advertisement
            .timestamps
            .iter()
            .any(|(key, remote)| match self.store.cell(key) {
                None => true,
                Some(MapValue::Value { timestamp, .. }) => &timestamp < remote,
                Some(MapValue::Tombstone { timestamp }) => &timestamp < remote,
            });
        if behind {
            debug!(peer = %advertisement.sender, "Behind peer, advertising back");
            self.send_to(
                &advertisement.sender,
                Message::Advertisement(self.advertisement()),
            );
        }
    }
}

/// Periodic round driver. Holds only a weak reference so dropping the last
/// map handle ends the loop.
pub(crate) async fn gossip_loop<K, V, T>(
    inner: Weak<Inner<K, V, T>>,
    initial_delay: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    K: MapKey,
    V: MapVal,
    T: Timestamp,
{
    let mut interval = interval_at(Instant::now() + initial_delay, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.anti_entropy_round().await;
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
    debug!("Anti-entropy loop stopped");
}
