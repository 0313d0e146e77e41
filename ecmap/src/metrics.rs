//! Metric names and recording helpers
//!
//! All metrics carry a `map` label. Nothing is exported from this crate; the
//! embedding process installs whatever `metrics` recorder it uses.

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

pub const UPDATES_APPLIED: &str = "ecmap_updates_applied_total";
pub const UPDATES_REJECTED: &str = "ecmap_updates_rejected_total";
pub const ANTI_ENTROPY_ROUNDS: &str = "ecmap_anti_entropy_rounds_total";
pub const SEND_FAILURES: &str = "ecmap_send_failures_total";
pub const DECODE_FAILURES: &str = "ecmap_decode_failures_total";
pub const PERSISTENCE_FAILURES: &str = "ecmap_persistence_failures_total";
pub const LIVE_ENTRIES: &str = "ecmap_live_entries";
pub const TOMBSTONES: &str = "ecmap_tombstones";

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
    AntiEntropy,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
            Origin::AntiEntropy => "anti_entropy",
        }
    }
}

pub fn describe() {
    describe_counter!(UPDATES_APPLIED, "Mutations applied to the local replica");
    describe_counter!(UPDATES_REJECTED, "Mutations rejected as stale");
    describe_counter!(ANTI_ENTROPY_ROUNDS, "Anti-entropy rounds by outcome");
    describe_counter!(SEND_FAILURES, "Failed sends to peers by topic");
    describe_counter!(DECODE_FAILURES, "Inbound messages that failed to decode");
    describe_counter!(PERSISTENCE_FAILURES, "Failed write-behind operations");
    describe_gauge!(LIVE_ENTRIES, "Live entries in the local replica");
    describe_gauge!(TOMBSTONES, "Tombstones in the local replica");
}

pub fn record_update(map: &str, origin: Origin, applied: bool) {
    let name = if applied {
        UPDATES_APPLIED
    } else {
        UPDATES_REJECTED
    };
    counter!(name, "map" => map.to_string(), "origin" => origin.as_str()).increment(1);
}

pub fn record_round(map: &str, outcome: &'static str) {
    counter!(ANTI_ENTROPY_ROUNDS, "map" => map.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_send_failure(map: &str, topic: &str) {
    counter!(SEND_FAILURES, "map" => map.to_string(), "topic" => topic.to_string()).increment(1);
}

pub fn record_decode_failure(map: &str) {
    counter!(DECODE_FAILURES, "map" => map.to_string()).increment(1);
}

pub fn record_persistence_failure(map: &str) {
    counter!(PERSISTENCE_FAILURES, "map" => map.to_string()).increment(1);
}

pub fn set_sizes(map: &str, live: usize, tombstones: usize) {
    gauge!(LIVE_ENTRIES, "map" => map.to_string()).set(live as f64);
    gauge!(TOMBSTONES, "map" => map.to_string()).set(tombstones as f64);
}
