//! Map configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EcMapError, EcMapResult};

/// How much work a replica does when it receives an advertisement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationMode {
    /// Push newer local entries and reap remote zombies only.
    #[default]
    Lightweight,
    /// Additionally adopt advertised tombstones and pull entries the sender
    /// knows about by advertising back.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EcMapConfig {
    /// Delay before the first anti-entropy round
    #[serde(default = "default_initial_delay_ms")]
    pub anti_entropy_initial_delay_ms: u64,
    /// Period between anti-entropy rounds
    #[serde(default = "default_period_ms")]
    pub anti_entropy_period_ms: u64,
    #[serde(default)]
    pub reconciliation: ReconciliationMode,
    /// Number of tasks processing inbound peer messages
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
    /// One-second slots kept by the load counter
    #[serde(default = "default_load_window_slots")]
    pub load_window_slots: usize,
    /// Recent slots summed when checking for high load
    #[serde(default = "default_load_window")]
    pub load_window: usize,
    /// Operation count above which a gossip round is skipped
    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: u64,
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_period_ms() -> u64 {
    5_000
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_inbound_queue_capacity() -> usize {
    1024
}

fn default_load_window_slots() -> usize {
    5
}

fn default_load_window() -> usize {
    2
}

fn default_high_load_threshold() -> u64 {
    0
}

impl Default for EcMapConfig {
    fn default() -> Self {
        Self {
            anti_entropy_initial_delay_ms: default_initial_delay_ms(),
            anti_entropy_period_ms: default_period_ms(),
            reconciliation: ReconciliationMode::default(),
            worker_pool_size: default_worker_pool_size(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
            load_window_slots: default_load_window_slots(),
            load_window: default_load_window(),
            high_load_threshold: default_high_load_threshold(),
        }
    }
}

impl EcMapConfig {
    pub fn anti_entropy_initial_delay(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_initial_delay_ms)
    }

    pub fn anti_entropy_period(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_period_ms)
    }

    pub fn validate(&self) -> EcMapResult<()> {
        if self.anti_entropy_period_ms == 0 {
            return Err(EcMapError::Config(
                "anti_entropy_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(EcMapError::Config(
                "worker_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(EcMapError::Config(
                "inbound_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.load_window_slots == 0 {
            return Err(EcMapError::Config(
                "load_window_slots must be greater than 0".to_string(),
            ));
        }
        if self.load_window == 0 || self.load_window > self.load_window_slots {
            return Err(EcMapError::Config(format!(
                "load_window must be between 1 and load_window_slots ({}), got {}",
                self.load_window_slots, self.load_window
            )));
        }
        Ok(())
    }
}
