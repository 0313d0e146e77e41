//! Recent-activity tracking used to throttle anti-entropy
//!
//! Operations are counted into one-second slots of a fixed-size ring. When the
//! last few slots hold more operations than the configured threshold, the
//! gossip round is skipped.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use crate::config::EcMapConfig;

struct Slot {
    second: AtomicU64,
    count: AtomicU64,
}

/// Ring of per-second counters.
///
/// Slots are reset lazily by the first writer of a new second. Concurrent
/// writers racing on the reset may lose a few increments; the counter is an
/// approximation.
pub struct SlidingWindowCounter {
    slots: Box<[Slot]>,
    started: Instant,
}

impl SlidingWindowCounter {
    pub fn new(window_slots: usize) -> Self {
        let slots = (0..window_slots.max(1))
            .map(|_| Slot {
                second: AtomicU64::new(0),
                count: AtomicU64::new(0),
            })
            .collect();
        Self {
            slots,
            started: Instant::now(),
        }
    }

    fn current_second(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    fn slot(&self, second: u64) -> &Slot {
        &self.slots[(second % self.slots.len() as u64) as usize]
    }

    pub fn increment(&self) {
        let now = self.current_second();
        let slot = self.slot(now);
        let seen = slot.second.load(Ordering::Acquire);
        if seen != now
            && slot
                .second
                .compare_exchange(seen, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            slot.count.store(0, Ordering::Release);
        }
        slot.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Sum of the most recent `slots` seconds, the current one included.
    pub fn get(&self, slots: usize) -> u64 {
        let now = self.current_second();
        let slots = slots.min(self.slots.len()) as u64;
        (0..slots)
            .filter_map(|back| now.checked_sub(back))
            .map(|second| {
                let slot = self.slot(second);
                if slot.second.load(Ordering::Acquire) == second {
                    slot.count.load(Ordering::Acquire)
                } else {
                    0
                }
            })
            .sum()
    }
}

/// Decides whether the map is busy enough to skip gossip.
pub struct LoadMonitor {
    counter: SlidingWindowCounter,
    window: usize,
    threshold: u64,
}

impl LoadMonitor {
    pub fn new(window_slots: usize, window: usize, threshold: u64) -> Self {
        Self {
            counter: SlidingWindowCounter::new(window_slots),
            window,
            threshold,
        }
    }

    pub fn from_config(config: &EcMapConfig) -> Self {
        Self::new(
            config.load_window_slots,
            config.load_window,
            config.high_load_threshold,
        )
    }

    pub fn record(&self) {
        self.counter.increment();
    }

    pub fn recent_operations(&self) -> u64 {
        self.counter.get(self.window)
    }

    pub fn is_under_high_load(&self) -> bool {
        self.recent_operations() > self.threshold
    }
}
