//! Checks-per-minute over a sliding 60 second window
//!
//! A ring of one-second buckets; each bucket remembers which second it
//! belongs to so stale buckets are ignored without a sweep.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

const WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    second: u64,
    count: u64,
}

#[derive(Debug)]
pub struct ThroughputWindow {
    origin: Instant,
    slots: Mutex<[Slot; WINDOW_SECS as usize]>,
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            slots: Mutex::new([Slot::default(); WINDOW_SECS as usize]),
        }
    }

    fn now_second(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }

    /// Counts one terminal outcome now
    pub fn record(&self) {
        self.record_at(self.now_second());
    }

    #[must_use]
    pub fn cpm(&self) -> u64 {
        self.cpm_at(self.now_second())
    }

    pub(crate) fn record_at(&self, second: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = &mut slots[(second % WINDOW_SECS) as usize];
        if slot.second != second {
            *slot = Slot { second, count: 0 };
        }
        slot.count += 1;
    }

    /// Outcomes recorded in the 60 seconds ending at `second`
    pub(crate) fn cpm_at(&self, second: u64) -> u64 {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .filter(|slot| slot.count > 0 && second.saturating_sub(slot.second) < WINDOW_SECS && slot.second <= second)
            .map(|slot| slot.count)
            .sum()
    }

    pub fn reset(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        *slots = [Slot::default(); WINDOW_SECS as usize];
    }
}
