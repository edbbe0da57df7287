//! Sliding window of delivery instants

use std::time::Instant;

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Keeps the last `window` instants; the oldest is overwritten when full.
pub struct DeliveryRate {
    history: HeapRb<Instant>,
}

impl DeliveryRate {
    pub fn new(window: usize) -> Self {
        Self {
            history: HeapRb::new(window.max(2)),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.history.push_overwrite(at);
    }

    pub fn len(&self) -> usize {
        self.history.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Results per second across the window, 0.0 with fewer than two samples.
    pub fn per_second(&self) -> f64 {
        let samples = self.len();
        let first = self.history.iter().next();
        let last = self.history.iter().last();
        match (first, last) {
            (Some(first), Some(last)) if samples >= 2 => {
                let span = last.saturating_duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    (samples - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}
