//! Delivery counters, mirrored to the `metrics` facade

pub mod rate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;

pub use rate::DeliveryRate;

use crate::pipeline::{Lane, ResultKind};

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    delivered: [AtomicU64; 4],
    reclaimed: AtomicU64,
    stale_events: AtomicU64,
    stalls: AtomicU64,
    flushes: AtomicU64,
    abandoned: AtomicU64,
    device_errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub enqueued: u64,
    pub dispatched: u64,
    pub notifies: u64,
    pub buffers: u64,
    pub partial_results: u64,
    pub final_results: u64,
    pub reclaimed: u64,
    pub stale_events: u64,
    pub stalls: u64,
    pub flushes: u64,
    pub abandoned: u64,
    pub device_errors: u64,
    /// Final results per second over the rate window.
    pub completion_rate: f64,
}

pub struct Telemetry {
    counters: CachePadded<Counters>,
    rate: Mutex<DeliveryRate>,
    export: bool,
}

impl Telemetry {
    pub fn new(rate_window: usize, export: bool) -> Self {
        Self {
            counters: CachePadded::new(Counters::default()),
            rate: Mutex::new(DeliveryRate::new(rate_window)),
            export,
        }
    }

    pub fn record_enqueue(&self) {
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if self.export {
            counter!("reconciler_requests_enqueued_total").increment(1);
        }
    }

    pub fn record_dispatch(&self) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if self.export {
            counter!("reconciler_requests_dispatched_total").increment(1);
        }
    }

    pub fn record_delivery(&self, kind: ResultKind) {
        self.counters.delivered[kind.index()].fetch_add(1, Ordering::Relaxed);
        if kind == ResultKind::FinalMetadata {
            self.rate.lock().record(Instant::now());
        }
        if self.export {
            counter!("reconciler_results_delivered_total", "kind" => kind.name()).increment(1);
        }
    }

    pub fn record_reclaim(&self) {
        self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
        if self.export {
            counter!("reconciler_requests_reclaimed_total").increment(1);
        }
    }

    pub fn record_stale(&self, kind: ResultKind) {
        self.counters.stale_events.fetch_add(1, Ordering::Relaxed);
        if self.export {
            counter!("reconciler_stale_events_total", "kind" => kind.name()).increment(1);
        }
    }

    pub fn record_stall(&self, lane: Lane) {
        self.counters.stalls.fetch_add(1, Ordering::Relaxed);
        if self.export {
            counter!("reconciler_stalls_total", "lane" => lane.to_string()).increment(1);
        }
    }

    pub fn record_flush(&self, abandoned: usize) {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .abandoned
            .fetch_add(abandoned as u64, Ordering::Relaxed);
        self.rate.lock().clear();
        if self.export {
            counter!("reconciler_flushes_total").increment(1);
            counter!("reconciler_requests_abandoned_total").increment(abandoned as u64);
        }
    }

    pub fn record_device_error(&self) {
        self.counters.device_errors.fetch_add(1, Ordering::Relaxed);
        if self.export {
            counter!("reconciler_device_errors_total").increment(1);
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        let delivered = |kind: ResultKind| c.delivered[kind.index()].load(Ordering::Relaxed);
        TelemetrySnapshot {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            notifies: delivered(ResultKind::Notify),
            buffers: delivered(ResultKind::BufferReady),
            partial_results: delivered(ResultKind::PartialMetadata),
            final_results: delivered(ResultKind::FinalMetadata),
            reclaimed: c.reclaimed.load(Ordering::Relaxed),
            stale_events: c.stale_events.load(Ordering::Relaxed),
            stalls: c.stalls.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            device_errors: c.device_errors.load(Ordering::Relaxed),
            completion_rate: self.rate.lock().per_second(),
        }
    }
}
