// clickwatch/src/metrics.rs
//
// Operational counters for the worker, logged after every cycle.
//
//   cycles              — detection cycles completed (both passes attempted)
//   failed_passes       — passes abandoned because of a store error
//   spikes_recorded     — TrafficSpikeRecords written
//   floods_recorded     — IpFloodEvents written
//   registry_failures   — flood events whose registry upsert failed
//   connect_attempts    — store connection attempts, successful or not

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Default)]
pub struct WorkerMetrics {
    pub cycles:            AtomicU64,
    pub failed_passes:     AtomicU64,
    pub spikes_recorded:   AtomicU64,
    pub floods_recorded:   AtomicU64,
    pub registry_failures: AtomicU64,
    pub connect_attempts:  AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_pass(&self) {
        self.failed_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spikes(&self, n: usize) {
        self.spikes_recorded.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_floods(&self, n: usize, registry_failures: usize) {
        self.floods_recorded.fetch_add(n as u64, Ordering::Relaxed);
        self.registry_failures.fetch_add(registry_failures as u64, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles:            self.cycles.load(Ordering::Relaxed),
            failed_passes:     self.failed_passes.load(Ordering::Relaxed),
            spikes_recorded:   self.spikes_recorded.load(Ordering::Relaxed),
            floods_recorded:   self.floods_recorded.load(Ordering::Relaxed),
            registry_failures: self.registry_failures.load(Ordering::Relaxed),
            connect_attempts:  self.connect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles:            u64,
    pub failed_passes:     u64,
    pub spikes_recorded:   u64,
    pub floods_recorded:   u64,
    pub registry_failures: u64,
    pub connect_attempts:  u64,
}
