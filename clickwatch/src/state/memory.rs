// clickwatch/src/state/memory.rs
//
// In-process TrafficStore.
//
// DashMap = sharded concurrent HashMap. `entry()` holds the shard write lock
// for the duration of the closure, which makes the registry upsert atomic per
// key without any extra mutex. Append-only collections sit behind RwLock<Vec>.
//
// Cloning a MemoryStore shares the underlying state. Used for offline replay
// and as the test double for the scheduler and detectors; the `fail_*` switches
// make individual operations return errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use super::window::Window;
use super::{StoreError, TrafficStore, IP_FLOOD_EVENTS, TRAFFIC_SPIKES};
use crate::events::{ClickEvent, IpFloodEvent, SuspiciousSourceRecord, TrafficSpikeRecord};

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    clicks:     RwLock<Vec<ClickEvent>>,
    spikes:     RwLock<Vec<TrafficSpikeRecord>>,
    floods:     RwLock<Vec<IpFloodEvent>>,
    suspicious: DashMap<String, SuspiciousSourceRecord>,

    fail_queries: AtomicBool,
    fail_writes:  AtomicBool,
    fail_upserts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clicks(clicks: impl IntoIterator<Item = ClickEvent>) -> Self {
        let store = Self::new();
        store.inner.clicks.write().extend(clicks);
        store
    }

    // ── Fault injection ───────────────────────────────────────────────────────

    pub fn fail_queries(&self, on: bool) { self.inner.fail_queries.store(on, Ordering::SeqCst); }
    pub fn fail_writes(&self, on: bool)  { self.inner.fail_writes.store(on, Ordering::SeqCst); }
    pub fn fail_upserts(&self, on: bool) { self.inner.fail_upserts.store(on, Ordering::SeqCst); }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn spikes(&self) -> Vec<TrafficSpikeRecord> { self.inner.spikes.read().clone() }
    pub fn floods(&self) -> Vec<IpFloodEvent>       { self.inner.floods.read().clone() }
    pub fn n_clicks(&self) -> usize                 { self.inner.clicks.read().len() }
    pub fn n_suspicious(&self) -> usize             { self.inner.suspicious.len() }

    /// Latest click timestamp in the log, if any.
    pub fn latest_click(&self) -> Option<DateTime<Utc>> {
        self.inner.clicks.read().iter().map(|c| c.timestamp).max()
    }
}

impl TrafficStore for MemoryStore {
    async fn clicks_in(&self, window: Window) -> Result<Vec<ClickEvent>, StoreError> {
        if self.inner.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store: queries disabled".into()));
        }
        Ok(self.inner.clicks.read().iter()
            .filter(|c| window.contains(c.timestamp))
            .cloned()
            .collect())
    }

    async fn append_clicks(&self, clicks: &[ClickEvent]) -> Result<usize, StoreError> {
        self.inner.clicks.write().extend_from_slice(clicks);
        Ok(clicks.len())
    }

    async fn insert_spikes(&self, records: &[TrafficSpikeRecord]) -> Result<(), StoreError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write { collection: TRAFFIC_SPIKES, reason: "writes disabled".into() });
        }
        self.inner.spikes.write().extend_from_slice(records);
        Ok(())
    }

    async fn insert_floods(&self, events: &[IpFloodEvent]) -> Result<(), StoreError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write { collection: IP_FLOOD_EVENTS, reason: "writes disabled".into() });
        }
        self.inner.floods.write().extend_from_slice(events);
        Ok(())
    }

    async fn record_suspicious_source(
        &self,
        source_address: &str,
        detected_at: DateTime<Utc>,
        is_bot: bool,
    ) -> Result<SuspiciousSourceRecord, StoreError> {
        if self.inner.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Upsert {
                source_address: source_address.to_string(),
                reason: "upserts disabled".into(),
            });
        }
        let entry = self.inner.suspicious
            .entry(source_address.to_string())
            .and_modify(|rec| rec.repeat_offense(detected_at, is_bot))
            .or_insert_with(|| SuspiciousSourceRecord::first_offense(source_address, detected_at, is_bot));
        Ok(entry.value().clone())
    }

    async fn suspicious_source(&self, source_address: &str) -> Result<Option<SuspiciousSourceRecord>, StoreError> {
        Ok(self.inner.suspicious.get(source_address).map(|r| r.clone()))
    }

    // Scan newest insert first so the stable sort breaks `detected_at` ties
    // the same way the SQLite backend's `id DESC` does.
    async fn recent_spikes(&self, link_id: &str, limit: usize) -> Result<Vec<TrafficSpikeRecord>, StoreError> {
        let mut out: Vec<TrafficSpikeRecord> = self.inner.spikes.read().iter().rev()
            .filter(|s| s.link_id == link_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn recent_floods(&self, link_id: &str, limit: usize) -> Result<Vec<IpFloodEvent>, StoreError> {
        let mut out: Vec<IpFloodEvent> = self.inner.floods.read().iter().rev()
            .filter(|f| f.link_id == link_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        out.truncate(limit);
        Ok(out)
    }
}
