// clickwatch/src/state/mod.rs
//
// Storage seam. The worker only ever talks to a `TrafficStore`:
//
//   clicks             — read-only input log, queried by half-open window
//   traffic_spikes     — append-only detections
//   ip_flood_events    — append-only detections
//   suspicious_sources — keyed registry, mutated only by an atomic
//                        accumulate-or-create (`record_suspicious_source`)
//
// Backends:
//   SqliteStore  — durable, one `INSERT .. ON CONFLICT DO UPDATE` per upsert
//   MemoryStore  — in-process, DashMap entry lock per key, fault injection

pub mod memory;
pub mod sqlite;
pub mod window;

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::events::{ClickEvent, IpFloodEvent, SuspiciousSourceRecord, TrafficSpikeRecord};
use window::Window;

pub const CLICKS:             &str = "clicks";
pub const TRAFFIC_SPIKES:     &str = "traffic_spikes";
pub const IP_FLOOD_EVENTS:    &str = "ip_flood_events";
pub const SUSPICIOUS_SOURCES: &str = "suspicious_sources";

/// Default page sizes for the per-link history queries.
pub const RECENT_SPIKES_LIMIT: usize = 50;
pub const RECENT_FLOODS_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data store unavailable: {0}")]
    Unavailable(String),

    #[error("batch write to {collection} failed: {reason}")]
    Write { collection: &'static str, reason: String },

    #[error("registry upsert for {source_address} failed: {reason}")]
    Upsert { source_address: String, reason: String },

    #[error("corrupt row in {collection}: {reason}")]
    Decode { collection: &'static str, reason: String },
}

pub trait TrafficStore: Send + Sync + 'static {
    /// Clicks with `timestamp ∈ [window.start, window.end)`. No side effects.
    fn clicks_in(&self, window: Window)
        -> impl Future<Output = Result<Vec<ClickEvent>, StoreError>> + Send;

    /// Append raw clicks to the input log. Used by the loader, never by detectors.
    fn append_clicks(&self, clicks: &[ClickEvent])
        -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// All-or-nothing batch insert.
    fn insert_spikes(&self, records: &[TrafficSpikeRecord])
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All-or-nothing batch insert.
    fn insert_floods(&self, events: &[IpFloodEvent])
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomic accumulate-or-create keyed by `source_address`. Returns the
    /// record as it stands after the update.
    fn record_suspicious_source(&self, source_address: &str, detected_at: DateTime<Utc>, is_bot: bool)
        -> impl Future<Output = Result<SuspiciousSourceRecord, StoreError>> + Send;

    fn suspicious_source(&self, source_address: &str)
        -> impl Future<Output = Result<Option<SuspiciousSourceRecord>, StoreError>> + Send;

    /// Newest first.
    fn recent_spikes(&self, link_id: &str, limit: usize)
        -> impl Future<Output = Result<Vec<TrafficSpikeRecord>, StoreError>> + Send;

    /// Newest first.
    fn recent_floods(&self, link_id: &str, limit: usize)
        -> impl Future<Output = Result<Vec<IpFloodEvent>, StoreError>> + Send;
}

/// Opens a store. The scheduler retries `connect` until it succeeds.
pub trait Connector: Send + Sync + 'static {
    type Store: TrafficStore;

    fn connect(&self) -> impl Future<Output = Result<Self::Store, StoreError>> + Send;

    /// Human-readable target for logs (no credentials).
    fn target(&self) -> String;
}
