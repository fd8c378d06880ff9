// clickwatch/src/events.rs
//
// Domain types flowing through clickwatch.
//
//   ClickEvent              — input, produced by the redirect service, never mutated here
//   TrafficSpikeRecord      — output, one per spiking link per pass
//   IpFloodEvent            — output, one per flooding (address, link) pair per pass
//   SuspiciousSourceRecord  — mutable registry entry keyed by source address
//
// All timestamps are UTC with millisecond resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Input ─────────────────────────────────────────────────────────────────────

/// One recorded redirect. `is_bot` is attached upstream by the enrichment
/// pipeline; `source_address` may be missing when the edge could not resolve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub link_id: String,
    #[serde(default)]
    pub source_address: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_bot: bool,
}

impl ClickEvent {
    pub fn new(link_id: impl Into<String>, source_address: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            link_id: link_id.into(),
            source_address: Some(source_address.into()),
            timestamp,
            is_bot: false,
        }
    }

    pub fn bot(mut self) -> Self {
        self.is_bot = true;
        self
    }
}

// ── Detection output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSpikeRecord {
    pub link_id: String,
    pub spike_count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpFloodEvent {
    pub source_address: String,
    pub link_id: String,
    pub click_count: u64,
    pub clicks_per_minute: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub is_bot: bool,
}

/// Cumulative flood history of one address. Only ever changed through
/// `TrafficStore::record_suspicious_source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousSourceRecord {
    pub source_address: String,
    pub first_detected: DateTime<Utc>,
    pub last_detected: DateTime<Utc>,
    pub is_bot: bool,
    pub flood_count: u64,
}

impl SuspiciousSourceRecord {
    /// Registry entry for an address seen flooding for the first time.
    pub fn first_offense(source_address: &str, detected_at: DateTime<Utc>, is_bot: bool) -> Self {
        Self {
            source_address: source_address.to_string(),
            first_detected: detected_at,
            last_detected: detected_at,
            is_bot,
            flood_count: 1,
        }
    }

    /// Fold one more detection into an existing entry. `first_detected` is kept.
    pub fn repeat_offense(&mut self, detected_at: DateTime<Utc>, is_bot: bool) {
        self.last_detected = detected_at;
        self.is_bot = is_bot;
        self.flood_count += 1;
    }
}

// ── Detector kinds ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Spike, // link-level click volume
    Flood, // per-address click volume on one link
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spike => write!(f, "traffic_spike"),
            Self::Flood => write!(f, "ip_flood"),
        }
    }
}
