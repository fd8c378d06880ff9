pub mod flood;
pub mod spike;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::events::DetectorKind;
use crate::state::window::Window;
use crate::state::{StoreError, TrafficStore};
use flood::{FloodConfig, FloodReport};
use spike::{SpikeConfig, SpikeReport};

/// A detector pass that was abandoned for this cycle.
#[derive(Debug, Error)]
#[error("{detector} pass over {window} failed: {source}")]
pub struct PassError {
    pub detector: DetectorKind,
    pub window:   Window,
    pub source:   StoreError,
}

/// Run both detectors for one cycle. They write disjoint collections, so they
/// run concurrently; each result is reported independently.
pub async fn run_all<S: TrafficStore>(
    store: &S,
    spike_cfg: &SpikeConfig,
    flood_cfg: &FloodConfig,
    now: DateTime<Utc>,
) -> (Result<SpikeReport, PassError>, Result<FloodReport, PassError>) {
    tokio::join!(
        spike::run(store, spike_cfg, now),
        flood::run(store, flood_cfg, now),
    )
}
