// clickwatch/src/lib.rs
//
// clickwatch — traffic anomaly detection for a link shortener.
//
// A polling worker that scans rolling windows of the click log, records links
// with abnormal click spikes, records single addresses flooding a link, and
// keeps a cumulative registry of repeat offenders.

pub mod config;
pub mod engine;
pub mod events;
pub mod ingest;
pub mod metrics;
pub mod state;
pub mod workers;
