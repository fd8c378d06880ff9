// clickwatch/src/workers/spike.rs
//
// Traffic spike worker — link-level click volume.
//
// Group the window's clicks by link; every link with count ≥ threshold gets
// one TrafficSpikeRecord. All records of a pass go out as one batch.
// O(n) over clicks in the window.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::PassError;
use crate::events::{ClickEvent, DetectorKind, TrafficSpikeRecord};
use crate::state::window::{Window, SPIKE_WINDOW_SECS};
use crate::state::TrafficStore;

pub const SPIKE_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeConfig {
    pub window_secs: u64,
    pub threshold:   u64,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self { window_secs: SPIKE_WINDOW_SECS, threshold: SPIKE_THRESHOLD }
    }
}

impl SpikeConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }
}

#[derive(Debug, Clone)]
pub struct SpikeReport {
    pub window:         Window,
    pub clicks_scanned: usize,
    pub spikes:         Vec<TrafficSpikeRecord>,
}

/// Pure classification over an already-fetched set of clicks.
/// Clicks outside `window` are ignored. Output is sorted by link id.
pub fn detect(clicks: &[ClickEvent], window: Window, threshold: u64, now: DateTime<Utc>) -> Vec<TrafficSpikeRecord> {
    let mut per_link: HashMap<&str, u64> = HashMap::new();
    for click in clicks.iter().filter(|c| window.contains(c.timestamp)) {
        *per_link.entry(click.link_id.as_str()).or_default() += 1;
    }

    let mut spikes: Vec<TrafficSpikeRecord> = per_link
        .into_iter()
        .filter(|&(_, count)| count >= threshold)
        .map(|(link_id, count)| TrafficSpikeRecord {
            link_id:      link_id.to_string(),
            spike_count:  count,
            window_start: window.start,
            window_end:   window.end,
            detected_at:  now,
        })
        .collect();
    spikes.sort_by(|a, b| a.link_id.cmp(&b.link_id));
    spikes
}

/// One spike pass: query the window, classify, persist the batch.
pub async fn run<S: TrafficStore>(store: &S, config: &SpikeConfig, now: DateTime<Utc>) -> Result<SpikeReport, PassError> {
    let window = Window::ending_at(now, config.window());
    let failed = |source| PassError { detector: DetectorKind::Spike, window, source };

    let clicks = store.clicks_in(window).await.map_err(failed)?;
    let spikes = detect(&clicks, window, config.threshold, now);

    if spikes.is_empty() {
        info!(clicks = clicks.len(), %window, "No significant traffic spikes detected");
    } else {
        for s in &spikes {
            debug!(link_id = %s.link_id, spike_count = s.spike_count, "traffic spike");
        }
        store.insert_spikes(&spikes).await.map_err(failed)?;
        info!(spikes = spikes.len(), clicks = clicks.len(), %window, "Recorded traffic spikes");
    }

    Ok(SpikeReport { window, clicks_scanned: clicks.len(), spikes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 22, 12, 0, 0).unwrap()
    }

    fn burst(link: &str, n: usize, from: DateTime<Utc>) -> Vec<ClickEvent> {
        (0..n)
            .map(|i| ClickEvent::new(link, format!("10.0.{}.{}", i / 250, i % 250), from + Duration::milliseconds(i as i64 * 100)))
            .collect()
    }

    #[test]
    fn flags_link_at_or_above_threshold_only() {
        let w = Window::ending_at(now(), Duration::minutes(5));
        let mut clicks = burst("L1", 150, w.start);
        clicks.extend(burst("L2", 100, w.start));
        clicks.extend(burst("L3", 99, w.start));

        let spikes = detect(&clicks, w, 100, now());
        let got: Vec<(&str, u64)> = spikes.iter().map(|s| (s.link_id.as_str(), s.spike_count)).collect();
        assert_eq!(got, vec![("L1", 150), ("L2", 100)]);
        assert!(spikes.iter().all(|s| s.window_start == w.start && s.window_end == w.end && s.detected_at == now()));
    }

    #[test]
    fn clicks_outside_window_are_not_counted() {
        let w = Window::ending_at(now(), Duration::minutes(5));
        let mut clicks = burst("L1", 99, w.start);
        clicks.push(ClickEvent::new("L1", "1.1.1.1", now()));
        clicks.push(ClickEvent::new("L1", "1.1.1.1", w.start - Duration::seconds(1)));
        assert!(detect(&clicks, w, 100, now()).is_empty());
    }

    #[test]
    fn detection_is_repeatable() {
        let w = Window::ending_at(now(), Duration::minutes(5));
        let mut clicks = burst("L1", 120, w.start);
        clicks.extend(burst("L2", 130, w.start));
        assert_eq!(detect(&clicks, w, 100, now()), detect(&clicks, w, 100, now()));
    }

    #[tokio::test]
    async fn scenario_150_clicks_yields_one_spike() {
        let start = now() - Duration::minutes(4);
        let store = MemoryStore::with_clicks(burst("L1", 150, start));

        let report = run(&store, &SpikeConfig::default(), now()).await.unwrap();
        assert_eq!(report.clicks_scanned, 150);
        assert_eq!(report.spikes.len(), 1);
        assert_eq!(report.spikes[0].link_id, "L1");
        assert_eq!(report.spikes[0].spike_count, 150);
        assert_eq!(store.spikes(), report.spikes);
    }

    #[tokio::test]
    async fn quiet_window_writes_nothing() {
        let store = MemoryStore::with_clicks(burst("L1", 10, now() - Duration::minutes(1)));
        store.fail_writes(true);
        let report = run(&store, &SpikeConfig::default(), now()).await.unwrap();
        assert!(report.spikes.is_empty());
        assert!(store.spikes().is_empty());
    }

    #[tokio::test]
    async fn write_failure_fails_the_pass_without_partial_output() {
        let store = MemoryStore::with_clicks(burst("L1", 150, now() - Duration::minutes(2)));
        store.fail_writes(true);
        let err = run(&store, &SpikeConfig::default(), now()).await.unwrap_err();
        assert_eq!(err.detector, DetectorKind::Spike);
        assert_eq!(err.window.end, now());
        assert!(store.spikes().is_empty());
    }
}
