// clickwatch/src/workers/flood.rs
//
// IP flood worker — one source address hammering one link.
//
// Partition the window's clicks by (source_address, link_id). Per partition:
//   click_count        = |partition|
//   first / last click = min / max timestamp
//   is_bot             = any click in the partition bot-tagged
//   clicks_per_minute  = click_count / max(1, (last - first) in minutes)
//
// The one-minute floor keeps single clicks and sub-minute bursts from dividing
// by zero or reporting absurd rates.
//
// Qualifying partitions are persisted as one batch. Only after that batch is
// written does each flood event bump the suspicious-source registry. A failed
// registry update is logged and counted; the flood event stays.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::PassError;
use crate::events::{ClickEvent, DetectorKind, IpFloodEvent};
use crate::state::window::{Window, FLOOD_WINDOW_SECS};
use crate::state::TrafficStore;

pub const FLOOD_THRESHOLD: u64 = 30;

const MS_PER_MINUTE: f64 = 60_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    pub window_secs: u64,
    pub threshold:   u64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self { window_secs: FLOOD_WINDOW_SECS, threshold: FLOOD_THRESHOLD }
    }
}

impl FloodConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs as i64)
    }
}

#[derive(Debug, Clone)]
pub struct FloodReport {
    pub window:            Window,
    pub clicks_scanned:    usize,
    pub floods:            Vec<IpFloodEvent>,
    pub registry_failures: usize,
}

struct Partition {
    clicks:      u64,
    first_click: DateTime<Utc>,
    last_click:  DateTime<Utc>,
    is_bot:      bool,
}

impl Partition {
    fn new(click: &ClickEvent) -> Self {
        Self { clicks: 1, first_click: click.timestamp, last_click: click.timestamp, is_bot: click.is_bot }
    }

    fn absorb(&mut self, click: &ClickEvent) {
        self.clicks += 1;
        self.first_click = self.first_click.min(click.timestamp);
        self.last_click  = self.last_click.max(click.timestamp);
        self.is_bot     |= click.is_bot;
    }
}

/// Clicks per minute with the elapsed time floored at one minute.
pub fn clicks_per_minute(click_count: u64, first_click: DateTime<Utc>, last_click: DateTime<Utc>) -> f64 {
    let elapsed_minutes = ((last_click - first_click).num_milliseconds() as f64 / MS_PER_MINUTE).max(1.0);
    click_count as f64 / elapsed_minutes
}

/// Pure classification over an already-fetched set of clicks. Clicks outside
/// `window` or without a source address are ignored. Output is sorted by
/// (source_address, link_id).
pub fn detect(clicks: &[ClickEvent], window: Window, threshold: u64, now: DateTime<Utc>) -> Vec<IpFloodEvent> {
    let mut partitions: HashMap<(&str, &str), Partition> = HashMap::new();
    for click in clicks.iter().filter(|c| window.contains(c.timestamp)) {
        let Some(addr) = click.source_address.as_deref() else { continue };
        partitions
            .entry((addr, click.link_id.as_str()))
            .and_modify(|p| p.absorb(click))
            .or_insert_with(|| Partition::new(click));
    }

    let mut floods: Vec<IpFloodEvent> = partitions
        .into_iter()
        .filter(|(_, p)| p.clicks >= threshold)
        .map(|((addr, link_id), p)| IpFloodEvent {
            source_address:    addr.to_string(),
            link_id:           link_id.to_string(),
            click_count:       p.clicks,
            clicks_per_minute: clicks_per_minute(p.clicks, p.first_click, p.last_click),
            window_start:      window.start,
            window_end:        window.end,
            detected_at:       now,
            is_bot:            p.is_bot,
        })
        .collect();
    floods.sort_by(|a, b| (&a.source_address, &a.link_id).cmp(&(&b.source_address, &b.link_id)));
    floods
}

/// One flood pass: query, classify, persist, then fold into the registry.
pub async fn run<S: TrafficStore>(store: &S, config: &FloodConfig, now: DateTime<Utc>) -> Result<FloodReport, PassError> {
    let window = Window::ending_at(now, config.window());
    let failed = |source| PassError { detector: DetectorKind::Flood, window, source };

    let clicks = store.clicks_in(window).await.map_err(failed)?;
    let floods = detect(&clicks, window, config.threshold, now);

    if floods.is_empty() {
        info!(clicks = clicks.len(), %window, "No IP flood activity detected");
        return Ok(FloodReport { window, clicks_scanned: clicks.len(), floods, registry_failures: 0 });
    }

    store.insert_floods(&floods).await.map_err(failed)?;
    let registry_failures = update_registry(store, &floods).await;

    info!(
        floods = floods.len(),
        clicks = clicks.len(),
        registry_failures,
        %window,
        "Recorded IP flood events"
    );
    Ok(FloodReport { window, clicks_scanned: clicks.len(), floods, registry_failures })
}

async fn update_registry<S: TrafficStore>(store: &S, floods: &[IpFloodEvent]) -> usize {
    let mut failures = 0;
    for ev in floods {
        match store.record_suspicious_source(&ev.source_address, ev.detected_at, ev.is_bot).await {
            Ok(rec) => debug!(
                source_address = %rec.source_address,
                flood_count = rec.flood_count,
                is_bot = rec.is_bot,
                "suspicious source updated"
            ),
            Err(e) => {
                failures += 1;
                warn!(
                    source_address = %ev.source_address,
                    link_id = %ev.link_id,
                    error = %e,
                    "Registry update failed; flood event kept"
                );
            }
        }
    }
    failures
}
