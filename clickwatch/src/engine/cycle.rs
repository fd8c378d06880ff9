// clickwatch/src/engine/cycle.rs
//
// One detection cycle: spike pass + flood pass over windows ending at the same
// instant. A failed pass is logged with its detector and window and dropped;
// the other pass and the next cycle are unaffected.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, SubsecRound, Utc};
use tracing::{error, info, warn};

use super::audit::AuditLog;
use crate::config::WorkerConfig;
use crate::metrics::WorkerMetrics;
use crate::state::TrafficStore;
use crate::workers::flood::{FloodConfig, FloodReport};
use crate::workers::spike::{SpikeConfig, SpikeReport};
use crate::workers::{self, PassError};

#[derive(Debug, Default)]
pub struct CycleReport {
    pub spike: Option<SpikeReport>,
    pub flood: Option<FloodReport>,
}

pub struct CycleRunner {
    spike:   SpikeConfig,
    flood:   FloodConfig,
    metrics: Arc<WorkerMetrics>,
    audit:   Option<AuditLog>,
}

impl CycleRunner {
    pub fn new(config: &WorkerConfig, metrics: Arc<WorkerMetrics>) -> Result<Self> {
        let audit = match &config.audit_dir {
            Some(dir) => Some(AuditLog::new(dir)?),
            None => None,
        };
        Ok(Self { spike: config.spike.clone(), flood: config.flood.clone(), metrics, audit })
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Run a cycle with windows closing at the current instant (millisecond precision).
    pub async fn run_cycle<S: TrafficStore>(&self, store: &S) -> CycleReport {
        self.run_cycle_at(store, Utc::now().trunc_subsecs(3)).await
    }

    pub async fn run_cycle_at<S: TrafficStore>(&self, store: &S, now: DateTime<Utc>) -> CycleReport {
        let (spike, flood) = workers::run_all(store, &self.spike, &self.flood, now).await;
        let mut report = CycleReport::default();

        match spike {
            Ok(r) => {
                self.metrics.record_spikes(r.spikes.len());
                if let Some(audit) = &self.audit {
                    if let Err(e) = audit.record_spikes(&r.spikes).await {
                        warn!(error = %e, "Audit log write failed");
                    }
                }
                report.spike = Some(r);
            }
            Err(e) => self.pass_failed(&e),
        }

        match flood {
            Ok(r) => {
                self.metrics.record_floods(r.floods.len(), r.registry_failures);
                if let Some(audit) = &self.audit {
                    if let Err(e) = audit.record_floods(&r.floods).await {
                        warn!(error = %e, "Audit log write failed");
                    }
                }
                report.flood = Some(r);
            }
            Err(e) => self.pass_failed(&e),
        }

        self.metrics.record_cycle();
        let m = self.metrics.snapshot();
        info!(
            cycles = m.cycles,
            failed_passes = m.failed_passes,
            spikes_total = m.spikes_recorded,
            floods_total = m.floods_recorded,
            registry_failures_total = m.registry_failures,
            "Detection cycle complete"
        );
        report
    }

    fn pass_failed(&self, e: &PassError) {
        self.metrics.record_failed_pass();
        error!(
            detector = %e.detector,
            window = %e.window,
            error = %e.source,
            "Detector pass failed; skipping until next cycle"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ClickEvent;
    use crate::state::memory::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 22, 12, 0, 0).unwrap()
    }

    fn runner() -> CycleRunner {
        CycleRunner::new(&WorkerConfig::default(), WorkerMetrics::new()).unwrap()
    }

    #[tokio::test]
    async fn quiet_cycle_writes_nothing() {
        let store = MemoryStore::with_clicks(
            (0..20).map(|i| ClickEvent::new("L1", "1.2.3.4", now() - Duration::seconds(i + 1))),
        );
        let runner = runner();
        let report = runner.run_cycle_at(&store, now()).await;

        assert!(report.spike.unwrap().spikes.is_empty());
        assert!(report.flood.unwrap().floods.is_empty());
        assert!(store.spikes().is_empty());
        assert!(store.floods().is_empty());
        assert_eq!(store.n_suspicious(), 0);
        assert_eq!(runner.metrics().snapshot().failed_passes, 0);
        assert_eq!(runner.metrics().snapshot().cycles, 1);
    }

    #[tokio::test]
    async fn one_cycle_can_flag_both_detectors() {
        // 120 clicks from one address in 2 minutes: a spike on L1 and a flood from 1.2.3.4
        let store = MemoryStore::with_clicks(
            (0..120).map(|i| ClickEvent::new("L1", "1.2.3.4", now() - Duration::seconds(i + 1))),
        );
        let runner = runner();
        let report = runner.run_cycle_at(&store, now()).await;

        assert_eq!(report.spike.unwrap().spikes.len(), 1);
        let flood = report.flood.unwrap();
        assert_eq!(flood.floods.len(), 1);
        assert_eq!(flood.floods[0].click_count, 120);

        let m = runner.metrics().snapshot();
        assert_eq!((m.spikes_recorded, m.floods_recorded), (1, 1));
    }

    #[tokio::test]
    async fn failed_passes_are_counted_not_raised() {
        let store = MemoryStore::new();
        store.fail_queries(true);
        let runner = runner();
        let report = runner.run_cycle_at(&store, now()).await;

        assert!(report.spike.is_none());
        assert!(report.flood.is_none());
        assert_eq!(runner.metrics().snapshot().failed_passes, 2);
        assert_eq!(runner.metrics().snapshot().cycles, 1);
    }
}
