// clickwatch/src/engine/audit.rs
//
// Optional JSONL mirror of every detection, written after the store accepted
// the batch. One file per output collection:
//
//   traffic_spikes.jsonl   — TrafficSpikeRecord per line
//   ip_flood_events.jsonl  — IpFloodEvent per line
//
// Point log shippers or an analyst's `jq` at these files.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::events::{IpFloodEvent, TrafficSpikeRecord};
use crate::state::{IP_FLOOD_EVENTS, TRAFFIC_SPIKES};

pub struct AuditLog {
    out: PathBuf,
}

impl AuditLog {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)?;
        Ok(Self { out })
    }

    pub async fn record_spikes(&self, spikes: &[TrafficSpikeRecord]) -> Result<()> {
        self.append(TRAFFIC_SPIKES, spikes).await
    }

    pub async fn record_floods(&self, floods: &[IpFloodEvent]) -> Result<()> {
        self.append(IP_FLOOD_EVENTS, floods).await
    }

    async fn append<T: Serialize>(&self, collection: &str, records: &[T]) -> Result<()> {
        if records.is_empty() { return Ok(()); }
        let mut content = String::new();
        for r in records {
            content.push_str(&serde_json::to_string(r)?);
            content.push('\n');
        }
        let mut f = OpenOptions::new().create(true).append(true)
            .open(self.out.join(format!("{collection}.jsonl"))).await?;
        f.write_all(content.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("clickwatch-audit-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let audit = AuditLog::new(&dir).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 7, 22, 12, 0, 0).unwrap();
        let spike = TrafficSpikeRecord {
            link_id: "L1".into(),
            spike_count: 150,
            window_start: now - Duration::minutes(5),
            window_end: now,
            detected_at: now,
        };

        audit.record_spikes(&[spike.clone()]).await.unwrap();
        audit.record_spikes(&[spike.clone()]).await.unwrap();
        audit.record_floods(&[]).await.unwrap();

        let content = tokio::fs::read_to_string(dir.join("traffic_spikes.jsonl")).await.unwrap();
        let lines: Vec<TrafficSpikeRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![spike.clone(), spike]);
        assert!(!dir.join("ip_flood_events.jsonl").exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
