// clickwatch/src/state/sqlite.rs
//
// Durable TrafficStore on SQLite via sqlx.
//
// Timestamps are stored as INTEGER milliseconds since the Unix epoch so that
// window predicates are plain integer comparisons.
//
// The registry upsert is a single statement:
//
//   INSERT .. VALUES (addr, now, now, bot, 1)
//   ON CONFLICT(source_address) DO UPDATE SET last = now, bot = bot, count = count + 1
//
// so concurrent workers sharing one database never lose an increment and
// `first_detected_ms` is only ever written on insert.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::window::Window;
use super::{
    Connector, StoreError, TrafficStore, CLICKS, IP_FLOOD_EVENTS, SUSPICIOUS_SOURCES, TRAFFIC_SPIKES,
};
use crate::events::{ClickEvent, IpFloodEvent, SuspiciousSourceRecord, TrafficSpikeRecord};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS clicks (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    link_id        TEXT    NOT NULL,
    source_address TEXT,
    timestamp_ms   INTEGER NOT NULL,
    is_bot         BOOLEAN NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_clicks_timestamp ON clicks (timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_clicks_source_link ON clicks (source_address, link_id);

CREATE TABLE IF NOT EXISTS traffic_spikes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    link_id         TEXT    NOT NULL,
    spike_count     INTEGER NOT NULL,
    window_start_ms INTEGER NOT NULL,
    window_end_ms   INTEGER NOT NULL,
    detected_at_ms  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_traffic_spikes_link ON traffic_spikes (link_id, detected_at_ms);

CREATE TABLE IF NOT EXISTS ip_flood_events (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    source_address    TEXT    NOT NULL,
    link_id           TEXT    NOT NULL,
    click_count       INTEGER NOT NULL,
    clicks_per_minute REAL    NOT NULL,
    window_start_ms   INTEGER NOT NULL,
    window_end_ms     INTEGER NOT NULL,
    detected_at_ms    INTEGER NOT NULL,
    is_bot            BOOLEAN NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_ip_flood_events_link ON ip_flood_events (link_id, detected_at_ms);
CREATE INDEX IF NOT EXISTS idx_ip_flood_events_source ON ip_flood_events (source_address);

CREATE TABLE IF NOT EXISTS suspicious_sources (
    source_address    TEXT    PRIMARY KEY,
    first_detected_ms INTEGER NOT NULL,
    last_detected_ms  INTEGER NOT NULL,
    is_bot            BOOLEAN NOT NULL DEFAULT 0,
    flood_count       INTEGER NOT NULL
);
"#;

const UPSERT_SUSPICIOUS_SQL: &str = r#"
INSERT INTO suspicious_sources (source_address, first_detected_ms, last_detected_ms, is_bot, flood_count)
VALUES (?1, ?2, ?2, ?3, 1)
ON CONFLICT (source_address) DO UPDATE SET
    last_detected_ms = excluded.last_detected_ms,
    is_bot           = excluded.is_bot,
    flood_count      = suspicious_sources.flood_count + 1
RETURNING source_address, first_detected_ms, last_detected_ms, is_bot, flood_count
"#;

// ── Connector ─────────────────────────────────────────────────────────────────

pub struct SqliteConnector {
    url:             String,
    max_connections: u32,
}

impl SqliteConnector {
    pub fn new(url: impl Into<String>, max_connections: u32) -> Self {
        Self { url: url.into(), max_connections }
    }
}

impl Connector for SqliteConnector {
    type Store = SqliteStore;

    async fn connect(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::connect(&self.url, self.max_connections).await
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the pool, verify the database answers, and make sure the tables exist.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(unavailable)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        let store = Self { pool };
        store.ping().await?;
        store.ensure_schema().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(unavailable)?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await.map_err(unavailable)?;
        Ok(())
    }
}

impl TrafficStore for SqliteStore {
    async fn clicks_in(&self, window: Window) -> Result<Vec<ClickEvent>, StoreError> {
        let rows: Vec<ClickRow> = sqlx::query_as(
            "SELECT link_id, source_address, timestamp_ms, is_bot FROM clicks \
             WHERE timestamp_ms >= ? AND timestamp_ms < ?",
        )
        .bind(window.start.timestamp_millis())
        .bind(window.end.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        debug!(rows = rows.len(), %window, "clicks fetched");
        rows.into_iter().map(ClickRow::into_event).collect()
    }

    async fn append_clicks(&self, clicks: &[ClickEvent]) -> Result<usize, StoreError> {
        if clicks.is_empty() { return Ok(0); }
        let mut tx = self.pool.begin().await.map_err(|e| write_failed(CLICKS, e))?;
        for c in clicks {
            sqlx::query("INSERT INTO clicks (link_id, source_address, timestamp_ms, is_bot) VALUES (?, ?, ?, ?)")
                .bind(&c.link_id)
                .bind(c.source_address.as_deref())
                .bind(c.timestamp.timestamp_millis())
                .bind(c.is_bot)
                .execute(&mut *tx)
                .await
                .map_err(|e| write_failed(CLICKS, e))?;
        }
        tx.commit().await.map_err(|e| write_failed(CLICKS, e))?;
        Ok(clicks.len())
    }

    async fn insert_spikes(&self, records: &[TrafficSpikeRecord]) -> Result<(), StoreError> {
        if records.is_empty() { return Ok(()); }
        let mut tx = self.pool.begin().await.map_err(|e| write_failed(TRAFFIC_SPIKES, e))?;
        for r in records {
            sqlx::query(
                "INSERT INTO traffic_spikes (link_id, spike_count, window_start_ms, window_end_ms, detected_at_ms) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&r.link_id)
            .bind(r.spike_count as i64)
            .bind(r.window_start.timestamp_millis())
            .bind(r.window_end.timestamp_millis())
            .bind(r.detected_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| write_failed(TRAFFIC_SPIKES, e))?;
        }
        tx.commit().await.map_err(|e| write_failed(TRAFFIC_SPIKES, e))
    }

    async fn insert_floods(&self, events: &[IpFloodEvent]) -> Result<(), StoreError> {
        if events.is_empty() { return Ok(()); }
        let mut tx = self.pool.begin().await.map_err(|e| write_failed(IP_FLOOD_EVENTS, e))?;
        for ev in events {
            sqlx::query(
                "INSERT INTO ip_flood_events (source_address, link_id, click_count, clicks_per_minute, \
                 window_start_ms, window_end_ms, detected_at_ms, is_bot) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&ev.source_address)
            .bind(&ev.link_id)
            .bind(ev.click_count as i64)
            .bind(ev.clicks_per_minute)
            .bind(ev.window_start.timestamp_millis())
            .bind(ev.window_end.timestamp_millis())
            .bind(ev.detected_at.timestamp_millis())
            .bind(ev.is_bot)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_failed(IP_FLOOD_EVENTS, e))?;
        }
        tx.commit().await.map_err(|e| write_failed(IP_FLOOD_EVENTS, e))
    }

    async fn record_suspicious_source(
        &self,
        source_address: &str,
        detected_at: DateTime<Utc>,
        is_bot: bool,
    ) -> Result<SuspiciousSourceRecord, StoreError> {
        let row: SuspiciousRow = sqlx::query_as(UPSERT_SUSPICIOUS_SQL)
            .bind(source_address)
            .bind(detected_at.timestamp_millis())
            .bind(is_bot)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Upsert {
                source_address: source_address.to_string(),
                reason: e.to_string(),
            })?;
        row.into_record()
    }

    async fn suspicious_source(&self, source_address: &str) -> Result<Option<SuspiciousSourceRecord>, StoreError> {
        let row: Option<SuspiciousRow> = sqlx::query_as(
            "SELECT source_address, first_detected_ms, last_detected_ms, is_bot, flood_count \
             FROM suspicious_sources WHERE source_address = ?",
        )
        .bind(source_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.map(SuspiciousRow::into_record).transpose()
    }

    async fn recent_spikes(&self, link_id: &str, limit: usize) -> Result<Vec<TrafficSpikeRecord>, StoreError> {
        let rows: Vec<SpikeRow> = sqlx::query_as(
            "SELECT link_id, spike_count, window_start_ms, window_end_ms, detected_at_ms FROM traffic_spikes \
             WHERE link_id = ? ORDER BY detected_at_ms DESC, id DESC LIMIT ?",
        )
        .bind(link_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.into_iter().map(SpikeRow::into_record).collect()
    }

    async fn recent_floods(&self, link_id: &str, limit: usize) -> Result<Vec<IpFloodEvent>, StoreError> {
        let rows: Vec<FloodRow> = sqlx::query_as(
            "SELECT source_address, link_id, click_count, clicks_per_minute, window_start_ms, window_end_ms, \
             detected_at_ms, is_bot FROM ip_flood_events \
             WHERE link_id = ? ORDER BY detected_at_ms DESC, id DESC LIMIT ?",
        )
        .bind(link_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.into_iter().map(FloodRow::into_record).collect()
    }
}

// ── Rows ──────────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct ClickRow {
    link_id:        String,
    source_address: Option<String>,
    timestamp_ms:   i64,
    is_bot:         bool,
}

impl ClickRow {
    fn into_event(self) -> Result<ClickEvent, StoreError> {
        Ok(ClickEvent {
            link_id:        self.link_id,
            source_address: self.source_address,
            timestamp:      from_millis(CLICKS, self.timestamp_ms)?,
            is_bot:         self.is_bot,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SpikeRow {
    link_id:         String,
    spike_count:     i64,
    window_start_ms: i64,
    window_end_ms:   i64,
    detected_at_ms:  i64,
}

impl SpikeRow {
    fn into_record(self) -> Result<TrafficSpikeRecord, StoreError> {
        Ok(TrafficSpikeRecord {
            link_id:      self.link_id,
            spike_count:  self.spike_count.max(0) as u64,
            window_start: from_millis(TRAFFIC_SPIKES, self.window_start_ms)?,
            window_end:   from_millis(TRAFFIC_SPIKES, self.window_end_ms)?,
            detected_at:  from_millis(TRAFFIC_SPIKES, self.detected_at_ms)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FloodRow {
    source_address:    String,
    link_id:           String,
    click_count:       i64,
    clicks_per_minute: f64,
    window_start_ms:   i64,
    window_end_ms:     i64,
    detected_at_ms:    i64,
    is_bot:            bool,
}

impl FloodRow {
    fn into_record(self) -> Result<IpFloodEvent, StoreError> {
        Ok(IpFloodEvent {
            source_address:    self.source_address,
            link_id:           self.link_id,
            click_count:       self.click_count.max(0) as u64,
            clicks_per_minute: self.clicks_per_minute,
            window_start:      from_millis(IP_FLOOD_EVENTS, self.window_start_ms)?,
            window_end:        from_millis(IP_FLOOD_EVENTS, self.window_end_ms)?,
            detected_at:       from_millis(IP_FLOOD_EVENTS, self.detected_at_ms)?,
            is_bot:            self.is_bot,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SuspiciousRow {
    source_address:    String,
    first_detected_ms: i64,
    last_detected_ms:  i64,
    is_bot:            bool,
    flood_count:       i64,
}

impl SuspiciousRow {
    fn into_record(self) -> Result<SuspiciousSourceRecord, StoreError> {
        Ok(SuspiciousSourceRecord {
            source_address: self.source_address,
            first_detected: from_millis(SUSPICIOUS_SOURCES, self.first_detected_ms)?,
            last_detected:  from_millis(SUSPICIOUS_SOURCES, self.last_detected_ms)?,
            is_bot:         self.is_bot,
            flood_count:    self.flood_count.max(0) as u64,
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn from_millis(collection: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StoreError::Decode {
        collection,
        reason: format!("timestamp out of range: {ms}"),
    })
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn write_failed(collection: &'static str, e: sqlx::Error) -> StoreError {
    StoreError::Write { collection, reason: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 22, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn window_query_is_half_open() {
        let store = memory_store().await;
        let w = Window::ending_at(t0(), Duration::minutes(5));
        store.append_clicks(&[
            ClickEvent::new("L1", "1.2.3.4", w.start),
            ClickEvent::new("L1", "1.2.3.4", t0() - Duration::milliseconds(1)).bot(),
            ClickEvent::new("L1", "1.2.3.4", t0()),
            ClickEvent { link_id: "L2".into(), source_address: None, timestamp: t0() - Duration::seconds(10), is_bot: false },
        ]).await.unwrap();

        let got = store.clicks_in(w).await.unwrap();
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|c| w.contains(c.timestamp)));
        assert_eq!(got.iter().filter(|c| c.is_bot).count(), 1);
        assert_eq!(got.iter().filter(|c| c.source_address.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn upsert_creates_then_accumulates() {
        let store = memory_store().await;
        let t1 = t0() + Duration::minutes(1);
        let t2 = t0() + Duration::minutes(2);

        let rec = store.record_suspicious_source("1.2.3.4", t0(), false).await.unwrap();
        assert_eq!(rec, SuspiciousSourceRecord::first_offense("1.2.3.4", t0(), false));

        store.record_suspicious_source("1.2.3.4", t1, true).await.unwrap();
        let rec = store.record_suspicious_source("1.2.3.4", t2, false).await.unwrap();
        assert_eq!(rec.flood_count, 3);
        assert_eq!(rec.first_detected, t0());
        assert_eq!(rec.last_detected, t2);
        assert!(!rec.is_bot);

        let stored = store.suspicious_source("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(stored, rec);
        assert!(store.suspicious_source("4.3.2.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn floods_round_trip_newest_first() {
        let store = memory_store().await;
        let w = Window::ending_at(t0(), Duration::minutes(3));
        let mk = |detected_at, count| IpFloodEvent {
            source_address: "1.2.3.4".into(),
            link_id: "L2".into(),
            click_count: count,
            clicks_per_minute: 17.5,
            window_start: w.start,
            window_end: w.end,
            detected_at,
            is_bot: true,
        };
        store.insert_floods(&[mk(t0(), 35), mk(t0() + Duration::minutes(1), 40)]).await.unwrap();

        let recent = store.recent_floods("L2", 100).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].click_count, 40);
        assert_eq!(recent[1], mk(t0(), 35));
    }

    #[tokio::test]
    async fn equal_detection_times_list_latest_insert_first() {
        let store = memory_store().await;
        let w = Window::ending_at(t0(), Duration::minutes(5));
        let mk = |count| TrafficSpikeRecord {
            link_id: "L1".into(),
            spike_count: count,
            window_start: w.start,
            window_end: w.end,
            detected_at: t0(),
        };
        store.insert_spikes(&[mk(100), mk(101)]).await.unwrap();
        store.insert_spikes(&[mk(102)]).await.unwrap();

        let counts: Vec<u64> = store.recent_spikes("L1", 50).await.unwrap().iter().map(|s| s.spike_count).collect();
        assert_eq!(counts, vec![102, 101, 100]);
    }

    #[tokio::test]
    async fn empty_batches_are_noops() {
        let store = memory_store().await;
        store.insert_spikes(&[]).await.unwrap();
        store.insert_floods(&[]).await.unwrap();
        assert!(store.recent_spikes("L1", 50).await.unwrap().is_empty());
    }
}
