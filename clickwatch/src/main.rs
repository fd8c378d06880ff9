// clickwatch/src/main.rs
//
// clickwatch — click traffic anomaly detection worker
//
// Five operational modes:
//   run     — the background worker: connect (retrying forever), then detect every pass interval
//   once    — a single detection cycle against the database, detections printed as JSONL
//   load    — import a JSONL click file into the database's click log
//   replay  — run one cycle over a JSONL click file in memory, database untouched
//   report  — recent spikes / floods for a link, or the registry entry of an address
//
// Usage:
//   clickwatch --database-url sqlite:///var/lib/clickwatch/clicks.db
//   clickwatch --mode load   --path captured.jsonl
//   clickwatch --mode replay --path captured.jsonl --at 2024-07-22T12:00:00Z
//   clickwatch --mode report --link L1

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clickwatch::config::{WorkerConfig, PASS_INTERVAL_SECS, RETRY_INTERVAL_SECS};
use clickwatch::engine::cycle::{CycleReport, CycleRunner};
use clickwatch::engine::retry::{retry, RetryPolicy};
use clickwatch::engine::scheduler::Scheduler;
use clickwatch::events::{IpFloodEvent, SuspiciousSourceRecord, TrafficSpikeRecord};
use clickwatch::ingest;
use clickwatch::metrics::WorkerMetrics;
use clickwatch::state::memory::MemoryStore;
use clickwatch::state::sqlite::{SqliteConnector, SqliteStore};
use clickwatch::state::window::{FLOOD_WINDOW_SECS, SPIKE_WINDOW_SECS};
use clickwatch::state::{TrafficStore, RECENT_FLOODS_LIMIT, RECENT_SPIKES_LIMIT};
use clickwatch::workers::flood::{FloodConfig, FLOOD_THRESHOLD};
use clickwatch::workers::spike::{SpikeConfig, SPIKE_THRESHOLD};

/// One-shot modes give up after this many connection attempts instead of
/// waiting forever like the worker.
const ONE_SHOT_CONNECT_ATTEMPTS: u32 = 3;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "clickwatch",
    about   = "Traffic spike and IP flood detection over a link shortener's click log",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "run")]
    mode: Mode,

    #[arg(long, env = "CLICKWATCH_DATABASE_URL", default_value = "sqlite://clickwatch.db",
          help = "Data store connection string")]
    database_url: String,

    #[arg(long, env = "CLICKWATCH_MAX_CONNECTIONS", default_value_t = 4)]
    max_connections: u32,

    #[arg(long, env = "CLICKWATCH_SPIKE_WINDOW_SECS", default_value_t = SPIKE_WINDOW_SECS)]
    spike_window_secs: u64,

    #[arg(long, env = "CLICKWATCH_SPIKE_THRESHOLD", default_value_t = SPIKE_THRESHOLD,
          help = "Clicks per link within the spike window that count as a spike")]
    spike_threshold: u64,

    #[arg(long, env = "CLICKWATCH_FLOOD_WINDOW_SECS", default_value_t = FLOOD_WINDOW_SECS)]
    flood_window_secs: u64,

    #[arg(long, env = "CLICKWATCH_FLOOD_THRESHOLD", default_value_t = FLOOD_THRESHOLD,
          help = "Clicks per (address, link) within the flood window that count as a flood")]
    flood_threshold: u64,

    #[arg(long, env = "CLICKWATCH_PASS_INTERVAL_SECS", default_value_t = PASS_INTERVAL_SECS)]
    pass_interval_secs: u64,

    #[arg(long, env = "CLICKWATCH_RETRY_INTERVAL_SECS", default_value_t = RETRY_INTERVAL_SECS)]
    retry_interval_secs: u64,

    #[arg(long, env = "CLICKWATCH_AUDIT_DIR", help = "Mirror detections as JSONL into this directory")]
    audit_dir: Option<PathBuf>,

    #[arg(long, help = "JSONL click file (load/replay modes)")]
    path: Option<PathBuf>,

    #[arg(long, help = "Replay: windows close at this RFC 3339 instant (default: 1 ms after the last click)")]
    at: Option<DateTime<Utc>>,

    #[arg(long, help = "Report: link id to show recent spikes and floods for")]
    link: Option<String>,

    #[arg(long, help = "Report: source address to look up in the suspicious-source registry")]
    address: Option<String>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Run,    // background worker loop
    Once,   // one cycle, then exit
    Load,   // import JSONL clicks
    Replay, // one in-memory cycle over a JSONL file
    Report, // query stored detections
}

impl Cli {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            spike: SpikeConfig { window_secs: self.spike_window_secs, threshold: self.spike_threshold },
            flood: FloodConfig { window_secs: self.flood_window_secs, threshold: self.flood_threshold },
            pass_interval_secs:  self.pass_interval_secs,
            retry_interval_secs: self.retry_interval_secs,
            audit_dir:           self.audit_dir.clone(),
        }
    }

    fn require_path(&self) -> Result<&PathBuf> {
        self.path.as_ref().context("--path is required in this mode")
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutputLine<'a> {
    TrafficSpike(&'a TrafficSpikeRecord),
    IpFlood(&'a IpFloodEvent),
    SuspiciousSource(&'a SuspiciousSourceRecord),
}

fn emit(line: OutputLine<'_>) -> Result<()> {
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn print_cycle(report: &CycleReport) -> Result<()> {
    if let Some(spike) = &report.spike {
        for s in &spike.spikes { emit(OutputLine::TrafficSpike(s))?; }
    }
    if let Some(flood) = &report.flood {
        for f in &flood.floods { emit(OutputLine::IpFlood(f))?; }
    }
    Ok(())
}

// ── Modes ─────────────────────────────────────────────────────────────────────

async fn connect_one_shot(cli: &Cli, config: &WorkerConfig) -> Result<SqliteStore> {
    let policy = RetryPolicy::bounded(config.retry_interval(), ONE_SHOT_CONNECT_ATTEMPTS);
    let store = retry(policy, |attempt| {
        info!(attempt, target = %cli.database_url, "Connecting to data store");
        SqliteStore::connect(&cli.database_url, cli.max_connections)
    })
    .await?;
    Ok(store)
}

async fn run_worker(cli: &Cli, config: &WorkerConfig, runner: CycleRunner) -> Result<()> {
    let connector = SqliteConnector::new(cli.database_url.clone(), cli.max_connections);
    let scheduler = Scheduler::new(connector, runner, config);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; finishing the current cycle");
            tx.send(true).ok();
        }
    });

    scheduler.run(rx).await;
    Ok(())
}

async fn run_once(cli: &Cli, config: &WorkerConfig, runner: &CycleRunner) -> Result<()> {
    let store = connect_one_shot(cli, config).await?;
    let report = runner.run_cycle(&store).await;
    print_cycle(&report)
}

async fn run_load(cli: &Cli, config: &WorkerConfig) -> Result<()> {
    let path  = cli.require_path()?;
    let store = connect_one_shot(cli, config).await?;
    let summary = ingest::load_file(&store, path).await?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

async fn run_replay(cli: &Cli, runner: &CycleRunner) -> Result<()> {
    let path = cli.require_path()?;
    let (clicks, skipped) = ingest::read_jsonl(path).await?;
    let store = MemoryStore::with_clicks(clicks);

    let now = match cli.at {
        Some(at) => at,
        None => store.latest_click().context("replay file holds no valid clicks")? + Duration::milliseconds(1),
    }
    .trunc_subsecs(3);

    info!(clicks = store.n_clicks(), skipped, at = %now, "Replaying click log");
    let report = runner.run_cycle_at(&store, now).await;
    print_cycle(&report)?;
    let flooders: BTreeSet<&str> = report.flood.iter()
        .flat_map(|f| f.floods.iter().map(|e| e.source_address.as_str()))
        .collect();
    for addr in flooders {
        if let Some(rec) = store.suspicious_source(addr).await? {
            emit(OutputLine::SuspiciousSource(&rec))?;
        }
    }
    Ok(())
}

async fn run_report(cli: &Cli, config: &WorkerConfig) -> Result<()> {
    if cli.link.is_none() && cli.address.is_none() {
        bail!("report mode needs --link and/or --address");
    }
    let store = connect_one_shot(cli, config).await?;

    if let Some(link) = &cli.link {
        for s in store.recent_spikes(link, RECENT_SPIKES_LIMIT).await? {
            emit(OutputLine::TrafficSpike(&s))?;
        }
        for f in store.recent_floods(link, RECENT_FLOODS_LIMIT).await? {
            emit(OutputLine::IpFlood(&f))?;
        }
    }
    if let Some(addr) = &cli.address {
        match store.suspicious_source(addr).await? {
            Some(rec) => emit(OutputLine::SuspiciousSource(&rec))?,
            None => info!(source_address = %addr, "Address has no suspicious-source record"),
        }
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("clickwatch=info".parse()?))
        .compact().init();

    let cli    = Cli::parse();
    let config = cli.worker_config();
    config.validate()?;
    info!(config = %serde_json::to_string(&config)?, "Starting clickwatch");

    let runner = CycleRunner::new(&config, WorkerMetrics::new())?;

    match cli.mode {
        Mode::Run    => run_worker(&cli, &config, runner).await,
        Mode::Once   => run_once(&cli, &config, &runner).await,
        Mode::Load   => run_load(&cli, &config).await,
        Mode::Replay => run_replay(&cli, &runner).await,
        Mode::Report => run_report(&cli, &config).await,
    }
}
