// clickwatch/src/ingest.rs
//
// JSONL click import, for staging databases and offline replay of captured
// traffic. One ClickEvent per line:
//
//   {"link_id":"L1","source_address":"1.2.3.4","timestamp":"2024-07-22T12:00:00Z","is_bot":false}
//
// Blank lines are ignored; malformed lines are logged and skipped.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::events::ClickEvent;
use crate::state::TrafficStore;

const LOAD_BATCH: usize = 1_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub loaded:  usize,
    pub skipped: usize,
}

/// Returns the parsed clicks and the number of skipped lines.
pub fn parse_jsonl(content: &str) -> (Vec<ClickEvent>, usize) {
    let mut clicks  = Vec::new();
    let mut skipped = 0;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() { continue; }
        match serde_json::from_str::<ClickEvent>(line) {
            Ok(ev) => clicks.push(ev),
            Err(e) => {
                skipped += 1;
                warn!(line = idx + 1, "Parse error: {}", e);
            }
        }
    }
    (clicks, skipped)
}

pub async fn read_jsonl(path: &Path) -> Result<(Vec<ClickEvent>, usize)> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_jsonl(&content))
}

/// Append every valid click in `path` to the store's click log, in batches.
pub async fn load_file<S: TrafficStore>(store: &S, path: &Path) -> Result<LoadSummary> {
    let (clicks, skipped) = read_jsonl(path).await?;
    let mut loaded = 0;
    for batch in clicks.chunks(LOAD_BATCH) {
        loaded += store.append_clicks(batch).await?;
    }
    info!(loaded, skipped, path = %path.display(), "Click log loaded");
    Ok(LoadSummary { loaded, skipped })
}
