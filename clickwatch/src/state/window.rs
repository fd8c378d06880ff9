// clickwatch/src/state/window.rs
//
// Half-open detection windows.
//
// Every pass looks back a fixed span from "now": [now - span, now).
// A click stamped exactly at `end` belongs to the next pass, never this one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Default window spans ──────────────────────────────────────────────────────

pub const SPIKE_WINDOW_SECS: u64 = 5 * 60;
pub const FLOOD_WINDOW_SECS: u64 = 3 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end:   DateTime<Utc>,
}

impl Window {
    /// The window of length `span` that closes at `now`.
    pub fn ending_at(now: DateTime<Utc>, span: Duration) -> Self {
        Self { start: now - span, end: now }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_ends_at_now() {
        let now = Utc.with_ymd_and_hms(2024, 7, 22, 12, 0, 0).unwrap();
        let w = Window::ending_at(now, Duration::minutes(5));
        assert_eq!(w.end, now);
        assert_eq!(w.start, Utc.with_ymd_and_hms(2024, 7, 22, 11, 55, 0).unwrap());
        assert_eq!(w.end - w.start, Duration::minutes(5));
    }

    #[test]
    fn window_is_half_open() {
        let now = Utc.with_ymd_and_hms(2024, 7, 22, 12, 0, 0).unwrap();
        let w = Window::ending_at(now, Duration::minutes(3));
        assert!(w.contains(w.start));
        assert!(w.contains(now - Duration::milliseconds(1)));
        assert!(!w.contains(now));
        assert!(!w.contains(w.start - Duration::milliseconds(1)));
    }
}
