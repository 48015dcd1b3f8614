// The per-cluster poll cursor: where backfill has gotten to, what is mid-flight, and whether
// the cold start has finished.  The month selection rules:
//
//   - an in_progress month is retried first (a previous tick died mid-month);
//   - otherwise the month after last_complete_month, or the backfill_start month when nothing
//     has completed yet;
//   - once the candidate reaches the current calendar month, backfill is done and ticks switch
//     to incremental current-month fetches.
//
// A closed month is never re-fetched by this state machine; only targeted user backfill
// revisits closed months, and the dedupe sets keep that idempotent.

use crate::fsutil::{self, LoadOutcome};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use sacctlog::Month;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgress {
    pub month: String,
    pub phase: String, // "fetch" or "apply", recorded for post-crash forensics
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cursor {
    /// "YYYY-MM-DD"; set on first tick from the CLI flag and sticky thereafter.
    pub backfill_start: Option<String>,
    pub last_complete_month: Option<String>,
    pub in_progress: Option<InProgress>,
    #[serde(default)]
    pub coldstart_done: bool,
}

impl Cursor {
    /// Load the cursor, quarantining a corrupt file (the backfill then restarts, which the
    /// dedupe sets make harmless).

    pub fn load(path: &Path) -> Result<Cursor> {
        Ok(match fsutil::load_json::<Cursor>(path)? {
            LoadOutcome::Valid(c) => c,
            LoadOutcome::Missing | LoadOutcome::Quarantined => Cursor::default(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::write_json(path, self)
    }

    /// Initialize backfill_start from the CLI flag if this is the first tick ever.

    pub fn init_backfill_start(&mut self, start: &str) -> Result<()> {
        if self.backfill_start.is_none() {
            NaiveDate::parse_from_str(start, "%Y-%m-%d")
                .with_context(|| format!("invalid backfill start date: {start}"))?;
            self.backfill_start = Some(start.to_string());
        }
        Ok(())
    }

    pub fn backfill_start_month(&self) -> Result<Month> {
        let Some(ref s) = self.backfill_start else {
            bail!("cursor has no backfill_start");
        };
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid backfill_start in cursor: {s}"))?;
        Ok(Month::of_date(date))
    }

    /// The next historic month to process, or None when caught up (the candidate would be the
    /// current month, which belongs to the incremental path).

    pub fn next_backfill_month(&self, current: Month) -> Result<Option<Month>> {
        if let Some(ref ip) = self.in_progress {
            let m = ip.month.parse::<Month>()?;
            if m < current {
                return Ok(Some(m));
            }
            // An in_progress marker for the current month is stale (month turned over under a
            // dead poller); fall through to the normal selection.
        }
        let candidate = match self.last_complete_month {
            Some(ref s) => s.parse::<Month>()?.succ(),
            None => self.backfill_start_month()?,
        };
        if candidate >= current {
            Ok(None)
        } else {
            Ok(Some(candidate))
        }
    }

    pub fn begin(&mut self, month: Month, phase: &str) {
        self.in_progress = Some(InProgress {
            month: month.to_string(),
            phase: phase.to_string(),
        });
    }

    pub fn mark_complete(&mut self, month: Month, current: Month) {
        self.last_complete_month = Some(month.to_string());
        self.in_progress = None;
        if month == current.pred() {
            self.coldstart_done = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(start: &str, last: Option<&str>) -> Cursor {
        Cursor {
            backfill_start: Some(start.to_string()),
            last_complete_month: last.map(|s| s.to_string()),
            in_progress: None,
            coldstart_done: false,
        }
    }

    #[test]
    fn test_next_month_from_scratch() {
        let c = cursor("2025-01-15", None);
        let next = c.next_backfill_month(Month::new(2025, 8)).unwrap();
        assert_eq!(next, Some(Month::new(2025, 1)));
    }

    #[test]
    fn test_next_month_resumes_after_last_complete() {
        let c = cursor("2025-01-01", Some("2025-05"));
        let next = c.next_backfill_month(Month::new(2025, 8)).unwrap();
        assert_eq!(next, Some(Month::new(2025, 6)));
    }

    #[test]
    fn test_caught_up() {
        let c = cursor("2025-01-01", Some("2025-07"));
        assert_eq!(c.next_backfill_month(Month::new(2025, 8)).unwrap(), None);
    }

    #[test]
    fn test_in_progress_retried_first() {
        let mut c = cursor("2025-01-01", Some("2025-05"));
        c.begin(Month::new(2025, 6), "fetch");
        let next = c.next_backfill_month(Month::new(2025, 8)).unwrap();
        assert_eq!(next, Some(Month::new(2025, 6)));
    }

    #[test]
    fn test_stale_current_month_in_progress_ignored() {
        let mut c = cursor("2025-01-01", Some("2025-07"));
        c.begin(Month::new(2025, 8), "fetch");
        assert_eq!(c.next_backfill_month(Month::new(2025, 8)).unwrap(), None);
    }

    #[test]
    fn test_mark_complete_sets_coldstart_done() {
        let mut c = cursor("2025-01-01", Some("2025-05"));
        let current = Month::new(2025, 8);
        c.mark_complete(Month::new(2025, 6), current);
        assert!(!c.coldstart_done);
        c.mark_complete(Month::new(2025, 7), current);
        assert!(c.coldstart_done);
        assert_eq!(c.last_complete_month.as_deref(), Some("2025-07"));
        assert!(c.in_progress.is_none());
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poll_cursor.json");
        assert!(Cursor::load(&path).unwrap().backfill_start.is_none());
        let mut c = cursor("2025-01-01", Some("2025-06"));
        c.coldstart_done = false;
        c.save(&path).unwrap();
        let loaded = Cursor::load(&path).unwrap();
        assert_eq!(loaded.last_complete_month.as_deref(), Some("2025-06"));
        // Corruption quarantines and restarts clean.
        std::fs::write(&path, b"]]]").unwrap();
        assert!(Cursor::load(&path).unwrap().backfill_start.is_none());
        assert!(dir.path().join("poll_cursor.json.bad").exists());
    }

    #[test]
    fn test_init_backfill_start() {
        let mut c = Cursor::default();
        assert!(c.init_backfill_start("not-a-date").is_err());
        c.init_backfill_start("2024-03-01").unwrap();
        assert_eq!(c.backfill_start_month().unwrap(), Month::new(2024, 3));
        // Sticky once set.
        c.init_backfill_start("2020-01-01").unwrap();
        assert_eq!(c.backfill_start_month().unwrap(), Month::new(2024, 3));
    }
}
