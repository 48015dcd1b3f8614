// One orchestrator tick: take the cluster lock, sweep stale temp files, advance the backfill
// (or do a current-month incremental catch-up), run discovery, rebuild leaderboards, update
// the cursor, release.
//
// The lock is held for the whole tick.  A fetch failure aborts the tick before apply() runs,
// so no state changes; a discovery failure is logged and the tick continues (leaderboards
// should still refresh from whatever state exists).  Marking a backfilled month complete is
// the last write of the tick, so discovery always sees the cursor as of the tick's start.

use crate::cursor::Cursor;
use crate::discover;
use crate::errors::PollError;
use crate::fsutil;
use crate::leaderboard;
use crate::lock::ClusterLock;
use crate::paths::Layout;
use crate::store;
use anyhow::Result;
use chrono::Duration;
use sacctlog::{jsonlog, parse_lines, Month, NormalizedRecord, RowOutcome, Sacct, JOB_FIELDS};
use serde_json::json;
use std::path::PathBuf;

pub struct TickConfig {
    pub root: PathBuf,
    pub cluster: String,
    pub backfill_start: String, // YYYY-MM-DD
    pub rate_per_min: u32,
    pub timeout_secs: u64,
    pub home_dir: PathBuf,
    pub expected_jobs: u64,
    pub min_jobs: u64,
    pub discover_limit: usize,
    /// Command run for accounting queries; "sacct" outside of tests.
    pub sacct_command: String,
}

pub fn run(cfg: &TickConfig) -> Result<(), PollError> {
    let layout = Layout::new(&cfg.root);
    let cluster = cfg.cluster.as_str();
    layout.ensure_cluster_dirs(cluster)?;

    let Some(_lock) = ClusterLock::acquire(&layout.lock_path(cluster))? else {
        return Err(PollError::LockHeld(cluster.to_string()));
    };

    // Now that no other poller can be mid-rename in this subtree, remove temp files a crashed
    // writer left behind.
    let swept = fsutil::sweep_tmp(&layout.cluster_dir(cluster))?
        + fsutil::sweep_tmp(&layout.leaderboards_dir())?;
    if swept > 0 {
        jsonlog::info(json!({
            "cluster": cluster, "phase": "recovery_sweep", "removed": swept,
        }));
    }

    let cursor_path = layout.cursor_path(cluster);
    let mut cursor = Cursor::load(&cursor_path)?;
    cursor.init_backfill_start(&cfg.backfill_start)?;
    cursor.save(&cursor_path)?;

    let now = sacctlog::now();
    let current = Month::containing(now);
    let mut sacct = Sacct::new(cluster, cfg.rate_per_min, cfg.timeout_secs);
    sacct.command = cfg.sacct_command.clone();

    let completed = match cursor.next_backfill_month(current)? {
        Some(month) => {
            // Historic month, one per tick.
            let start = month.first_day();
            let end = month.succ().first_day();
            jsonlog::info(json!({
                "cluster": cluster, "phase": "backfill", "month": month.to_string(),
                "start": start, "end": end,
            }));
            cursor.begin(month, "fetch");
            cursor.save(&cursor_path)?;
            let lines = sacct.fetch(&start, &end, None, JOB_FIELDS)?;
            cursor.begin(month, "apply");
            cursor.save(&cursor_path)?;
            let records = normalize(cluster, &lines)?;
            let stats = store::apply(
                &layout,
                cluster,
                &[month],
                &records,
                cfg.expected_jobs,
                crate::bloom::DEFAULT_P,
                now,
            )?;
            store::ensure_monthly_exists(&layout, cluster, month, now)?;
            jsonlog::info(json!({
                "cluster": cluster, "phase": "backfill", "month": month.to_string(),
                "jobs_seen": stats.jobs_seen, "jobs_new": stats.jobs_new,
            }));
            Some(month)
        }
        None => {
            // Caught up: incremental catch-up over the current month.
            let start = current.first_day();
            let end = (now + Duration::days(1)).format("%Y-%m-%d").to_string();
            jsonlog::info(json!({
                "cluster": cluster, "phase": "incremental", "start": start, "end": end,
            }));
            let lines = sacct.fetch(&start, &end, None, JOB_FIELDS)?;
            let records = normalize(cluster, &lines)?;
            let stats = store::apply(
                &layout,
                cluster,
                &[current],
                &records,
                cfg.expected_jobs,
                crate::bloom::DEFAULT_P,
                now,
            )?;
            store::ensure_monthly_exists(&layout, cluster, current, now)?;
            jsonlog::info(json!({
                "cluster": cluster, "phase": "incremental",
                "jobs_seen": stats.jobs_seen, "jobs_new": stats.jobs_new,
            }));
            None
        }
    };

    match discover::run(
        &layout,
        cluster,
        &mut sacct,
        &cursor,
        current,
        &cfg.home_dir,
        cfg.discover_limit,
        cfg.expected_jobs,
        crate::bloom::DEFAULT_P,
        now,
    ) {
        Ok(outcome) => jsonlog::info(json!({
            "cluster": cluster, "phase": "discovery",
            "candidates": outcome.candidates, "enqueued": outcome.enqueued,
            "processed": outcome.processed.len(), "pending": outcome.still_pending,
        })),
        Err(e) => jsonlog::error(json!({
            "cluster": cluster, "phase": "discovery", "error": e.to_string(),
        })),
    }

    let files = leaderboard::rebuild(&layout, cfg.min_jobs, now)?;
    jsonlog::info(json!({
        "cluster": cluster, "phase": "leaderboards", "files": files,
    }));

    // Cursor completion is the final write before the lock is released.  If anything above
    // failed, the month stays in_progress and the next tick re-runs it; the dedupe sets make
    // the repeat harmless.
    if let Some(month) = completed {
        cursor.mark_complete(month, current);
        cursor.save(&cursor_path)?;
        jsonlog::info(json!({
            "cluster": cluster, "phase": "cursor", "month": month.to_string(),
            "coldstart_done": cursor.coldstart_done,
        }));
    }
    Ok(())
}

fn normalize(cluster: &str, lines: &[String]) -> Result<Vec<NormalizedRecord>> {
    let mut records = vec![];
    for outcome in parse_lines(lines)? {
        match outcome {
            RowOutcome::Job(rec) => records.push(rec),
            RowOutcome::Step => {}
            RowOutcome::Malformed { line, reason } => jsonlog::warning(json!({
                "cluster": cluster, "phase": "parse", "error": reason, "row": line,
            })),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config(root: &std::path::Path) -> TickConfig {
        // Backfill starts at the previous month so a single tick finishes the cold start.
        let prev = Month::containing(sacctlog::now()).pred();
        TickConfig {
            root: root.to_path_buf(),
            cluster: "hammer".to_string(),
            backfill_start: prev.first_day(),
            rate_per_min: 600,
            timeout_secs: 30,
            home_dir: root.join("home"),
            expected_jobs: 10_000,
            min_jobs: 3,
            discover_limit: 5,
            sacct_command: "true".to_string(),
        }
    }

    #[test]
    fn test_tick_backfills_then_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home")).unwrap();
        let cfg = config(dir.path());
        let layout = Layout::new(&cfg.root);
        let current = Month::containing(sacctlog::now());
        let prev = current.pred();

        run(&cfg).unwrap();
        let cursor = Cursor::load(&layout.cursor_path("hammer")).unwrap();
        assert_eq!(cursor.last_complete_month, Some(prev.to_string()));
        assert!(cursor.coldstart_done);
        assert!(cursor.in_progress.is_none());
        // The empty month is visible and the leaderboards exist.
        assert!(layout.monthly_path("hammer", prev).exists());
        assert!(layout.leaderboard_path("alltime", "clock_hours").exists());

        // Second tick is incremental over the current month.
        run(&cfg).unwrap();
        assert!(layout.monthly_path("hammer", current).exists());
    }

    #[test]
    fn test_tick_exits_when_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home")).unwrap();
        let cfg = config(dir.path());
        let layout = Layout::new(&cfg.root);
        layout.ensure_cluster_dirs("hammer").unwrap();
        let held = ClusterLock::acquire(&layout.lock_path("hammer")).unwrap();
        assert!(held.is_some());
        match run(&cfg) {
            Err(e @ PollError::LockHeld(_)) => assert_eq!(e.exit_code(), 3),
            other => panic!("expected lock-held, got {:?}", other.err().map(|e| e.to_string())),
        }
        // The loser must not have created state files.
        assert!(!layout.cursor_path("hammer").exists());
    }

    #[test]
    fn test_fetch_failure_aborts_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("home")).unwrap();
        let mut cfg = config(dir.path());
        cfg.sacct_command = "/nonexistent/sacct".to_string();
        let layout = Layout::new(&cfg.root);
        match run(&cfg) {
            Err(e @ PollError::Fetch(_)) => assert_eq!(e.exit_code(), 1),
            other => panic!("expected fetch error, got {:?}", other.err().map(|e| e.to_string())),
        }
        // The in-progress marker survives for the retry; no rollup was written.
        let cursor = Cursor::load(&layout.cursor_path("hammer")).unwrap();
        assert!(cursor.in_progress.is_some());
        let prev = Month::containing(sacctlog::now()).pred();
        assert!(!layout.monthly_path("hammer", prev).exists());
    }
}
