// Cross-cluster leaderboards: one JSON file per (window, metric) pair under leaderboards/.
//
// Values are summed over every cluster's monthly rollups for the window's months, which by the
// reconstruction invariant equals the sum over user aggregates for the alltime window.  The
// rolling windows are month-granular: a month is in the window when it is at or after the
// month containing now-30d (resp. now-365d).  The 30d window is widened to the two most
// recent data months when the cutoff leaves fewer, so the table is never empty right after a
// month boundary.
//
// Policy: users in config/optout.txt never appear; users with fewer than min_jobs jobs in the
// window are omitted (their aggregates are still stored).  Rows sort descending by value with
// ascending-username tie-break and carry contiguous 1-based ranks.

use crate::fsutil;
use crate::paths::Layout;
use crate::store::{MonthlyRollup, UserMonth};
use anyhow::Result;
use chrono::Duration;
use sacctlog::{rfc3339_utc, Month, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Alltime,
    Rolling30d,
    Rolling365d,
}

pub const WINDOWS: [Window; 3] = [Window::Alltime, Window::Rolling30d, Window::Rolling365d];

impl Window {
    pub fn as_str(self) -> &'static str {
        match self {
            Window::Alltime => "alltime",
            Window::Rolling30d => "rolling-30d",
            Window::Rolling365d => "rolling-365d",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    ClockHours,
    ElapsedHours,
    GpuClockHours,
    GpuElapsedHours,
    FailedJobs,
}

pub const METRICS: [Metric; 5] = [
    Metric::ClockHours,
    Metric::ElapsedHours,
    Metric::GpuClockHours,
    Metric::GpuElapsedHours,
    Metric::FailedJobs,
];

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::ClockHours => "clock_hours",
            Metric::ElapsedHours => "elapsed_hours",
            Metric::GpuClockHours => "gpu_clock_hours",
            Metric::GpuElapsedHours => "gpu_elapsed_hours",
            Metric::FailedJobs => "failed_jobs",
        }
    }

    fn value(self, u: &UserMonth) -> f64 {
        match self {
            Metric::ClockHours => u.clock_hours,
            Metric::ElapsedHours => u.elapsed_hours,
            Metric::GpuClockHours => u.gpu_clock_hours,
            Metric::GpuElapsedHours => u.gpu_elapsed_hours,
            Metric::FailedJobs => u.failed_jobs as f64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub user: String,
    pub value: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Leaderboard {
    pub asof: String,
    pub window: String,
    pub metric: String,
    pub rows: Vec<LeaderboardRow>,
}

/// Rebuild all fifteen leaderboard files.  Returns the number written.

pub fn rebuild(layout: &Layout, min_jobs: u64, now: Timestamp) -> Result<usize> {
    let all_months = layout.all_months();
    let clusters = layout.clusters();
    let optout = load_optout(layout);
    let asof = rfc3339_utc(now);
    let mut written = 0;

    for window in WINDOWS {
        let months = window_months(&all_months, window, now);
        let totals = window_totals(layout, &clusters, &months);
        for metric in METRICS {
            let rows = rank(&totals, metric, min_jobs, &optout);
            let doc = Leaderboard {
                asof: asof.clone(),
                window: window.as_str().to_string(),
                metric: metric.as_str().to_string(),
                rows,
            };
            fsutil::write_json(
                &layout.leaderboard_path(window.as_str(), metric.as_str()),
                &doc,
            )?;
            written += 1;
        }
    }
    Ok(written)
}

fn window_months(all: &[Month], window: Window, now: Timestamp) -> Vec<Month> {
    match window {
        Window::Alltime => all.to_vec(),
        Window::Rolling365d => {
            let cutoff = Month::containing(now - Duration::days(365));
            all.iter().copied().filter(|m| *m >= cutoff).collect()
        }
        Window::Rolling30d => {
            let cutoff = Month::containing(now - Duration::days(30));
            let selected: Vec<Month> = all.iter().copied().filter(|m| *m >= cutoff).collect();
            if selected.len() < 2 && all.len() >= 2 {
                all[all.len() - 2..].to_vec()
            } else {
                selected
            }
        }
    }
}

/// Per-user accumulators over the given months, summed across all clusters.

fn window_totals(
    layout: &Layout,
    clusters: &[String],
    months: &[Month],
) -> BTreeMap<String, UserMonth> {
    let mut totals: BTreeMap<String, UserMonth> = BTreeMap::new();
    for cluster in clusters {
        for &month in months {
            // The merge reads other clusters' files without holding their locks, so it must
            // never rename or quarantine anything here; an unreadable file just drops out of
            // this rebuild and its owner deals with it.
            let path = layout.monthly_path(cluster, month);
            let Some(doc) = read_monthly_readonly(&path) else {
                continue;
            };
            for row in doc.users {
                totals
                    .entry(row.username.clone())
                    .or_insert_with(|| UserMonth::new(&row.username))
                    .absorb(&row);
            }
        }
    }
    totals
}

fn rank(
    totals: &BTreeMap<String, UserMonth>,
    metric: Metric,
    min_jobs: u64,
    optout: &HashSet<String>,
) -> Vec<LeaderboardRow> {
    let mut entries: Vec<(&String, f64)> = totals
        .iter()
        .filter(|(user, t)| t.jobs >= min_jobs && !optout.contains(*user))
        .map(|(user, t)| (user, metric.value(t)))
        .filter(|(_, v)| *v != 0.0)
        .collect();
    entries.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    entries
        .into_iter()
        .enumerate()
        .map(|(i, (user, value))| LeaderboardRow {
            rank: (i + 1) as u32,
            user: user.clone(),
            value,
        })
        .collect()
}

fn read_monthly_readonly(path: &std::path::Path) -> Option<MonthlyRollup> {
    serde_json::from_slice(&fs::read(path).ok()?).ok()
}

fn load_optout(layout: &Layout) -> HashSet<String> {
    let mut out = HashSet::new();
    if let Ok(text) = fs::read_to_string(layout.optout_path()) {
        for line in text.lines() {
            let name = line.trim().to_lowercase();
            if !name.is_empty() && !name.starts_with('#') {
                out.insert(name);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use std::path::Path;

    fn write_monthly(root: &Path, cluster: &str, month: Month, users: Vec<UserMonth>) {
        let layout = Layout::new(root);
        let dir = layout.monthly_dir(cluster);
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(layout.leaderboards_dir()).unwrap();
        let doc = MonthlyRollup {
            asof: "2025-08-01T00:00:00Z".to_string(),
            month: month.to_string(),
            users,
        };
        fsutil::write_json(&layout.monthly_path(cluster, month), &doc).unwrap();
    }

    fn user(name: &str, jobs: u64, clock_hours: f64) -> UserMonth {
        UserMonth {
            jobs,
            clock_hours,
            ..UserMonth::new(name)
        }
    }

    fn read_board(layout: &Layout, window: &str, metric: &str) -> Leaderboard {
        serde_json::from_slice(&fs::read(layout.leaderboard_path(window, metric)).unwrap()).unwrap()
    }

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 8, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_ranking_with_tie_break() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let aug = Month::new(2025, 8);
        write_monthly(
            dir.path(),
            "hammer",
            aug,
            vec![
                user("abel", 5, 12001.2),
                user("bob", 5, 12001.2),
                user("cara", 5, 12345.6),
            ],
        );
        assert_eq!(rebuild(&layout, 3, now()).unwrap(), 15);
        let board = read_board(&layout, "alltime", "clock_hours");
        assert_eq!(board.window, "alltime");
        assert_eq!(board.metric, "clock_hours");
        let got: Vec<(u32, &str, f64)> = board
            .rows
            .iter()
            .map(|r| (r.rank, r.user.as_str(), r.value))
            .collect();
        assert_eq!(
            got,
            vec![
                (1, "cara", 12345.6),
                (2, "abel", 12001.2),
                (3, "bob", 12001.2)
            ]
        );
    }

    #[test]
    fn test_cross_cluster_sum() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let aug = Month::new(2025, 8);
        write_monthly(dir.path(), "hammer", aug, vec![user("alice", 3, 10.0)]);
        write_monthly(dir.path(), "anvil", aug, vec![user("alice", 3, 5.0)]);
        rebuild(&layout, 3, now()).unwrap();
        let board = read_board(&layout, "alltime", "clock_hours");
        assert_eq!(board.rows.len(), 1);
        assert_eq!(board.rows[0].value, 15.0);
    }

    #[test]
    fn test_rolling_window_edges() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        // One rollup thirteen months back, one last month.
        write_monthly(
            dir.path(),
            "hammer",
            Month::new(2024, 7),
            vec![user("gwen", 10, 100.0)],
        );
        write_monthly(
            dir.path(),
            "hammer",
            Month::new(2025, 7),
            vec![user("gwen", 10, 7.0)],
        );
        rebuild(&layout, 3, now()).unwrap();

        let y365 = read_board(&layout, "rolling-365d", "clock_hours");
        assert_eq!(y365.rows[0].value, 7.0); // last month in, M-13 out

        // The 30d cutoff selects only 2025-07, which is widened to the two most recent data
        // months; last month's values must be present either way.
        let d30 = read_board(&layout, "rolling-30d", "clock_hours");
        assert_eq!(d30.rows.len(), 1);
        assert!(d30.rows[0].value >= 7.0);

        let all = read_board(&layout, "alltime", "clock_hours");
        assert_eq!(all.rows[0].value, 107.0);
    }

    #[test]
    fn test_min_jobs_and_optout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let aug = Month::new(2025, 8);
        write_monthly(
            dir.path(),
            "hammer",
            aug,
            vec![
                user("dabbler", 2, 50.0),
                user("ghost", 20, 500.0),
                user("worker", 20, 100.0),
            ],
        );
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(layout.optout_path(), "# comment\nGhost\n").unwrap();
        rebuild(&layout, 3, now()).unwrap();
        let board = read_board(&layout, "alltime", "clock_hours");
        let names: Vec<&str> = board.rows.iter().map(|r| r.user.as_str()).collect();
        assert_eq!(names, vec!["worker"]);
    }

    #[test]
    fn test_zero_valued_users_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let aug = Month::new(2025, 8);
        // CPU-only user: present in clock_hours, absent from the GPU boards.
        write_monthly(dir.path(), "hammer", aug, vec![user("cpuonly", 5, 40.0)]);
        rebuild(&layout, 3, now()).unwrap();
        assert_eq!(read_board(&layout, "alltime", "clock_hours").rows.len(), 1);
        assert!(read_board(&layout, "alltime", "gpu_clock_hours").rows.is_empty());
        assert!(read_board(&layout, "alltime", "failed_jobs").rows.is_empty());
    }
}
