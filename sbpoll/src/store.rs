// Monthly rollups, per-user all-time aggregates, and the apply() path that folds normalized
// records into both.
//
// The monthly rollup is the source of truth: for every (cluster, user) the aggregate totals
// must equal the sum over all monthly rollups naming that user (the reconstruction invariant).
// apply() maintains the aggregates incrementally via per-user deltas; whenever a month's files
// had to be quarantined the affected users are instead rebuilt from the monthly files outright.
//
// Persistence order within one apply: monthly rollups, then user aggregates, then dedupe sets,
// each via temp+rename.  Writing the dedupe set last means a crash mid-apply makes the next
// tick re-observe the same JobIDs; the dedupe/rollup quarantine rules below keep that from
// double counting.  Months with no new jobs are not rewritten, so re-applying the same input
// leaves every file byte-identical.

use crate::bloom::{BloomError, DedupeSet};
use crate::fsutil::{self, LoadOutcome};
use crate::paths::Layout;
use anyhow::{Context, Result};
use sacctlog::{jsonlog, rfc3339_utc, Month, NormalizedRecord, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const SCHEMA_VERSION: u32 = 1;

/// One user's accumulator within one month.  Every field after `username` is additive and
/// monotonically non-decreasing across updates.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMonth {
    pub username: String,
    pub jobs: u64,
    pub gpu_jobs: u64,
    pub failed_jobs: u64,
    pub elapsed_hours: f64,
    pub clock_hours: f64,
    pub gpu_elapsed_hours: f64,
    pub gpu_clock_hours: f64,
    pub sum_req_mem_mb: f64,
    pub sum_avg_mem_mb: f64,
    pub sum_max_mem_mb: f64,
}

impl UserMonth {
    pub fn new(username: &str) -> UserMonth {
        UserMonth {
            username: username.to_string(),
            ..Default::default()
        }
    }

    fn add_record(&mut self, rec: &NormalizedRecord) {
        self.jobs += 1;
        if rec.gpu_count > 0 {
            self.gpu_jobs += 1;
        }
        if rec.failed {
            self.failed_jobs += 1;
        }
        self.elapsed_hours += rec.elapsed_hours;
        self.clock_hours += rec.clock_hours;
        self.gpu_elapsed_hours += rec.gpu_elapsed_hours;
        self.gpu_clock_hours += rec.gpu_clock_hours;
        self.sum_req_mem_mb += rec.req_mem_mb;
        self.sum_avg_mem_mb += rec.avg_mem_mb;
        self.sum_max_mem_mb += rec.max_mem_mb;
    }

    /// Add another accumulator's counters into this one (usernames are not touched).

    pub fn absorb(&mut self, other: &UserMonth) {
        self.jobs += other.jobs;
        self.gpu_jobs += other.gpu_jobs;
        self.failed_jobs += other.failed_jobs;
        self.elapsed_hours += other.elapsed_hours;
        self.clock_hours += other.clock_hours;
        self.gpu_elapsed_hours += other.gpu_elapsed_hours;
        self.gpu_clock_hours += other.gpu_clock_hours;
        self.sum_req_mem_mb += other.sum_req_mem_mb;
        self.sum_avg_mem_mb += other.sum_avg_mem_mb;
        self.sum_max_mem_mb += other.sum_max_mem_mb;
    }

    /// Final-minus-initial counter values; `earlier` is None for a user first seen this apply.

    fn delta_from(&self, earlier: Option<&UserMonth>) -> UserMonth {
        let mut d = self.clone();
        if let Some(e) = earlier {
            d.jobs -= e.jobs;
            d.gpu_jobs -= e.gpu_jobs;
            d.failed_jobs -= e.failed_jobs;
            d.elapsed_hours -= e.elapsed_hours;
            d.clock_hours -= e.clock_hours;
            d.gpu_elapsed_hours -= e.gpu_elapsed_hours;
            d.gpu_clock_hours -= e.gpu_clock_hours;
            d.sum_req_mem_mb -= e.sum_req_mem_mb;
            d.sum_avg_mem_mb -= e.sum_avg_mem_mb;
            d.sum_max_mem_mb -= e.sum_max_mem_mb;
        }
        d
    }

    fn is_zero(&self) -> bool {
        self.jobs == 0
            && self.gpu_jobs == 0
            && self.failed_jobs == 0
            && self.elapsed_hours == 0.0
            && self.clock_hours == 0.0
            && self.gpu_elapsed_hours == 0.0
            && self.gpu_clock_hours == 0.0
            && self.sum_req_mem_mb == 0.0
            && self.sum_avg_mem_mb == 0.0
            && self.sum_max_mem_mb == 0.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonthlyRollup {
    pub asof: String,
    pub month: String,
    pub users: Vec<UserMonth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counts {
    pub jobs: u64,
    pub gpu_jobs: u64,
    pub failed_jobs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub elapsed_hours: f64,
    pub clock_hours: f64,
    pub gpu_elapsed_hours: f64,
    pub gpu_clock_hours: f64,
    pub sum_req_mem_mb: f64,
    pub sum_avg_mem_mb: f64,
    pub sum_max_mem_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterAggregate {
    pub asof: String,
    pub counts: Counts,
    pub totals: Totals,
}

impl ClusterAggregate {
    fn add(&mut self, d: &UserMonth, asof: &str) {
        self.counts.jobs += d.jobs;
        self.counts.gpu_jobs += d.gpu_jobs;
        self.counts.failed_jobs += d.failed_jobs;
        self.totals.elapsed_hours += d.elapsed_hours;
        self.totals.clock_hours += d.clock_hours;
        self.totals.gpu_elapsed_hours += d.gpu_elapsed_hours;
        self.totals.gpu_clock_hours += d.gpu_clock_hours;
        self.totals.sum_req_mem_mb += d.sum_req_mem_mb;
        self.totals.sum_avg_mem_mb += d.sum_avg_mem_mb;
        self.totals.sum_max_mem_mb += d.sum_max_mem_mb;
        self.asof = asof.to_string();
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserAggregate {
    pub schema_version: u32,
    pub username: String,
    pub clusters: BTreeMap<String, ClusterAggregate>,
}

impl UserAggregate {
    fn new(username: &str) -> UserAggregate {
        UserAggregate {
            schema_version: SCHEMA_VERSION,
            username: username.to_string(),
            clusters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplyStats {
    /// Records whose month fell inside the window, duplicates included.
    pub jobs_seen: usize,
    /// Records actually folded into a rollup.
    pub jobs_new: usize,
    pub months_changed: Vec<Month>,
    /// Months whose dedupe set or rollup was quarantined and rebuilt from scratch.  A caller
    /// that fetched less than the full month must follow up with a full-month re-fetch, or the
    /// rebuilt rollup stays partial (closed months are never re-fetched by the cursor).
    pub months_reset: Vec<Month>,
    pub users_changed: Vec<String>,
}

struct MonthState {
    dedupe: DedupeSet,
    users: BTreeMap<String, UserMonth>,
    initial: BTreeMap<String, UserMonth>,
    /// True when this month's files were quarantined and it is being rebuilt from scratch;
    /// its files are always rewritten and its users' aggregates recomputed from the monthlies.
    reset: bool,
    changed: bool,
}

/// Fold records into the monthly rollups and user aggregates of `cluster` for the months in
/// `window`.  Records with no end time, or ending outside the window, are ignored.  Exactly
/// idempotent: re-applying the same records changes no file (dedupe capacity permitting).

pub fn apply(
    layout: &Layout,
    cluster: &str,
    window: &[Month],
    records: &[NormalizedRecord],
    expected_jobs: u64,
    p: f64,
    asof: Timestamp,
) -> Result<ApplyStats> {
    let asof = rfc3339_utc(asof);
    let mut months: BTreeMap<Month, MonthState> = BTreeMap::new();
    for &m in window {
        months.insert(m, load_month_state(layout, cluster, m, expected_jobs, p)?);
    }

    let mut stats = ApplyStats::default();
    for (&m, state) in months.iter() {
        if state.reset {
            stats.months_reset.push(m);
        }
    }
    for rec in records {
        let Some(end) = rec.end else { continue };
        let Some(state) = months.get_mut(&Month::containing(end)) else {
            continue;
        };
        stats.jobs_seen += 1;
        if state.dedupe.add(&rec.job_id) {
            continue;
        }
        stats.jobs_new += 1;
        state.changed = true;
        state
            .users
            .entry(rec.username.clone())
            .or_insert_with(|| UserMonth::new(&rec.username))
            .add_record(rec);
    }

    // Per-user deltas for the incremental aggregate path; users from reset months are instead
    // rebuilt from the monthly files after those are written.
    let mut deltas: HashMap<String, UserMonth> = HashMap::new();
    let mut rebuild: BTreeSet<String> = BTreeSet::new();
    for (_, state) in months.iter() {
        if !(state.changed || state.reset) {
            continue;
        }
        for (user, current) in state.users.iter() {
            let d = current.delta_from(state.initial.get(user));
            if state.reset {
                rebuild.insert(user.clone());
            } else if !d.is_zero() {
                deltas
                    .entry(user.clone())
                    .or_insert_with(|| UserMonth::new(user))
                    .absorb(&d);
            }
        }
    }

    // (1) Monthly rollups.
    for (&month, state) in months.iter() {
        if state.changed || state.reset {
            let doc = MonthlyRollup {
                asof: asof.clone(),
                month: month.to_string(),
                users: state.users.values().cloned().collect(),
            };
            fsutil::write_json(&layout.monthly_path(cluster, month), &doc)
                .with_context(|| format!("persisting rollup for {month}"))?;
            stats.months_changed.push(month);
        }
    }

    // (2) User aggregates.
    let mut touched: BTreeSet<String> = deltas.keys().cloned().collect();
    touched.extend(rebuild.iter().cloned());
    for user in &touched {
        if rebuild.contains(user) {
            rebuild_user_aggregate(layout, cluster, user, &asof)?;
            continue;
        }
        let d = &deltas[user];
        let path = layout.user_path(cluster, user);
        let mut agg = match fsutil::load_json::<UserAggregate>(&path)? {
            LoadOutcome::Valid(agg) => agg,
            LoadOutcome::Missing => UserAggregate::new(user),
            LoadOutcome::Quarantined => {
                // The file is gone; deltas would lose history, so rederive it instead.
                rebuild_user_aggregate(layout, cluster, user, &asof)?;
                continue;
            }
        };
        agg.clusters
            .entry(cluster.to_string())
            .or_default()
            .add(d, &asof);
        fsutil::write_json(&path, &agg)
            .with_context(|| format!("persisting aggregate for {user}"))?;
    }
    stats.users_changed = touched.into_iter().collect();

    // (3) Dedupe sets, last.
    for (&month, state) in months.iter() {
        if state.changed || state.reset {
            state
                .dedupe
                .save(&layout.bloom_path(cluster, month))
                .with_context(|| format!("persisting dedupe set for {month}"))?;
        }
    }

    Ok(stats)
}

fn load_month_state(
    layout: &Layout,
    cluster: &str,
    month: Month,
    expected_jobs: u64,
    p: f64,
) -> Result<MonthState> {
    let bloom_path = layout.bloom_path(cluster, month);
    let monthly_path = layout.monthly_path(cluster, month);

    let (mut dedupe, mut reset) = match DedupeSet::load(&bloom_path) {
        Ok(Some(set)) => (Some(set), false),
        Ok(None) => (None, false),
        Err(BloomError::Corrupt(reason)) => {
            // A dedupe set we cannot trust poisons the month: keeping the rollup would double
            // count everything the coming re-fetch re-observes.  Quarantine both and rebuild.
            jsonlog::warning(json!({
                "cluster": cluster, "phase": "dedupe_load", "month": month.to_string(),
                "error": reason,
            }));
            fsutil::quarantine(&bloom_path)?;
            fsutil::quarantine(&monthly_path)?;
            (None, true)
        }
        Err(BloomError::Io(e)) => {
            return Err(e).with_context(|| format!("reading {}", bloom_path.display()))
        }
    };

    let mut users = BTreeMap::new();
    if !reset {
        match fsutil::load_json::<MonthlyRollup>(&monthly_path)? {
            LoadOutcome::Valid(doc) => {
                for row in doc.users {
                    users.insert(row.username.clone(), row);
                }
            }
            LoadOutcome::Missing => {}
            LoadOutcome::Quarantined => {
                // Mirror image of the corrupt-dedupe case: without the rollup the dedupe set
                // would filter the re-fetch down to nothing, leaving the month empty forever.
                jsonlog::warning(json!({
                    "cluster": cluster, "phase": "rollup_load", "month": month.to_string(),
                }));
                fsutil::quarantine(&bloom_path)?;
                dedupe = None;
                reset = true;
            }
        }
    }

    Ok(MonthState {
        dedupe: dedupe.unwrap_or_else(|| DedupeSet::create(expected_jobs, p)),
        initial: users.clone(),
        users,
        reset,
        changed: false,
    })
}

/// Recompute one user's aggregate entry for `cluster` from all monthly rollup files, preserving
/// the entries for other clusters.  Valid whenever the monthly files are intact, by the
/// reconstruction invariant.

pub fn rebuild_user_aggregate(
    layout: &Layout,
    cluster: &str,
    username: &str,
    asof: &str,
) -> Result<()> {
    let mut sum = UserMonth::new(username);
    for month in layout.all_months() {
        let path = layout.monthly_path(cluster, month);
        if let LoadOutcome::Valid(doc) = fsutil::load_json::<MonthlyRollup>(&path)? {
            if let Some(row) = doc.users.iter().find(|u| u.username == username) {
                sum.absorb(row);
            }
        }
    }
    let path = layout.user_path(cluster, username);
    let mut agg = match fsutil::load_json::<UserAggregate>(&path)? {
        LoadOutcome::Valid(agg) => agg,
        _ => UserAggregate::new(username),
    };
    let mut entry = ClusterAggregate::default();
    entry.add(&sum, asof);
    agg.clusters.insert(cluster.to_string(), entry);
    fsutil::write_json(&path, &agg)
}

/// Write an empty rollup if the month has none, so a completed (possibly job-free) month is
/// visible to the leaderboard builder and other tooling.

pub fn ensure_monthly_exists(
    layout: &Layout,
    cluster: &str,
    month: Month,
    asof: Timestamp,
) -> Result<()> {
    let path = layout.monthly_path(cluster, month);
    if !path.exists() {
        let doc = MonthlyRollup {
            asof: rfc3339_utc(asof),
            month: month.to_string(),
            users: vec![],
        };
        fsutil::write_json(&path, &doc)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use sacctlog::{parse_rows, RowOutcome};
    use std::fs;

    const S1_ROWS: &str = "\
1|alice|COMPLETED|3600|4|1|4000Mc|2G|1G|billing=4|2025-08-01T09:00:00|2025-08-01T09:00:00|2025-08-01T10:00:00
2|alice|FAILED|1800|2|1|8Gn|0|0||2025-08-02T09:00:00|2025-08-02T09:00:00|2025-08-02T09:30:00
3|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|2025-08-03T08:00:00|2025-08-03T08:00:00|2025-08-03T10:00:00
3.batch|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|2025-08-03T08:00:00|2025-08-03T08:00:00|2025-08-03T10:00:00
";

    fn records(input: &str) -> Vec<NormalizedRecord> {
        parse_rows(input.as_bytes())
            .unwrap()
            .into_iter()
            .filter_map(|o| match o {
                RowOutcome::Job(rec) => Some(rec),
                _ => None,
            })
            .collect()
    }

    fn asof() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 8, 31, 12, 0, 0).unwrap()
    }

    fn read_monthly(layout: &Layout, cluster: &str, month: Month) -> MonthlyRollup {
        serde_json::from_slice(&fs::read(layout.monthly_path(cluster, month)).unwrap()).unwrap()
    }

    fn read_user(layout: &Layout, cluster: &str, user: &str) -> UserAggregate {
        serde_json::from_slice(&fs::read(layout.user_path(cluster, user)).unwrap()).unwrap()
    }

    #[test]
    fn test_apply_basic_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let aug = Month::new(2025, 8);

        let stats = apply(&layout, "hammer", &[aug], &records(S1_ROWS), 1000, 1e-4, asof()).unwrap();
        assert_eq!(stats.jobs_seen, 3); // the step row never reaches apply
        assert_eq!(stats.jobs_new, 3);
        assert_eq!(stats.months_changed, vec![aug]);
        assert_eq!(stats.users_changed, vec!["alice", "bob"]);

        let doc = read_monthly(&layout, "hammer", aug);
        assert_eq!(doc.month, "2025-08");
        assert_eq!(doc.users.len(), 2);
        let alice = &doc.users[0];
        assert_eq!(alice.username, "alice");
        assert_eq!(alice.jobs, 2);
        assert_eq!(alice.gpu_jobs, 0);
        assert_eq!(alice.failed_jobs, 1);
        assert_eq!(alice.elapsed_hours, 1.5);
        assert_eq!(alice.clock_hours, 5.0);
        assert_eq!(alice.gpu_clock_hours, 0.0);
        assert_eq!(alice.sum_req_mem_mb, 24000.0); // 4000*4 per-cpu + 8000*1 per-node
        assert_eq!(alice.sum_avg_mem_mb, 1000.0);
        assert_eq!(alice.sum_max_mem_mb, 2000.0);
        let bob = &doc.users[1];
        assert_eq!(bob.jobs, 1);
        assert_eq!(bob.gpu_jobs, 1);
        assert_eq!(bob.failed_jobs, 0);
        assert_eq!(bob.elapsed_hours, 2.0);
        assert_eq!(bob.clock_hours, 2.0);
        assert_eq!(bob.gpu_elapsed_hours, 2.0);
        assert_eq!(bob.gpu_clock_hours, 4.0);
        assert_eq!(bob.sum_req_mem_mb, 1000.0);

        let agg = read_user(&layout, "hammer", "alice");
        assert_eq!(agg.schema_version, SCHEMA_VERSION);
        let entry = &agg.clusters["hammer"];
        assert_eq!(entry.counts.jobs, 2);
        assert_eq!(entry.counts.failed_jobs, 1);
        assert_eq!(entry.totals.clock_hours, 5.0);
    }

    #[test]
    fn test_apply_idempotent_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let aug = Month::new(2025, 8);
        let recs = records(S1_ROWS);

        apply(&layout, "hammer", &[aug], &recs, 1000, 1e-4, asof()).unwrap();
        let monthly = fs::read(layout.monthly_path("hammer", aug)).unwrap();
        let alice = fs::read(layout.user_path("hammer", "alice")).unwrap();
        let bloom = fs::read(layout.bloom_path("hammer", aug)).unwrap();

        // Re-apply later; nothing may change, not even asof fields.
        let later = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        let stats = apply(&layout, "hammer", &[aug], &recs, 1000, 1e-4, later).unwrap();
        assert_eq!(stats.jobs_seen, 3);
        assert_eq!(stats.jobs_new, 0);
        assert!(stats.months_changed.is_empty());
        assert!(stats.users_changed.is_empty());
        assert_eq!(fs::read(layout.monthly_path("hammer", aug)).unwrap(), monthly);
        assert_eq!(fs::read(layout.user_path("hammer", "alice")).unwrap(), alice);
        assert_eq!(fs::read(layout.bloom_path("hammer", aug)).unwrap(), bloom);
    }

    #[test]
    fn test_reconstruction_invariant_across_months() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let jul = Month::new(2025, 7);
        let aug = Month::new(2025, 8);

        let july = "10|carol|COMPLETED|3600|2|1|1Gn|0|0||a|b|2025-07-10T10:00:00\n";
        let august = "11|carol|COMPLETED|7200|4|1|1Gn|0|0||a|b|2025-08-10T10:00:00\n";
        apply(&layout, "hammer", &[jul], &records(july), 1000, 1e-4, asof()).unwrap();
        apply(&layout, "hammer", &[aug], &records(august), 1000, 1e-4, asof()).unwrap();

        let agg = read_user(&layout, "hammer", "carol");
        let entry = &agg.clusters["hammer"];
        assert_eq!(entry.counts.jobs, 2);
        // 2 cpu * 1h + 4 cpu * 2h
        assert_eq!(entry.totals.clock_hours, 10.0);
        assert_eq!(entry.totals.elapsed_hours, 3.0);

        let m1 = read_monthly(&layout, "hammer", jul);
        let m2 = read_monthly(&layout, "hammer", aug);
        let summed = m1.users[0].clock_hours + m2.users[0].clock_hours;
        assert_eq!(entry.totals.clock_hours, summed);
    }

    #[test]
    fn test_records_outside_window_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let aug = Month::new(2025, 8);
        let july_row = "20|dave|COMPLETED|3600|1|1|1Gn|0|0||a|b|2025-07-01T10:00:00\n";
        let stats = apply(&layout, "hammer", &[aug], &records(july_row), 1000, 1e-4, asof()).unwrap();
        assert_eq!(stats.jobs_seen, 0);
        assert_eq!(stats.jobs_new, 0);
        assert!(!layout.monthly_path("hammer", aug).exists());
        assert!(!layout.user_path("hammer", "dave").exists());
    }

    #[test]
    fn test_corrupt_dedupe_quarantines_and_rebuilds_month() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let aug = Month::new(2025, 8);
        let recs = records(S1_ROWS);

        apply(&layout, "hammer", &[aug], &recs, 1000, 1e-4, asof()).unwrap();
        fs::write(layout.bloom_path("hammer", aug), b"garbage").unwrap();

        // The re-fetch of the same window must rebuild the month without double counting.
        let stats = apply(&layout, "hammer", &[aug], &recs, 1000, 1e-4, asof()).unwrap();
        assert_eq!(stats.jobs_new, 3);
        let doc = read_monthly(&layout, "hammer", aug);
        assert_eq!(doc.users[0].jobs, 2);
        assert_eq!(doc.users[0].clock_hours, 5.0);
        let agg = read_user(&layout, "hammer", "alice");
        assert_eq!(agg.clusters["hammer"].counts.jobs, 2);
        assert_eq!(agg.clusters["hammer"].totals.clock_hours, 5.0);
        assert!(layout
            .bloom_path("hammer", aug)
            .with_extension("bloom.bad")
            .exists());
    }

    #[test]
    fn test_corrupt_rollup_quarantines_and_rebuilds_month() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let aug = Month::new(2025, 8);
        let recs = records(S1_ROWS);

        apply(&layout, "hammer", &[aug], &recs, 1000, 1e-4, asof()).unwrap();
        fs::write(layout.monthly_path("hammer", aug), b"{broken").unwrap();

        let stats = apply(&layout, "hammer", &[aug], &recs, 1000, 1e-4, asof()).unwrap();
        assert_eq!(stats.jobs_new, 3);
        let doc = read_monthly(&layout, "hammer", aug);
        assert_eq!(doc.users.len(), 2);
        let agg = read_user(&layout, "hammer", "bob");
        assert_eq!(agg.clusters["hammer"].counts.gpu_jobs, 1);
        assert_eq!(agg.clusters["hammer"].totals.gpu_clock_hours, 4.0);
    }

    #[test]
    fn test_rebuild_preserves_foreign_cluster_entries() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let aug = Month::new(2025, 8);

        let row = "30|erin|COMPLETED|3600|1|1|1Gn|0|0||a|b|2025-08-05T10:00:00\n";
        apply(&layout, "hammer", &[aug], &records(row), 1000, 1e-4, asof()).unwrap();

        // Seed a foreign sub-object; a rebuild for hammer must not touch it.
        let path = layout.user_path("hammer", "erin");
        let mut agg: UserAggregate =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let mut anvil = ClusterAggregate::default();
        anvil.totals.clock_hours = 3.0;
        agg.clusters.insert("anvil".to_string(), anvil);
        crate::fsutil::write_json(&path, &agg).unwrap();

        rebuild_user_aggregate(&layout, "hammer", "erin", "2025-08-31T12:00:00Z").unwrap();
        let agg = read_user(&layout, "hammer", "erin");
        assert_eq!(agg.clusters.len(), 2);
        assert_eq!(agg.clusters["hammer"].totals.clock_hours, 1.0);
        assert_eq!(agg.clusters["hammer"].counts.jobs, 1);
        assert_eq!(agg.clusters["anvil"].totals.clock_hours, 3.0);
    }

    #[test]
    fn test_ensure_monthly_exists() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let jun = Month::new(2025, 6);
        ensure_monthly_exists(&layout, "hammer", jun, asof()).unwrap();
        let doc = read_monthly(&layout, "hammer", jun);
        assert!(doc.users.is_empty());
        // Never clobbers an existing rollup.
        let row = "40|fay|COMPLETED|3600|1|1|1Gn|0|0||a|b|2025-06-05T10:00:00\n";
        apply(&layout, "hammer", &[jun], &records(row), 1000, 1e-4, asof()).unwrap();
        ensure_monthly_exists(&layout, "hammer", jun, asof()).unwrap();
        assert_eq!(read_monthly(&layout, "hammer", jun).users.len(), 1);
    }
}
