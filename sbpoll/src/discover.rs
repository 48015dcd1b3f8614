// User discovery and targeted backfill.
//
// Candidates come from two directions: entries under the configured home directory, and a
// distinct-user sacct projection over the whole backfill range.  Anyone not yet present under
// agg/users/ goes onto an on-disk queue; each tick pops a bounded number of queued users and
// runs a user-scoped backfill across every month from backfill_start through the current
// month.  The shared dedupe sets make those re-scans incapable of double counting jobs already
// attributed to other users.

use crate::cursor::Cursor;
use crate::fsutil::{self, LoadOutcome};
use crate::paths::Layout;
use crate::store;
use anyhow::{Context, Result};
use sacctlog::{jsonlog, parse_lines, Month, RowOutcome, Sacct, Timestamp, JOB_FIELDS, USER_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;

const SYSTEM_USERS: [&str; 17] = [
    "root", "daemon", "bin", "sys", "sync", "games", "man", "nobody", "mail", "postfix", "ftp",
    "sshd", "rpc", "rpcuser", "dbus", "ntp", "operator",
];

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DiscoverQueue {
    pub pending: Vec<String>,
}

impl DiscoverQueue {
    pub fn load(path: &Path) -> Result<DiscoverQueue> {
        Ok(match fsutil::load_json::<DiscoverQueue>(path)? {
            LoadOutcome::Valid(q) => q,
            LoadOutcome::Missing | LoadOutcome::Quarantined => DiscoverQueue::default(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fsutil::write_json(path, self)
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub candidates: usize,
    pub enqueued: usize,
    pub processed: Vec<String>,
    pub still_pending: usize,
}

/// A name that could plausibly be a human account: at least two characters, alphanumeric plus
/// '-' and '_', not hidden, not a well-known system account.

fn plausible_username(name: &str) -> bool {
    name.len() >= 2
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !SYSTEM_USERS.contains(&name)
}

pub fn candidate_home_users(home: &Path) -> Vec<String> {
    let mut users = vec![];
    if let Ok(rd) = home.read_dir() {
        for entry in rd.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                let name = name.to_lowercase();
                if plausible_username(&name) {
                    users.push(name);
                }
            }
        }
    }
    users.sort();
    users
}

/// Enumerate distinct users from accounting over [start, end) with a single-column projection.

pub fn candidate_sacct_users(
    sacct: &mut Sacct,
    start: &str,
    end: &str,
) -> Result<Vec<String>, sacctlog::SacctError> {
    let lines = sacct.fetch(start, end, None, USER_FIELD)?;
    let mut users = BTreeSet::new();
    for line in lines {
        let name = sacctlog::normalize_username(line.split('|').next().unwrap_or(""));
        if plausible_username(&name) {
            users.insert(name);
        }
    }
    Ok(users.into_iter().collect())
}

/// Merge fresh candidates into the queue: skip users that are already known (an aggregate file
/// exists) or already queued; append the rest in sorted order.  Returns how many were added.

pub fn enqueue_new(queue: &mut DiscoverQueue, candidates: &[String], known: &[String]) -> usize {
    let queued: BTreeSet<&String> = queue.pending.iter().collect();
    let known: BTreeSet<&String> = known.iter().collect();
    let mut fresh: Vec<String> = candidates
        .iter()
        .filter(|u| !queued.contains(u) && !known.contains(u))
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();
    let added = fresh.len();
    queue.pending.append(&mut fresh);
    added
}

/// One discovery pass for a cluster: enumerate, enqueue, and backfill up to `limit` queued
/// users across [backfill_start, current] month by month.  Needs at least one completed month;
/// before that there is nothing to retro-fill.

#[allow(clippy::too_many_arguments)]
pub fn run(
    layout: &Layout,
    cluster: &str,
    sacct: &mut Sacct,
    cursor: &Cursor,
    current: Month,
    home_dir: &Path,
    limit: usize,
    expected_jobs: u64,
    p: f64,
    now: Timestamp,
) -> Result<DiscoveryOutcome> {
    let mut outcome = DiscoveryOutcome::default();
    if cursor.last_complete_month.is_none() {
        return Ok(outcome);
    }
    let start_month = cursor.backfill_start_month()?;
    let months = start_month.through(current);

    let mut candidates = candidate_home_users(home_dir);
    candidates.extend(candidate_sacct_users(
        sacct,
        &start_month.first_day(),
        &current.succ().first_day(),
    )?);
    outcome.candidates = candidates.len();

    let queue_path = layout.queue_path(cluster);
    let mut queue = DiscoverQueue::load(&queue_path)?;
    outcome.enqueued = enqueue_new(&mut queue, &candidates, &layout.known_users(cluster));
    queue.save(&queue_path)?;

    while outcome.processed.len() < limit && !queue.pending.is_empty() {
        let user = queue.pending[0].clone();
        if let Err(e) = backfill_user(layout, cluster, sacct, &user, &months, expected_jobs, p, now)
        {
            // The user stays queued; backfill is idempotent, so retrying whole is fine.
            queue.save(&queue_path)?;
            return Err(e);
        }
        queue.pending.remove(0);
        outcome.processed.push(user);
    }
    queue.save(&queue_path)?;
    outcome.still_pending = queue.pending.len();
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn backfill_user(
    layout: &Layout,
    cluster: &str,
    sacct: &mut Sacct,
    username: &str,
    months: &[Month],
    expected_jobs: u64,
    p: f64,
    now: Timestamp,
) -> Result<()> {
    for &month in months {
        let lines = sacct
            .fetch(
                &month.first_day(),
                &month.succ().first_day(),
                Some(username),
                JOB_FIELDS,
            )
            .with_context(|| format!("user-scoped fetch for {username} {month}"))?;
        let mut records = vec![];
        for outcome in parse_lines(&lines)? {
            match outcome {
                RowOutcome::Job(rec) if rec.username == username => records.push(rec),
                RowOutcome::Job(_) | RowOutcome::Step => {}
                RowOutcome::Malformed { line, reason } => {
                    jsonlog::warning(json!({
                        "cluster": cluster, "phase": "discover_parse",
                        "error": reason, "row": line,
                    }));
                }
            }
        }
        let stats = store::apply(layout, cluster, &[month], &records, expected_jobs, p, now)?;
        if stats.jobs_new > 0 {
            jsonlog::info(json!({
                "cluster": cluster, "phase": "targeted_backfill", "user": username,
                "month": month.to_string(), "jobs_new": stats.jobs_new,
            }));
        }
        // A user-scoped fetch cannot repopulate a month whose files were quarantined; closed
        // months are never re-fetched by the cursor, so repair it in full right here.
        for &reset in &stats.months_reset {
            refetch_month(layout, cluster, sacct, reset, expected_jobs, p, now)?;
        }
    }
    Ok(())
}

fn refetch_month(
    layout: &Layout,
    cluster: &str,
    sacct: &mut Sacct,
    month: Month,
    expected_jobs: u64,
    p: f64,
    now: Timestamp,
) -> Result<()> {
    let lines = sacct
        .fetch(&month.first_day(), &month.succ().first_day(), None, JOB_FIELDS)
        .with_context(|| format!("repair fetch for {month}"))?;
    let mut records = vec![];
    for outcome in parse_lines(&lines)? {
        if let RowOutcome::Job(rec) = outcome {
            records.push(rec);
        }
    }
    let stats = store::apply(layout, cluster, &[month], &records, expected_jobs, p, now)?;
    jsonlog::info(json!({
        "cluster": cluster, "phase": "month_repair", "month": month.to_string(),
        "jobs_new": stats.jobs_new,
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_plausible_username() {
        assert!(plausible_username("alice"));
        assert!(plausible_username("ola-nordmann_2"));
        assert!(!plausible_username("root"));
        assert!(!plausible_username("a"));
        assert!(!plausible_username(".snapshot"));
        assert!(!plausible_username("has space"));
        assert!(!plausible_username("pct%20"));
    }

    #[test]
    fn test_candidate_home_users() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Alice", "bob", "root", ".snapshots", "x"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(candidate_home_users(dir.path()), vec!["alice", "bob"]);
        assert!(candidate_home_users(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn test_enqueue_new() {
        let mut queue = DiscoverQueue {
            pending: vec!["carol".to_string()],
        };
        let candidates = vec![
            "alice".to_string(),
            "bob".to_string(),
            "bob".to_string(),
            "carol".to_string(),
            "dave".to_string(),
        ];
        let known = vec!["dave".to_string()];
        let added = enqueue_new(&mut queue, &candidates, &known);
        assert_eq!(added, 2);
        assert_eq!(queue.pending, vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn test_queue_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discover_queue.json");
        assert!(DiscoverQueue::load(&path).unwrap().pending.is_empty());
        let q = DiscoverQueue {
            pending: vec!["alice".to_string(), "bob".to_string()],
        };
        q.save(&path).unwrap();
        assert_eq!(DiscoverQueue::load(&path).unwrap().pending, q.pending);
    }

    #[test]
    fn test_run_requires_completed_month() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let mut sacct = Sacct::new("hammer", 120, 5);
        sacct.command = "true".to_string();
        let cursor = Cursor::default();
        let outcome = run(
            &layout,
            "hammer",
            &mut sacct,
            &cursor,
            Month::new(2025, 8),
            dir.path(),
            5,
            1000,
            1e-4,
            sacctlog::now(),
        )
        .unwrap();
        assert_eq!(outcome.candidates, 0);
        assert!(outcome.processed.is_empty());
    }

    #[test]
    fn test_run_with_stub_sacct_enqueues_home_users() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_cluster_dirs("hammer").unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(home.join("erin")).unwrap();

        let mut cursor = Cursor::default();
        cursor.init_backfill_start("2025-06-01").unwrap();
        cursor.last_complete_month = Some("2025-07".to_string());

        // `true` yields no sacct users and no jobs; erin is found via home, backfilled to
        // nothing, and drained from the queue.
        let mut sacct = Sacct::new("hammer", 600, 5);
        sacct.command = "true".to_string();
        let outcome = run(
            &layout,
            "hammer",
            &mut sacct,
            &cursor,
            Month::new(2025, 8),
            &home,
            5,
            1000,
            1e-4,
            sacctlog::now(),
        )
        .unwrap();
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(outcome.processed, vec!["erin"]);
        assert_eq!(outcome.still_pending, 0);
        assert!(DiscoverQueue::load(&layout.queue_path("hammer"))
            .unwrap()
            .pending
            .is_empty());
    }
}
