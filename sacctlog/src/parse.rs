// Parser / preprocessor for raw sacct rows.
//
// Rows are pipe-delimited with the fixed field set of JOB_FIELDS, in that order.  The csv
// decoder is line-oriented, so a malformed row does not prevent progress to the next one.
//
// Classification rules:
//
// - A JobID containing '.' is a job step; steps are dropped silently (their resources are
//   accounted to the parent job row).
// - A row with an unparseable ElapsedRaw is malformed; the caller logs it and moves on.
// - Unparseable memory fields contribute 0 MB but do not invalidate the row.
// - An End of "Unknown"/"None" (or unparseable) leaves the record without a month; the rollup
//   store ignores such records.

use crate::units;
use crate::{NormalizedRecord, Timestamp};
use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::io::Read;
use std::str::FromStr;

/// One raw sacct row, fields in sacct -o order.  Everything is kept as a string; numeric
/// interpretation happens in `normalize` so that one bad field does not sink the whole row.

#[derive(Debug, Deserialize)]
pub struct RawJob {
    pub job_id: String,
    pub user: String,
    pub state: String,
    pub elapsed_raw: String,
    pub alloc_cpus: String,
    pub nnodes: String,
    pub req_mem: String,
    pub max_rss: String,
    pub ave_rss: String,
    pub alloc_tres: String,
    pub submit: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug)]
pub enum RowOutcome {
    /// A job-level row that normalized cleanly.
    Job(NormalizedRecord),
    /// A step row (dotted JobID), dropped without noise.
    Step,
    /// A row we could not use; `line` is the offending input for the log.
    Malformed { line: String, reason: &'static str },
}

const FAIL_STATES: [&str; 5] = ["FAILED", "NODE_FAIL", "OUT_OF_MEMORY", "PREEMPTED", "TIMEOUT"];

/// Normalize one raw row.  See the classification rules in the module comment.

pub fn normalize(raw: &RawJob) -> RowOutcome {
    let malformed = |reason| RowOutcome::Malformed {
        line: raw_line(raw),
        reason,
    };
    if raw.job_id.is_empty() {
        return malformed("empty JobID");
    }
    if raw.job_id.contains('.') {
        return RowOutcome::Step;
    }
    let username = units::normalize_username(&raw.user);
    if username.is_empty() {
        return malformed("empty User");
    }
    let elapsed_secs = match f64::from_str(raw.elapsed_raw.trim()) {
        Ok(s) if s >= 0.0 => s,
        _ => return malformed("unparseable ElapsedRaw"),
    };
    let alloc_cpus = u32::from_str(raw.alloc_cpus.trim()).unwrap_or(0);
    let nnodes = u32::from_str(raw.nnodes.trim()).unwrap_or(0);

    let elapsed_hours = elapsed_secs / 3600.0;
    let clock_hours = alloc_cpus as f64 * elapsed_hours;
    let gpu_count = units::gpu_count_from_tres(&raw.alloc_tres);
    let gpu_elapsed_hours = if gpu_count > 0 { elapsed_hours } else { 0.0 };
    let gpu_clock_hours = gpu_count as f64 * elapsed_hours;

    let req_mem_mb = units::parse_reqmem_mb(&raw.req_mem, alloc_cpus, nnodes).unwrap_or(0.0);
    let max_mem_mb = units::parse_mem_mb(&raw.max_rss).unwrap_or(0.0);
    let avg_mem_mb = units::parse_mem_mb(&raw.ave_rss).unwrap_or(0.0);

    // "CANCELLED by 1234" carries the canceling UID; only the first token is the state.
    let state = raw.state.split_whitespace().next().unwrap_or("");
    let failed = FAIL_STATES.contains(&state);

    RowOutcome::Job(NormalizedRecord {
        job_id: raw.job_id.clone(),
        username,
        end: parse_end(&raw.end),
        elapsed_hours,
        alloc_cpus,
        nnodes,
        clock_hours,
        gpu_count,
        gpu_elapsed_hours,
        gpu_clock_hours,
        req_mem_mb,
        avg_mem_mb,
        max_mem_mb,
        failed,
    })
}

/// Parse sacct's pipe-delimited output into row outcomes.  This returns an error only for I/O
/// errors on `input`; malformed rows become RowOutcome::Malformed.

pub fn parse_rows<R: Read>(input: R) -> Result<Vec<RowOutcome>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut outcomes = vec![];
    for record in reader.records() {
        match record {
            Err(e) => {
                if e.is_io_error() {
                    return Err(e.into());
                }
                outcomes.push(RowOutcome::Malformed {
                    line: e.to_string(),
                    reason: "undecodable row",
                });
            }
            Ok(rec) => match rec.deserialize::<RawJob>(None) {
                Err(_) => outcomes.push(RowOutcome::Malformed {
                    line: rec.iter().collect::<Vec<&str>>().join("|"),
                    reason: "wrong field count",
                }),
                Ok(raw) => outcomes.push(normalize(&raw)),
            },
        }
    }
    Ok(outcomes)
}

/// Convenience over `parse_rows` for the line vectors the sacct adapter returns.

pub fn parse_lines(lines: &[String]) -> Result<Vec<RowOutcome>> {
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    parse_rows(buf.as_bytes())
}

fn parse_end(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    if s.is_empty() || s == "Unknown" || s == "None" {
        return None;
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

fn raw_line(raw: &RawJob) -> String {
    [
        &raw.job_id,
        &raw.user,
        &raw.state,
        &raw.elapsed_raw,
        &raw.alloc_cpus,
        &raw.nnodes,
        &raw.req_mem,
        &raw.max_rss,
        &raw.ave_rss,
        &raw.alloc_tres,
        &raw.submit,
        &raw.start,
        &raw.end,
    ]
    .map(|f| f.as_str())
    .join("|")
}

#[cfg(test)]
fn parse_one(line: &str) -> RowOutcome {
    let mut v = parse_rows(line.as_bytes()).unwrap();
    assert_eq!(v.len(), 1);
    v.pop().unwrap()
}

#[test]
fn test_normalize_basic() {
    let r = parse_one(
        "1|alice|COMPLETED|3600|4|1|4000Mc|2G|1G|billing=4|2025-08-01T10:00:00|2025-08-01T10:00:00|2025-08-01T11:00:00",
    );
    let rec = match r {
        RowOutcome::Job(rec) => rec,
        _ => panic!("expected a job"),
    };
    assert_eq!(rec.job_id, "1");
    assert_eq!(rec.username, "alice");
    assert_eq!(rec.elapsed_hours, 1.0);
    assert_eq!(rec.clock_hours, 4.0);
    assert_eq!(rec.gpu_count, 0);
    assert_eq!(rec.gpu_elapsed_hours, 0.0);
    assert_eq!(rec.req_mem_mb, 16000.0);
    assert_eq!(rec.max_mem_mb, 2000.0);
    assert_eq!(rec.avg_mem_mb, 1000.0);
    assert!(!rec.failed);
    assert!(rec.end.is_some());
}

#[test]
fn test_normalize_gpu_job() {
    let r = parse_one(
        "3|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|2025-08-02T08:00:00|2025-08-02T08:00:00|2025-08-02T10:00:00",
    );
    let rec = match r {
        RowOutcome::Job(rec) => rec,
        _ => panic!("expected a job"),
    };
    assert_eq!(rec.gpu_count, 2);
    assert_eq!(rec.elapsed_hours, 2.0);
    assert_eq!(rec.gpu_elapsed_hours, 2.0);
    assert_eq!(rec.gpu_clock_hours, 4.0);
    assert_eq!(rec.req_mem_mb, 1000.0);
}

#[test]
fn test_normalize_step_dropped() {
    let r = parse_one(
        "3.batch|bob|COMPLETED|7200|1|1|1Gn|0|0|gres/gpu=2|2025-08-02T08:00:00|2025-08-02T08:00:00|2025-08-02T10:00:00",
    );
    assert!(matches!(r, RowOutcome::Step));
}

#[test]
fn test_normalize_failure_states() {
    for (state, failed) in [
        ("FAILED", true),
        ("NODE_FAIL", true),
        ("OUT_OF_MEMORY", true),
        ("PREEMPTED", true),
        ("TIMEOUT", true),
        ("CANCELLED", false),
        ("CANCELLED by 5012", false),
        ("COMPLETED", false),
    ] {
        let line = format!(
            "9|u|{state}|60|1|1|1Gn|0|0||2025-08-01T00:00:00|2025-08-01T00:00:00|2025-08-01T00:01:00"
        );
        match parse_one(&line) {
            RowOutcome::Job(rec) => assert_eq!(rec.failed, failed, "state {}", state),
            _ => panic!("expected a job for state {}", state),
        }
    }
}

#[test]
fn test_normalize_bad_elapsed() {
    let r = parse_one("7|u|COMPLETED|oops|1|1|1Gn|0|0||a|b|c");
    assert!(matches!(
        r,
        RowOutcome::Malformed {
            reason: "unparseable ElapsedRaw",
            ..
        }
    ));
}

#[test]
fn test_normalize_realm_and_case() {
    let r = parse_one("8|Alice@EXAMPLE.ORG|COMPLETED|3600|1|1||||||b|2025-08-01T11:00:00");
    match r {
        RowOutcome::Job(rec) => {
            assert_eq!(rec.username, "alice");
            // Missing memory fields contribute zero.
            assert_eq!(rec.req_mem_mb, 0.0);
            assert_eq!(rec.max_mem_mb, 0.0);
            assert_eq!(rec.avg_mem_mb, 0.0);
        }
        _ => panic!("expected a job"),
    }
}

#[test]
fn test_parse_rows_wrong_arity() {
    let input = "1|alice|COMPLETED\n2|bob|COMPLETED|60|1|1|1Gn|0|0||a|b|2025-08-01T00:01:00\n";
    let v = parse_rows(input.as_bytes()).unwrap();
    assert_eq!(v.len(), 2);
    assert!(matches!(v[0], RowOutcome::Malformed { .. }));
    assert!(matches!(v[1], RowOutcome::Job(_)));
}

#[test]
fn test_parse_end_unknown() {
    let r = parse_one("5|u|RUNNING|60|1|1|1Gn|0|0||a|b|Unknown");
    match r {
        RowOutcome::Job(rec) => assert!(rec.end.is_none()),
        _ => panic!("expected a job"),
    }
}
