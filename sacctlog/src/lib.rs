// This library acquires and normalizes Slurm accounting data.  It invokes `sacct` for a time
// window (rate-limited, with backoff), parses the pipe-delimited rows it emits, and turns
// job-level rows into NormalizedRecord structures with derived usage metrics.
//
// Job *steps* (JobID of the form "1234.batch") are classified and dropped here; consumers only
// ever see whole jobs.  Nothing in this crate touches the scoreboard state directory.

mod dates;
mod parse;
mod sacct;
mod units;

pub mod jsonlog;

use chrono::prelude::DateTime;
use chrono::Utc;

pub type Timestamp = DateTime<Utc>;

/// Month arithmetic on "YYYY-MM" values.

pub use dates::Month;

/// Parse raw sacct rows into RowOutcome values, applying the normalization rules.

pub use parse::{normalize, parse_lines, parse_rows, RawJob, RowOutcome};

/// Invoke sacct with rate limiting, retry and timeout handling.

pub use sacct::{
    Sacct, SacctError, DEFAULT_RATE_PER_MIN, DEFAULT_TIMEOUT_SECS, JOB_FIELDS, USER_FIELD,
};

/// Unit parsing for memory strings and TRES GPU extraction.

pub use units::{gpu_count_from_tres, normalize_username, parse_mem_mb, parse_reqmem_mb};

/// The NormalizedRecord structure holds one job-level accounting row with derived metrics.
/// Memory values are base-10 megabytes; hour values are fractional hours.

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    /// Opaque accounting-system job identifier, never a step (no dot).
    pub job_id: String,

    /// Unix user name, lowercased, any "@realm" suffix stripped.
    pub username: String,

    /// Job end time (UTC).  None when sacct reported "Unknown" or an unparseable value; such
    /// records cannot be attributed to a month and are ignored by the rollup store.
    pub end: Option<Timestamp>,

    /// ElapsedRaw / 3600.
    pub elapsed_hours: f64,

    pub alloc_cpus: u32,
    pub nnodes: u32,

    /// alloc_cpus * elapsed_hours.
    pub clock_hours: f64,

    /// Sum of the integers in any gres/gpu or gres/gpu:<type> token of AllocTRES.
    pub gpu_count: u32,

    /// elapsed_hours when gpu_count > 0, else 0.
    pub gpu_elapsed_hours: f64,

    /// gpu_count * elapsed_hours.
    pub gpu_clock_hours: f64,

    pub req_mem_mb: f64,
    pub avg_mem_mb: f64,
    pub max_mem_mb: f64,

    /// True iff the job state denotes a failure (FAILED, NODE_FAIL, OUT_OF_MEMORY, PREEMPTED,
    /// TIMEOUT).  CANCELLED is not a failure.
    pub failed: bool,
}

pub fn now() -> Timestamp {
    Utc::now()
}

/// RFC 3339 UTC with trailing Z and second precision, the timestamp format of every persisted
/// "asof" field and every log line.

pub fn rfc3339_utc(t: Timestamp) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
