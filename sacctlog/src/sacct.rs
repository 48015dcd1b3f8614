// Invoke the site's sacct command for a time window and return its raw output lines.
//
// sacct queries hit the shared slurmdbd, so calls are throttled by a token bucket (default 2
// calls per minute per poller) and failures are retried with exponential backoff.  Every call
// emits one structured log line.
//
// The subprocess's stdout is redirected to an unlinked temp file rather than a pipe; the wait
// loop polls try_wait with a deadline and can kill a hung sacct without ever reading the pipe,
// which a full pipe buffer would otherwise turn into a deadlock.

use crate::jsonlog;
use serde_json::json;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The job-level field set, in the order RawJob expects.

pub const JOB_FIELDS: &str =
    "JobID,User,State,ElapsedRaw,AllocCPUS,NNodes,ReqMem,MaxRSS,AveRSS,AllocTRES,Submit,Start,End";

/// Single-column projection used by discovery to enumerate distinct users.

pub const USER_FIELD: &str = "User";

pub const DEFAULT_RATE_PER_MIN: u32 = 2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SacctError {
    #[error("sacct exited with code {code} after {attempts} attempts")]
    Failed { code: i32, attempts: u32 },

    #[error("sacct timed out after {attempts} attempts")]
    TimedOut { attempts: u32 },

    #[error("could not run sacct: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One sacct invoker, holding the cluster's token bucket.  The orchestrator owns exactly one of
/// these per tick.

pub struct Sacct {
    pub cluster: String,
    pub timeout: Duration,
    /// Command to execute; "sacct" except under test.
    pub command: String,
    bucket: TokenBucket,
}

impl Sacct {
    pub fn new(cluster: &str, rate_per_min: u32, timeout_secs: u64) -> Sacct {
        Sacct {
            cluster: cluster.to_string(),
            timeout: Duration::from_secs(timeout_secs),
            command: "sacct".to_string(),
            bucket: TokenBucket::new(rate_per_min),
        }
    }

    /// Run sacct over [start, end) and return its nonblank stdout lines.  `start` and `end` are
    /// UTC dates (YYYY-MM-DD); `user` narrows the query for targeted backfill; `fields` is the
    /// -o projection (JOB_FIELDS or USER_FIELD).
    ///
    /// Blocks on the rate limiter, retries transient failures with exponential backoff, and
    /// kills the subprocess after the timeout.  Exhausted retries surface as a typed error so
    /// the orchestrator can release the lock and exit without touching state.

    pub fn fetch(
        &mut self,
        start: &str,
        end: &str,
        user: Option<&str>,
        fields: &str,
    ) -> Result<Vec<String>, SacctError> {
        let args = build_args(start, end, user, fields);
        let mut backoff = BACKOFF_BASE;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.bucket.acquire();
            let began = Instant::now();
            let outcome = self.run_once(&args)?;
            let duration_ms = began.elapsed().as_millis() as u64;
            match outcome {
                Outcome::Done { status: 0, stdout } => {
                    let lines = stdout
                        .lines()
                        .filter(|l| !l.trim().is_empty())
                        .map(|l| l.to_string())
                        .collect::<Vec<String>>();
                    jsonlog::info(json!({
                        "cluster": self.cluster, "phase": "sacct_call",
                        "start": start, "end": end, "exit_code": 0,
                        "duration_ms": duration_ms, "rows": lines.len(),
                    }));
                    return Ok(lines);
                }
                Outcome::Done { status, .. } => {
                    jsonlog::error(json!({
                        "cluster": self.cluster, "phase": "sacct_call",
                        "start": start, "end": end, "exit_code": status,
                        "duration_ms": duration_ms, "calls": attempt,
                    }));
                    if attempt >= MAX_ATTEMPTS {
                        return Err(SacctError::Failed {
                            code: status,
                            attempts: attempt,
                        });
                    }
                }
                Outcome::TimedOut => {
                    jsonlog::error(json!({
                        "cluster": self.cluster, "phase": "sacct_call",
                        "start": start, "end": end, "exit_code": "timeout",
                        "duration_ms": duration_ms, "calls": attempt,
                    }));
                    if attempt >= MAX_ATTEMPTS {
                        return Err(SacctError::TimedOut { attempts: attempt });
                    }
                }
            }
            thread::sleep(backoff);
            backoff = std::cmp::min(backoff * 2, BACKOFF_CAP);
        }
    }

    fn run_once(&self, args: &[String]) -> Result<Outcome, std::io::Error> {
        let stdout_file = tempfile::tempfile()?;
        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file.try_clone()?))
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        // Best effort; the child may exit between try_wait and kill.
                        let _ = child.kill();
                        let _ = child.wait();
                        return Ok(Outcome::TimedOut);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        };

        let mut stdout_file = stdout_file;
        stdout_file.seek(SeekFrom::Start(0))?;
        let mut stdout = String::new();
        read_lossy(&mut stdout_file, &mut stdout)?;
        Ok(Outcome::Done {
            status: status.code().unwrap_or(-1),
            stdout,
        })
    }
}

enum Outcome {
    Done { status: i32, stdout: String },
    TimedOut,
}

fn build_args(start: &str, end: &str, user: Option<&str>, fields: &str) -> Vec<String> {
    let mut args = vec![
        "-a".to_string(),
        "-n".to_string(),
        "-P".to_string(),
        "-S".to_string(),
        start.to_string(),
        "-E".to_string(),
        end.to_string(),
        "-o".to_string(),
        fields.to_string(),
    ];
    if let Some(u) = user {
        args.push("-u".to_string());
        args.push(u.to_string());
    }
    args
}

fn read_lossy(file: &mut File, out: &mut String) -> Result<(), std::io::Error> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    out.push_str(&String::from_utf8_lossy(&bytes));
    Ok(())
}

/// Continuously refilled token bucket: `capacity` tokens per minute, starts full.  acquire()
/// blocks until a token is available.

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(per_min: u32) -> TokenBucket {
        let capacity = f64::max(per_min as f64, 1.0);
        TokenBucket {
            capacity,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.last = now;
            self.tokens = f64::min(self.capacity, self.tokens + elapsed * self.capacity / 60.0);
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let needed = 1.0 - self.tokens;
            thread::sleep(Duration::from_secs_f64(needed * 60.0 / self.capacity));
        }
    }
}

#[test]
fn test_build_args() {
    let args = build_args("2025-08-01", "2025-09-01", None, JOB_FIELDS);
    assert_eq!(
        args,
        vec![
            "-a", "-n", "-P", "-S", "2025-08-01", "-E", "2025-09-01", "-o", JOB_FIELDS
        ]
    );
    let args = build_args("2025-08-01", "2025-09-01", Some("alice"), USER_FIELD);
    assert_eq!(args[args.len() - 2], "-u");
    assert_eq!(args[args.len() - 1], "alice");
    assert_eq!(args[8], "User");
}

#[test]
fn test_bucket_starts_full() {
    let mut b = TokenBucket::new(2);
    let t0 = Instant::now();
    b.acquire();
    assert!(t0.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_fetch_via_stub_command() {
    // `true` produces no output and exits 0; a fetch against it must succeed with zero rows.
    let mut sacct = Sacct::new("testcluster", 120, 10);
    sacct.command = "true".to_string();
    let lines = sacct
        .fetch("2025-08-01", "2025-09-01", None, JOB_FIELDS)
        .unwrap();
    assert!(lines.is_empty());
}

#[test]
fn test_fetch_missing_binary() {
    let mut sacct = Sacct::new("testcluster", 120, 10);
    sacct.command = "/nonexistent/sacct".to_string();
    match sacct.fetch("2025-08-01", "2025-09-01", None, JOB_FIELDS) {
        Err(SacctError::Spawn(_)) => {}
        other => panic!("expected spawn error, got {:?}", other.map(|v| v.len())),
    }
}
