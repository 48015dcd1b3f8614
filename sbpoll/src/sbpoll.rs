// `sbpoll` -- poll Slurm accounting into scoreboard rollups and leaderboards
//
// One poller instance runs per cluster, typically from cron, against a storage root shared by
// all clusters.  Each invocation performs a single tick: advance the month-by-month backfill
// or catch up the current month, discover new users, and rebuild the leaderboard files the
// viewer reads.
//
// Exit codes: 0 success, 3 another poller holds the cluster lock, 1 any other failure.

mod bloom;
mod cursor;
mod discover;
mod errors;
mod fsutil;
mod leaderboard;
mod lock;
mod paths;
mod store;
mod tick;

use clap::{Args, Parser, Subcommand};
use errors::PollError;
use sacctlog::jsonlog;
use serde_json::json;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one poll tick for a cluster
    Poll(PollArgs),
}

#[derive(Args, Debug)]
pub struct PollArgs {
    /// Cluster name (path segment and rate-limit bucket)
    #[arg(long)]
    cluster: String,

    /// Scoreboard storage root shared by all clusters
    #[arg(long)]
    root: PathBuf,

    /// Earliest date to backfill from, YYYY-MM-DD (sticky after the first tick)
    #[arg(long, default_value = "2000-01-01")]
    backfill_start: String,

    /// Maximum sacct calls per minute
    #[arg(long, default_value_t = sacctlog::DEFAULT_RATE_PER_MIN)]
    rate_limit: u32,

    /// Process one tick then exit (always the case; looping belongs to cron)
    #[arg(long = "once")]
    _once: bool,

    /// Directory whose entries seed user discovery
    #[arg(long, default_value = "/home")]
    home_dir: PathBuf,

    /// Expected jobs per month, sizes the dedupe filters
    #[arg(long, default_value_t = bloom::DEFAULT_EXPECTED_JOBS)]
    expected_jobs: u64,

    /// Users with fewer jobs in a window are left off that window's leaderboards
    #[arg(long, default_value_t = 3)]
    min_jobs: u64,

    /// Maximum queued users to backfill per tick
    #[arg(long, default_value_t = 5)]
    discover_limit: usize,

    /// Kill an sacct call after this many seconds
    #[arg(long, default_value_t = sacctlog::DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,
}

fn main() {
    let cli = Cli::parse();
    let Commands::Poll(ref args) = cli.command;
    let cfg = tick::TickConfig {
        root: args.root.clone(),
        cluster: args.cluster.clone(),
        backfill_start: args.backfill_start.clone(),
        rate_per_min: args.rate_limit,
        timeout_secs: args.timeout_secs,
        home_dir: args.home_dir.clone(),
        expected_jobs: args.expected_jobs,
        min_jobs: args.min_jobs,
        discover_limit: args.discover_limit,
        sacct_command: "sacct".to_string(),
    };
    match tick::run(&cfg) {
        Ok(()) => process::exit(0),
        Err(e @ PollError::LockHeld(_)) => {
            // One line, no noise: contention is a normal outcome under cron overlap.
            jsonlog::info(json!({
                "cluster": args.cluster, "phase": "lock", "status": "held",
            }));
            process::exit(e.exit_code());
        }
        Err(e) => {
            jsonlog::error(json!({
                "cluster": args.cluster, "phase": "tick", "error": e.to_string(),
            }));
            process::exit(e.exit_code());
        }
    }
}
