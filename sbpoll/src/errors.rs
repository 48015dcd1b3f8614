// The closed set of tick-level failure kinds.  Everything below the orchestrator converts I/O
// problems into one of these; only main() turns a variant into a process exit code.

use sacctlog::SacctError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollError {
    /// Another poller holds this cluster's lock; exit 3, touch nothing.
    #[error("lock held for cluster {0}")]
    LockHeld(String),

    /// The accounting tool kept failing after retries; no state was changed.
    #[error("fetch failed: {0}")]
    Fetch(#[from] SacctError),

    /// Anything else: state I/O, write failures, bad arguments.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PollError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PollError::LockHeld(_) => 3,
            _ => 1,
        }
    }
}
