// Per-cluster advisory file lock, held for the duration of a tick.  flock semantics work on
// the shared filesystem these pollers write to; the lock file itself carries no data.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::Path;

pub struct ClusterLock {
    file: std::fs::File,
}

impl ClusterLock {
    /// Try to take the exclusive lock without blocking.  Ok(None) means another poller holds
    /// it; the caller exits with the distinguished lock-held status without touching state.

    pub fn acquire(path: &Path) -> Result<Option<ClusterLock>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(ClusterLock { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("locking {}", path.display())),
        }
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        // Errors on unlock are moot; closing the descriptor releases the lock anyway.
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let first = ClusterLock::acquire(&path).unwrap();
        assert!(first.is_some());
        // flock is per open file description, so a second handle contends even in-process.
        assert!(ClusterLock::acquire(&path).unwrap().is_none());
        drop(first);
        assert!(ClusterLock::acquire(&path).unwrap().is_some());
    }
}
