// The on-disk layout under the scoreboard root, shared by all clusters:
//
//    clusters/<cluster>/state/poll_cursor.json
//    clusters/<cluster>/state/discover_queue.json
//    clusters/<cluster>/state/seen/YYYY-MM.bloom
//    clusters/<cluster>/state/lock
//    clusters/<cluster>/agg/rollups/monthly/YYYY-MM.json
//    clusters/<cluster>/agg/users/<username>.json
//    leaderboards/<window>_<metric>.json
//    config/optout.txt
//
// A poller mutates only its own cluster's subtree (serialized by the lock) plus the shared
// leaderboards directory (safe because every write there is temp+rename).

use anyhow::Result;
use sacctlog::Month;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: &Path) -> Layout {
        Layout {
            root: root.to_path_buf(),
        }
    }

    pub fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.root.join("clusters").join(cluster)
    }

    pub fn state_dir(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join("state")
    }

    pub fn lock_path(&self, cluster: &str) -> PathBuf {
        self.state_dir(cluster).join("lock")
    }

    pub fn cursor_path(&self, cluster: &str) -> PathBuf {
        self.state_dir(cluster).join("poll_cursor.json")
    }

    pub fn queue_path(&self, cluster: &str) -> PathBuf {
        self.state_dir(cluster).join("discover_queue.json")
    }

    pub fn seen_dir(&self, cluster: &str) -> PathBuf {
        self.state_dir(cluster).join("seen")
    }

    pub fn bloom_path(&self, cluster: &str, month: Month) -> PathBuf {
        self.seen_dir(cluster).join(format!("{month}.bloom"))
    }

    pub fn monthly_dir(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join("agg/rollups/monthly")
    }

    pub fn monthly_path(&self, cluster: &str, month: Month) -> PathBuf {
        self.monthly_dir(cluster).join(format!("{month}.json"))
    }

    pub fn users_dir(&self, cluster: &str) -> PathBuf {
        self.cluster_dir(cluster).join("agg/users")
    }

    pub fn user_path(&self, cluster: &str, username: &str) -> PathBuf {
        self.users_dir(cluster).join(format!("{username}.json"))
    }

    pub fn leaderboards_dir(&self) -> PathBuf {
        self.root.join("leaderboards")
    }

    pub fn leaderboard_path(&self, window: &str, metric: &str) -> PathBuf {
        self.leaderboards_dir().join(format!("{window}_{metric}.json"))
    }

    pub fn optout_path(&self) -> PathBuf {
        self.root.join("config").join("optout.txt")
    }

    /// Create the writable directories for one cluster (and the shared leaderboards dir).

    pub fn ensure_cluster_dirs(&self, cluster: &str) -> Result<()> {
        for dir in [
            self.seen_dir(cluster),
            self.monthly_dir(cluster),
            self.users_dir(cluster),
            self.leaderboards_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Cluster names that have a monthly rollup directory, sorted.  Used by the leaderboard
    /// merge, which reads other clusters' subtrees read-only.

    pub fn clusters(&self) -> Vec<String> {
        let base = self.root.join("clusters");
        let mut out = vec![];
        if let Ok(rd) = base.read_dir() {
            for entry in rd.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if self.monthly_dir(name).is_dir() {
                        out.push(name.to_string());
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// Months with a rollup file in any cluster, sorted ascending.

    pub fn all_months(&self) -> Vec<Month> {
        let mut months = vec![];
        for cluster in self.clusters() {
            if let Ok(rd) = self.monthly_dir(&cluster).read_dir() {
                for entry in rd.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if let Some(stem) = name.strip_suffix(".json") {
                        if let Ok(m) = stem.parse::<Month>() {
                            if !months.contains(&m) {
                                months.push(m);
                            }
                        }
                    }
                }
            }
        }
        months.sort();
        months
    }

    /// Usernames with an aggregate file for this cluster.

    pub fn known_users(&self, cluster: &str) -> Vec<String> {
        let mut out = vec![];
        if let Ok(rd) = self.users_dir(cluster).read_dir() {
            for entry in rd.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(stem) = name.strip_suffix(".json") {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        out
    }
}

#[test]
fn test_layout_paths() {
    let l = Layout::new(Path::new("/srv/scoreboard"));
    let m = Month::new(2025, 8);
    assert_eq!(
        l.bloom_path("hammer", m),
        Path::new("/srv/scoreboard/clusters/hammer/state/seen/2025-08.bloom")
    );
    assert_eq!(
        l.monthly_path("hammer", m),
        Path::new("/srv/scoreboard/clusters/hammer/agg/rollups/monthly/2025-08.json")
    );
    assert_eq!(
        l.user_path("hammer", "alice"),
        Path::new("/srv/scoreboard/clusters/hammer/agg/users/alice.json")
    );
    assert_eq!(
        l.leaderboard_path("alltime", "clock_hours"),
        Path::new("/srv/scoreboard/leaderboards/alltime_clock_hours.json")
    );
}
