// Atomic file persistence and recovery helpers.
//
// The universal write pattern is write-to-"<name>.tmp"-in-the-same-directory, then rename over
// the final name.  rename(2) on one filesystem is atomic, so readers (and a poller killed at
// any instant) see either the old file or the new one, never a torn write.  A failed write
// leaves the temp in place; the next tick's sweep removes it.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn bad_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bad");
    PathBuf::from(name)
}

pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {}", path.display()))?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    atomic_write(path, &serde_json::to_vec(value)?)
}

#[derive(Debug)]
pub enum LoadOutcome<T> {
    Missing,
    Valid(T),
    /// The file existed but could not be decoded; it has been renamed to "<name>.bad".
    Quarantined,
}

/// Read a JSON document, quarantining it on decode failure so a corrupt file can never wedge
/// the poller.  I/O errors other than not-found propagate.

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<LoadOutcome<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LoadOutcome::Missing),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    match serde_json::from_slice::<T>(&bytes) {
        Ok(v) => Ok(LoadOutcome::Valid(v)),
        Err(_) => {
            quarantine(path)?;
            Ok(LoadOutcome::Quarantined)
        }
    }
}

/// Rename a damaged file to "<name>.bad".  Returns false if the file was already gone.

pub fn quarantine(path: &Path) -> Result<bool> {
    match fs::rename(path, bad_path(path)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("quarantining {}", path.display())),
    }
}

/// Recursively delete stale "*.tmp" files left by a crashed writer.  Returns the number
/// removed.  Missing directories are fine (first tick of a new cluster).

pub fn sweep_tmp(dir: &Path) -> Result<usize> {
    let rd = match dir.read_dir() {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("sweeping {}", dir.display())),
    };
    let mut removed = 0;
    for entry in rd {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            removed += sweep_tmp(&path)?;
        } else if path.extension().is_some_and(|e| e == "tmp") {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
use serde::Deserialize;

#[cfg(test)]
#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Doc {
    x: u32,
}

#[test]
fn test_write_and_load_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    assert!(matches!(
        load_json::<Doc>(&path).unwrap(),
        LoadOutcome::Missing
    ));
    write_json(&path, &Doc { x: 7 }).unwrap();
    match load_json::<Doc>(&path).unwrap() {
        LoadOutcome::Valid(d) => assert_eq!(d, Doc { x: 7 }),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!tmp_path(&path).exists());
}

#[test]
fn test_load_json_quarantines_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    fs::write(&path, b"{not json").unwrap();
    assert!(matches!(
        load_json::<Doc>(&path).unwrap(),
        LoadOutcome::Quarantined
    ));
    assert!(!path.exists());
    assert!(dir.path().join("doc.json.bad").exists());
}

#[test]
fn test_sweep_tmp() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("a/b");
    fs::create_dir_all(&sub).unwrap();
    fs::write(sub.join("x.json.tmp"), b"x").unwrap();
    fs::write(sub.join("y.json"), b"y").unwrap();
    fs::write(dir.path().join("z.bloom.tmp"), b"z").unwrap();
    assert_eq!(sweep_tmp(dir.path()).unwrap(), 2);
    assert!(sub.join("y.json").exists());
    assert!(!sub.join("x.json.tmp").exists());
    assert_eq!(sweep_tmp(dir.path().join("missing").as_path()).unwrap(), 0);
}
