// Per-(cluster, month) dedupe set: a bloom filter over JobID strings, persisted as a small
// binary header plus the raw bit array.  Membership may report a false positive with
// probability ~p but never a false negative, which is the property re-ingest idempotence
// rests on.
//
// Sizing: m = -n ln(p) / ln(2)^2 bits and k = (m/n) ln(2) hash functions for an expected
// capacity n.  The filter is never grown; monthly partitioning bounds n, and exceeding the
// capacity hint only degrades p.
//
// Hashing is double hashing over a SHA-256 digest of the JobID: the first two little-endian
// u64 words give h1 and h2, and bit i is (h1 + i*h2) mod m.  This is deterministic across
// hosts and architectures, which matters because the files live on a shared filesystem.
//
// File layout, little-endian: magic "SBLM", version u32, m u64, k u32, n u64, p f64, then
// ceil(m/8) bytes of bits.

use crate::fsutil;
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_EXPECTED_JOBS: u64 = 2_000_000;
pub const DEFAULT_P: f64 = 1e-4;

const MAGIC: [u8; 4] = *b"SBLM";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8 + 8;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("dedupe file corrupt: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct DedupeSet {
    m: u64,
    k: u32,
    n: u64,
    p: f64,
    bits: Vec<u8>,
}

impl DedupeSet {
    pub fn create(expected_jobs: u64, p: f64) -> DedupeSet {
        let (m, k) = derive_m_k(expected_jobs, p);
        DedupeSet {
            m,
            k,
            n: 0,
            p,
            bits: vec![0u8; m.div_ceil(8) as usize],
        }
    }

    /// Number of distinct JobIDs inserted (approximate once collisions occur).

    pub fn inserted(&self) -> u64 {
        self.n
    }

    pub fn contains(&self, job_id: &str) -> bool {
        let (h1, h2) = hash_pair(job_id);
        (0..self.k).all(|i| self.get_bit(index(h1, h2, i, self.m)))
    }

    /// Insert a JobID; returns whether it was (apparently) already present.  From the point of
    /// view of a single locked poller this is an atomic contains-then-set.

    pub fn add(&mut self, job_id: &str) -> bool {
        let (h1, h2) = hash_pair(job_id);
        let mut was_present = true;
        for i in 0..self.k {
            let idx = index(h1, h2, i, self.m);
            if !self.get_bit(idx) {
                was_present = false;
                self.set_bit(idx);
            }
        }
        if !was_present {
            self.n += 1;
        }
        was_present
    }

    pub fn load(path: &Path) -> Result<Option<DedupeSet>, BloomError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < HEADER_LEN {
            return Err(BloomError::Corrupt("truncated header"));
        }
        if bytes[0..4] != MAGIC {
            return Err(BloomError::Corrupt("bad magic"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(BloomError::Corrupt("unknown version"));
        }
        let m = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let k = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let n = u64::from_le_bytes(bytes[20..28].try_into().unwrap());
        let p = f64::from_le_bytes(bytes[28..36].try_into().unwrap());
        if m == 0 || k == 0 {
            return Err(BloomError::Corrupt("zero geometry"));
        }
        let body = &bytes[HEADER_LEN..];
        if body.len() as u64 != m.div_ceil(8) {
            return Err(BloomError::Corrupt("truncated bit array"));
        }
        Ok(Some(DedupeSet {
            m,
            k,
            n,
            p,
            bits: body.to_vec(),
        }))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.bits.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.m.to_le_bytes());
        bytes.extend_from_slice(&self.k.to_le_bytes());
        bytes.extend_from_slice(&self.n.to_le_bytes());
        bytes.extend_from_slice(&self.p.to_le_bytes());
        bytes.extend_from_slice(&self.bits);
        fsutil::atomic_write(path, &bytes)
    }

    fn get_bit(&self, idx: u64) -> bool {
        self.bits[(idx >> 3) as usize] & (1 << (idx & 7)) != 0
    }

    fn set_bit(&mut self, idx: u64) {
        self.bits[(idx >> 3) as usize] |= 1 << (idx & 7);
    }
}

fn derive_m_k(expected_jobs: u64, p: f64) -> (u64, u32) {
    let n = f64::max(expected_jobs as f64, 1.0);
    let ln2 = std::f64::consts::LN_2;
    let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
    let k = ((m as f64 / n) * ln2).round().max(1.0) as u32;
    (m, k)
}

fn hash_pair(job_id: &str) -> (u64, u64) {
    let digest = Sha256::digest(job_id.as_bytes());
    let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
    let mut h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
    if h2 == 0 {
        // A zero stride would probe a single bit k times.
        h2 = 0x9e3779b97f4a7c15;
    }
    (h1, h2)
}

fn index(h1: u64, h2: u64, i: u32, m: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % m
}

#[test]
fn test_derive_m_k() {
    let (m, k) = derive_m_k(2_000_000, 1e-4);
    // ~19.17 bits and ~13.3 hashes per element at p = 1e-4.
    assert!(m > 38_000_000 && m < 39_000_000);
    assert_eq!(k, 13);
    let (m, k) = derive_m_k(0, 1e-4);
    assert!(m >= 8);
    assert!(k >= 1);
}

#[test]
fn test_membership_no_false_negatives() {
    let mut set = DedupeSet::create(10_000, 1e-4);
    for i in 0..5_000 {
        let id = format!("job-{i}");
        assert!(!set.add(&id), "{id} reported present before insertion");
    }
    for i in 0..5_000 {
        assert!(set.contains(&format!("job-{i}")));
    }
    assert_eq!(set.inserted(), 5_000);
}

#[test]
fn test_add_reports_presence() {
    let mut set = DedupeSet::create(1_000, 1e-4);
    assert!(!set.add("12345"));
    assert!(set.add("12345"));
    assert!(set.contains("12345"));
    assert_eq!(set.inserted(), 1);
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2025-08.bloom");
    let mut set = DedupeSet::create(1_000, 1e-4);
    set.add("1");
    set.add("2");
    set.save(&path).unwrap();
    let loaded = DedupeSet::load(&path).unwrap().unwrap();
    assert_eq!(loaded.inserted(), 2);
    assert!(loaded.contains("1"));
    assert!(loaded.contains("2"));
    assert_eq!(loaded.m, set.m);
    assert_eq!(loaded.k, set.k);
}

#[test]
fn test_load_missing_and_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2025-08.bloom");
    assert!(DedupeSet::load(&path).unwrap().is_none());
    fs::write(&path, b"BOGUS data").unwrap();
    assert!(matches!(
        DedupeSet::load(&path),
        Err(BloomError::Corrupt(_))
    ));
    // Truncated body.
    let mut set_bytes = Vec::new();
    let set = DedupeSet::create(1_000, 1e-4);
    set.save(&path).unwrap();
    set_bytes.extend_from_slice(&fs::read(&path).unwrap()[..HEADER_LEN + 3]);
    fs::write(&path, &set_bytes).unwrap();
    assert!(matches!(
        DedupeSet::load(&path),
        Err(BloomError::Corrupt("truncated bit array"))
    ));
}
