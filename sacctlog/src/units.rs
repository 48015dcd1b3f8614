// Unit parsing for sacct memory fields and the AllocTRES resource string.
//
// All memory conversions are base-10 per site policy: K = 10^3 bytes, M = 10^6, G = 10^9,
// T = 10^12, and the result unit is megabytes (10^6 bytes).  A bare number is already MB.

/// Parse a memory string like "1024K", "400M", "2G", "1.5T" or "4000" into base-10 MB.  Returns
/// None if the string is empty or not a number with an optional K/M/G/T suffix.

pub fn parse_mem_mb(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, suffix) = match s.char_indices().last().unwrap() {
        (i, c) if c.is_ascii_alphabetic() => (&s[..i], Some(c.to_ascii_uppercase())),
        _ => (s, None),
    };
    let value = num.parse::<f64>().ok()?;
    let bytes = match suffix {
        None | Some('M') => value * 1e6,
        Some('K') => value * 1e3,
        Some('G') => value * 1e9,
        Some('T') => value * 1e12,
        Some(_) => return None,
    };
    Some(bytes / 1e6)
}

/// Parse a ReqMem string into the job's total requested MB.  A trailing 'c' scopes the value
/// per CPU, a trailing 'n' (or no scope suffix) per node.

pub fn parse_reqmem_mb(s: &str, alloc_cpus: u32, nnodes: u32) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (core, per_cpu) = match s.char_indices().last().unwrap() {
        (i, 'c') | (i, 'C') => (&s[..i], true),
        (i, 'n') | (i, 'N') => (&s[..i], false),
        _ => (s, false),
    };
    let mb = parse_mem_mb(core)?;
    if per_cpu {
        Some(mb * alloc_cpus as f64)
    } else {
        Some(mb * nnodes as f64)
    }
}

/// Sum the GPU counts in an AllocTRES string: every comma-separated token of the form
/// "gres/gpu=<n>" or "gres/gpu:<type>=<n>" contributes n.  Anything else is ignored.

pub fn gpu_count_from_tres(alloc_tres: &str) -> u32 {
    let mut total = 0;
    for token in alloc_tres.split(',') {
        let mut parts = token.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        if key != "gres/gpu" && !key.starts_with("gres/gpu:") {
            continue;
        }
        if let Some(count) = parts.next() {
            if let Ok(n) = count.trim().parse::<u32>() {
                total += n;
            }
        }
    }
    total
}

/// Lowercase a user name and strip any "@realm" suffix.

pub fn normalize_username(user: &str) -> String {
    let user = user.trim();
    let bare = match user.find('@') {
        Some(i) => &user[..i],
        None => user,
    };
    bare.to_lowercase()
}

#[test]
fn test_parse_mem_mb() {
    assert_eq!(parse_mem_mb("1024K").unwrap(), 1.024);
    assert_eq!(parse_mem_mb("1G").unwrap(), 1000.0);
    assert_eq!(parse_mem_mb("1T").unwrap(), 1000000.0);
    assert_eq!(parse_mem_mb("400M").unwrap(), 400.0);
    assert_eq!(parse_mem_mb("4000").unwrap(), 4000.0);
    assert_eq!(parse_mem_mb("1.5G").unwrap(), 1500.0);
    assert_eq!(parse_mem_mb(" 2G ").unwrap(), 2000.0);
    assert!(parse_mem_mb("").is_none());
    assert!(parse_mem_mb("0n").is_none());
    assert!(parse_mem_mb("xyzzy").is_none());
    assert!(parse_mem_mb("12Q").is_none());
}

#[test]
fn test_parse_reqmem_mb() {
    // 4000 MB per CPU across 8 CPUs
    assert_eq!(parse_reqmem_mb("4000Mc", 8, 1).unwrap(), 32000.0);
    // 64 GB per node across 2 nodes
    assert_eq!(parse_reqmem_mb("64Gn", 1, 2).unwrap(), 128000.0);
    // No scope suffix means per node
    assert_eq!(parse_reqmem_mb("8G", 1, 2).unwrap(), 16000.0);
    assert_eq!(parse_reqmem_mb("4000Mc", 4, 1).unwrap(), 16000.0);
    assert_eq!(parse_reqmem_mb("8Gn", 2, 1).unwrap(), 8000.0);
    assert!(parse_reqmem_mb("", 4, 1).is_none());
    assert!(parse_reqmem_mb("junkc", 4, 1).is_none());
}

#[test]
fn test_gpu_count_from_tres() {
    assert_eq!(gpu_count_from_tres("cpu=8,mem=32000M,gres/gpu=4"), 4);
    assert_eq!(gpu_count_from_tres("gres/gpu:a100=2,gres/gpu=1"), 3);
    assert_eq!(gpu_count_from_tres("gres/gpu:v100=2"), 2);
    assert_eq!(gpu_count_from_tres("billing=4,cpu=4"), 0);
    assert_eq!(gpu_count_from_tres(""), 0);
    // A gres/gpumem token must not be counted as GPUs.
    assert_eq!(gpu_count_from_tres("gres/gpumem=8000,gres/gpu=1"), 1);
    assert_eq!(gpu_count_from_tres("gres/gpu=junk"), 0);
}

#[test]
fn test_normalize_username() {
    assert_eq!(normalize_username("Alice"), "alice");
    assert_eq!(normalize_username("bob@EXAMPLE.ORG"), "bob");
    assert_eq!(normalize_username(" carol "), "carol");
    assert_eq!(normalize_username("dave@"), "dave");
}
