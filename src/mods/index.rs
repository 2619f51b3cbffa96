use anyhow::Result;
use std::{
    collections::{ BTreeMap, HashMap },
    fs::File,
    io::{ BufRead, BufReader },
    path::Path,
};

use crate::logger::Logger;

/// One analysis window worth of fingerprint hashes from either stream.
/// Hashes are opaque 64-bit keys produced by the external DSP stage;
/// `time_ms` is the hash position inside the window, kept only for diagnostics.
#[derive(Clone, Debug)]
pub struct FingerprintEntry {
    pub timestamp_s: u32,
    pub hashes: Vec<(u64, u32)>,
}

impl FingerprintEntry {
    pub fn new(timestamp_s: u32, hashes: Vec<(u64, u32)>) -> Self {
        Self { timestamp_s, hashes }
    }
}

/// Immutable hash → sorted reference timestamps inverted index.
/// Built once per reference track; read-only afterwards, so concurrent
/// sessions can share it behind an `Arc` without locking.
pub struct ReferenceIndex {
    map: HashMap<u64, Vec<u32>>,
    duration_s: u32,
    dropped_common: usize,
}

impl ReferenceIndex {
    /// Scan the full reference fingerprint set once, then drop every hash
    /// that occurs more than `max_occurrences` times — such hashes are too
    /// generic and would flood the offset histogram with false correlations.
    pub fn build(entries: &[FingerprintEntry], max_occurrences: u32) -> Result<Self> {
        if entries.is_empty() {
            anyhow::bail!("reference fingerprint set is empty; cannot build index");
        }

        let mut map: HashMap<u64, Vec<u32>> = HashMap::new();
        let mut duration_s = 0u32;
        let mut total_hashes = 0usize;

        for e in entries {
            duration_s = duration_s.max(e.timestamp_s + 1);
            for &(hash, _ms) in &e.hashes {
                map.entry(hash).or_default().push(e.timestamp_s);
                total_hashes += 1;
            }
        }

        if total_hashes == 0 {
            anyhow::bail!("reference fingerprint set contains no hashes; cannot build index");
        }

        let before = map.len();
        map.retain(|_, ts| ts.len() <= (max_occurrences as usize));
        let dropped_common = before - map.len();

        if map.is_empty() {
            anyhow::bail!(
                "commonness cap {} removed every hash ({} total); index would be empty",
                max_occurrences,
                before
            );
        }

        for ts in map.values_mut() {
            ts.sort_unstable();
        }

        Ok(Self { map, duration_s, dropped_common })
    }

    pub fn lookup(&self, hash: u64) -> Option<&[u32]> {
        self.map.get(&hash).map(|v| v.as_slice())
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.map.contains_key(&hash)
    }

    /// Number of distinct hashes kept after the commonness cap.
    pub fn hash_count(&self) -> usize {
        self.map.len()
    }

    /// Number of distinct hashes removed by the commonness cap.
    pub fn dropped_common(&self) -> usize {
        self.dropped_common
    }

    /// Reference length in whole seconds (last entry timestamp + 1).
    pub fn duration_s(&self) -> u32 {
        self.duration_s
    }

    /// Longest timestamp list among kept hashes (inspect diagnostics).
    pub fn max_list_len(&self) -> usize {
        self.map
            .values()
            .map(|v| v.len())
            .max()
            .unwrap_or(0)
    }
}

pub fn parse_hash(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim(), 16).ok()
}

/// Load the reference fingerprint CSV: header `timestamp_s,hash,time_ms`,
/// one row per hash occurrence. Malformed rows are fatal — a broken
/// reference file means no matching is possible at all.
pub fn parse_reference(csv_path: &Path, logger: &Logger) -> Result<Vec<FingerprintEntry>> {
    let file = File::open(csv_path)?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    // header
    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("reference file {} is empty", csv_path.display()))??;
    let cols: Vec<&str> = header.split(',').collect();
    let idx = |name: &str| -> Option<usize> { cols.iter().position(|c| c.trim() == name) };

    let i_ts = idx("timestamp_s").ok_or_else(||
        anyhow::anyhow!("reference file missing 'timestamp_s' column")
    )?;
    let i_hash = idx("hash").ok_or_else(|| anyhow::anyhow!("reference file missing 'hash' column"))?;
    let i_ms = idx("time_ms").ok_or_else(||
        anyhow::anyhow!("reference file missing 'time_ms' column")
    )?;

    let mut by_ts: BTreeMap<u32, Vec<(u64, u32)>> = BTreeMap::new();
    let mut row = 1usize;

    for line in lines {
        row += 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() <= i_ts.max(i_hash).max(i_ms) {
            anyhow::bail!("reference file row {}: too few columns", row);
        }

        let ts: u32 = parts[i_ts]
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("reference file row {}: bad timestamp_s", row))?;
        let hash = parse_hash(parts[i_hash]).ok_or_else(||
            anyhow::anyhow!("reference file row {}: bad hash", row)
        )?;
        let ms: u32 = parts[i_ms]
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("reference file row {}: bad time_ms", row))?;

        by_ts.entry(ts).or_default().push((hash, ms));
    }

    if by_ts.is_empty() {
        anyhow::bail!("reference file {} has no data rows", csv_path.display());
    }

    let entries: Vec<FingerprintEntry> = by_ts
        .into_iter()
        .map(|(ts, hashes)| FingerprintEntry::new(ts, hashes))
        .collect();

    let _ = logger.debug(
        &format!("Parsed {} reference entries from {}", entries.len(), csv_path.display())
    );
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: u32, hashes: &[u64]) -> FingerprintEntry {
        FingerprintEntry::new(
            ts,
            hashes
                .iter()
                .map(|&h| (h, 0u32))
                .collect()
        )
    }

    #[test]
    fn build_is_deterministic() {
        let entries: Vec<FingerprintEntry> = (0..50)
            .map(|t| entry(t, &[t as u64 * 7 + 1, t as u64 * 7 + 2, 0xdead]))
            .collect();

        let a = ReferenceIndex::build(&entries, 100).unwrap();
        let b = ReferenceIndex::build(&entries, 100).unwrap();

        assert_eq!(a.hash_count(), b.hash_count());
        assert_eq!(a.duration_s(), b.duration_s());
        for t in 0..50u64 {
            for h in [t * 7 + 1, t * 7 + 2, 0xdead] {
                assert_eq!(a.lookup(h), b.lookup(h));
            }
        }
    }

    #[test]
    fn timestamp_lists_are_sorted_ascending() {
        // insert out of order on purpose
        let entries = vec![entry(9, &[42]), entry(3, &[42]), entry(7, &[42]), entry(1, &[42])];
        let idx = ReferenceIndex::build(&entries, 10).unwrap();
        assert_eq!(idx.lookup(42), Some(&[1u32, 3, 7, 9][..]));
    }

    #[test]
    fn common_hashes_are_fully_filtered() {
        // hash 5 occurs five times; cap of 2 must remove it entirely
        let entries = vec![
            entry(0, &[5, 10]),
            entry(1, &[5, 11]),
            entry(2, &[5, 12]),
            entry(3, &[5, 13]),
            entry(4, &[5, 14])
        ];
        let idx = ReferenceIndex::build(&entries, 2).unwrap();
        assert!(!idx.contains(5));
        assert_eq!(idx.dropped_common(), 1);
        assert!(idx.contains(10));
        assert_eq!(idx.hash_count(), 5);
    }

    #[test]
    fn empty_input_fails_construction() {
        assert!(ReferenceIndex::build(&[], 30).is_err());
        let no_hashes = vec![entry(0, &[]), entry(1, &[])];
        assert!(ReferenceIndex::build(&no_hashes, 30).is_err());
    }
}
