use std::collections::HashMap;

use crate::mods::index::{ FingerprintEntry, ReferenceIndex };
use crate::mods::scorer::{ self, MatchDecision, ScoreParams };

/// Coarse-to-fine search tunables.
#[derive(Clone, Debug)]
pub struct SearchParams {
    pub region_size_s: u32,
    pub top_candidate_regions: usize,
    pub early_exit_confidence: f64,
    pub early_exit_concentration: f64,
}

/// Union of reference-time spans the fine pass is allowed to consult.
/// Spans are sorted, padded and merged at construction, so membership is a
/// binary search over disjoint intervals.
pub struct RegionMask {
    spans: Vec<(u32, u32)>, // inclusive [start_s, end_s]
}

impl RegionMask {
    /// Build from coarse region indices. Each region covers
    /// `[r * region_size, (r+1) * region_size)` seconds, padded by `pad_s`
    /// on both sides so clusters straddling a boundary are not lost.
    pub fn from_regions(regions: &[u32], region_size_s: u32, pad_s: u32) -> Self {
        let mut spans: Vec<(u32, u32)> = regions
            .iter()
            .map(|&r| {
                let start = (r * region_size_s).saturating_sub(pad_s);
                let end = (r + 1) * region_size_s - 1 + pad_s;
                (start, end)
            })
            .collect();
        spans.sort_unstable();

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(spans.len());
        for (s, e) in spans {
            match merged.last_mut() {
                Some(last) if s <= last.1 + 1 => {
                    last.1 = last.1.max(e);
                }
                _ => merged.push((s, e)),
            }
        }
        Self { spans: merged }
    }

    pub fn contains(&self, t: u32) -> bool {
        let i = self.spans.partition_point(|&(s, _)| s <= t);
        if i == 0 {
            return false;
        }
        t <= self.spans[i - 1].1
    }
}

/// Two-phase search: rank fixed-size reference regions by raw hit count,
/// score precisely inside the top candidates, and only fall back to the
/// full unrestricted scorer when the restricted result is not confidently
/// confirmed by the whole window.
pub fn match_window(
    entries: &[FingerprintEntry],
    index: &ReferenceIndex,
    sp: &SearchParams,
    p: &ScoreParams
) -> MatchDecision {
    // Coarse pass: O(matches) region bucketing, no clustering.
    let mut hits: HashMap<u32, u32> = HashMap::new();
    for e in entries {
        for &(hash, _ms) in &e.hashes {
            let Some(ref_ts) = index.lookup(hash) else {
                continue;
            };
            for &ref_t in ref_ts {
                *hits.entry(ref_t / sp.region_size_s).or_insert(0) += 1;
            }
        }
    }

    if hits.is_empty() {
        // nothing to narrow down to; the full scorer will report NoCandidates
        return scorer::score_window(entries, index, None, p);
    }

    let mut ranked: Vec<(u32, u32)> = hits
        .iter()
        .map(|(&r, &c)| (r, c))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(sp.top_candidate_regions);

    let regions: Vec<u32> = ranked
        .iter()
        .map(|&(r, _)| r)
        .collect();
    let pad = p.cluster_tolerance_s.max(0) as u32;
    let mask = RegionMask::from_regions(&regions, sp.region_size_s, pad);

    // Fine pass restricted to the candidate regions.
    let fine = scorer::score_window(entries, index, Some(&mask), p);

    // Early exit needs BOTH a confident region-local result and a
    // concentrated whole-window histogram; a locally dominant region can
    // still be a false positive when the window is globally ambiguous.
    if fine.is_matched && fine.confidence >= sp.early_exit_confidence {
        let concentration = scorer::global_concentration(entries, index, p.cluster_tolerance_s);
        if concentration >= sp.early_exit_concentration {
            return fine;
        }
    }

    scorer::score_window(entries, index, None, p)
}
