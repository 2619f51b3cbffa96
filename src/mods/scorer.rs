use std::collections::{ BTreeMap, HashMap, HashSet };

use crate::mods::index::{ FingerprintEntry, ReferenceIndex };
use crate::mods::regions::RegionMask;

/// Tunables for one scoring pass (lifted out of `crate::Config` so the
/// scorer stays a pure function over its inputs).
#[derive(Clone, Debug)]
pub struct ScoreParams {
    pub cluster_tolerance_s: i32,
    pub consistency_weight: f64,
    pub min_dominance_ratio: f64,
    pub min_density: f64,
    pub min_consistency: f64,
    pub min_window_entries: usize,
}

/// One clustered offset candidate with its scoring breakdown.
#[derive(Clone, Debug)]
pub struct OffsetCandidate {
    pub offset_s: i32,
    pub raw_count: u32,
    pub clustered_count: u32,
    pub consistency: f64,
    pub final_score: f64,
}

/// Why a window was rejected. Rejections are values, never errors —
/// ambiguous evidence is a normal outcome of scoring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientData,
    NoCandidates,
    LowDominance,
    LowDensity,
    LowConsistency,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InsufficientData => "insufficient-data",
            RejectReason::NoCandidates => "no-candidates",
            RejectReason::LowDominance => "low-dominance",
            RejectReason::LowDensity => "low-density",
            RejectReason::LowConsistency => "low-consistency",
        }
    }
}

/// Full decision with diagnostics populated on accept AND reject, so
/// callers can log near-misses and tune thresholds.
#[derive(Clone, Debug)]
pub struct MatchDecision {
    pub is_matched: bool,
    pub offset_s: i32,
    /// Clustered-match concentration: top cluster count / all valid matches.
    pub confidence: f64,
    /// Top candidate final score over runner-up final score.
    pub dominance: f64,
    /// Top candidate raw count / all valid matches.
    pub density: f64,
    /// Temporal consistency of the top candidate.
    pub consistency: f64,
    /// All (hash, live-ts, ref-ts) matches accumulated for this window.
    pub total_matches: u32,
    /// Top two candidates by final score, best first.
    pub candidates: Vec<OffsetCandidate>,
    pub reject: Option<RejectReason>,
}

impl MatchDecision {
    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            is_matched: false,
            offset_s: 0,
            confidence: 0.0,
            dominance: 0.0,
            density: 0.0,
            consistency: 0.0,
            total_matches: 0,
            candidates: Vec::new(),
            reject: Some(reason),
        }
    }
}

struct Cluster {
    offset_s: i32,
    raw_count: u32,
    clustered_count: u32,
}

/// Score a batch of live entries against the index (optionally restricted
/// to a region mask) and decide whether one reference offset dominates.
///
/// 1. offset histogram over every (hash, liveTs, refTs) match,
/// 2. greedy clustering of neighboring offsets (highest raw count first),
/// 3. temporal-consistency bonus per candidate,
/// 4. dominance / density / consistency gates.
pub fn score_window(
    entries: &[FingerprintEntry],
    index: &ReferenceIndex,
    mask: Option<&RegionMask>,
    p: &ScoreParams
) -> MatchDecision {
    if entries.len() < p.min_window_entries {
        return MatchDecision::rejected(RejectReason::InsufficientData);
    }

    // 1) raw offset histogram + per-live-timestamp contributed offsets
    let mut raw: HashMap<i32, u32> = HashMap::new();
    let mut per_ts: BTreeMap<u32, Vec<i32>> = BTreeMap::new();
    let mut total: u32 = 0;

    for e in entries {
        for &(hash, _ms) in &e.hashes {
            let Some(ref_ts) = index.lookup(hash) else {
                continue;
            };
            for &ref_t in ref_ts {
                if let Some(m) = mask {
                    if !m.contains(ref_t) {
                        continue;
                    }
                }
                let off = (ref_t as i64) - (e.timestamp_s as i64);
                let off = off as i32;
                *raw.entry(off).or_insert(0) += 1;
                per_ts.entry(e.timestamp_s).or_default().push(off);
                total += 1;
            }
        }
    }

    if total == 0 {
        return MatchDecision::rejected(RejectReason::NoCandidates);
    }

    // 2) greedy clustering: highest raw count claims its ±tolerance
    // neighborhood; each offset belongs to exactly one cluster.
    let mut by_count: Vec<(i32, u32)> = raw
        .iter()
        .map(|(&o, &c)| (o, c))
        .collect();
    by_count.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut claimed: HashSet<i32> = HashSet::new();
    let mut clusters: Vec<Cluster> = Vec::new();
    for &(off, cnt) in &by_count {
        if claimed.contains(&off) {
            continue;
        }
        claimed.insert(off);
        let mut sum = cnt;
        for d in 1..=p.cluster_tolerance_s {
            for neighbor in [off - d, off + d] {
                if claimed.contains(&neighbor) {
                    continue;
                }
                if let Some(&c) = raw.get(&neighbor) {
                    claimed.insert(neighbor);
                    sum += c;
                }
            }
        }
        clusters.push(Cluster { offset_s: off, raw_count: cnt, clustered_count: sum });
    }

    // 3) consistency: longest consecutive run of live timestamps supporting
    // the candidate, over ALL distinct live timestamps in the window.
    let mut all_ts: Vec<u32> = entries
        .iter()
        .map(|e| e.timestamp_s)
        .collect();
    all_ts.sort_unstable();
    all_ts.dedup();
    let n_ts = all_ts.len().max(1);

    let mut candidates: Vec<OffsetCandidate> = clusters
        .iter()
        .map(|c| {
            let mut best_run = 0usize;
            let mut run = 0usize;
            for ts in &all_ts {
                let present = per_ts
                    .get(ts)
                    .map(|offs| offs.iter().any(|&o| (o - c.offset_s).abs() <= p.cluster_tolerance_s))
                    .unwrap_or(false);
                if present {
                    run += 1;
                    best_run = best_run.max(run);
                } else {
                    run = 0;
                }
            }
            let consistency = (best_run as f64) / (n_ts as f64);
            let final_score = (c.clustered_count as f64) * (1.0 + p.consistency_weight * consistency);
            OffsetCandidate {
                offset_s: c.offset_s,
                raw_count: c.raw_count,
                clustered_count: c.clustered_count,
                consistency,
                final_score,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.offset_s.cmp(&b.offset_s))
    });
    candidates.truncate(2);

    let top = candidates[0].clone();
    let runner_up_score = candidates.get(1).map(|c| c.final_score).unwrap_or(0.0);

    // 4) decision gates — all must pass.
    let dominance = if runner_up_score > 0.0 {
        top.final_score / runner_up_score
    } else {
        f64::INFINITY
    };
    let density = (top.raw_count as f64) / (total as f64);
    let confidence = ((top.clustered_count as f64) / (total as f64)).min(1.0);

    let reject = if dominance < p.min_dominance_ratio {
        Some(RejectReason::LowDominance)
    } else if density < p.min_density {
        Some(RejectReason::LowDensity)
    } else if top.consistency < p.min_consistency {
        Some(RejectReason::LowConsistency)
    } else {
        None
    };

    MatchDecision {
        is_matched: reject.is_none(),
        offset_s: top.offset_s,
        confidence,
        dominance,
        density,
        consistency: top.consistency,
        total_matches: total,
        candidates,
        reject,
    }
}

/// Cheap whole-window concentration: fraction of all matches falling within
/// ±tolerance of the single best raw offset. Used by the coarse-to-fine
/// early exit to confirm that a locally confident region is not sitting on
/// top of a globally ambiguous window.
pub fn global_concentration(
    entries: &[FingerprintEntry],
    index: &ReferenceIndex,
    cluster_tolerance_s: i32
) -> f64 {
    let mut raw: HashMap<i32, u32> = HashMap::new();
    let mut total: u64 = 0;

    for e in entries {
        for &(hash, _ms) in &e.hashes {
            let Some(ref_ts) = index.lookup(hash) else {
                continue;
            };
            for &ref_t in ref_ts {
                let off = ((ref_t as i64) - (e.timestamp_s as i64)) as i32;
                *raw.entry(off).or_insert(0) += 1;
                total += 1;
            }
        }
    }

    if total == 0 {
        return 0.0;
    }

    let best = raw
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(&o, _)| o)
        .unwrap_or(0);

    let mut near: u64 = 0;
    for d in -cluster_tolerance_s..=cluster_tolerance_s {
        if let Some(&c) = raw.get(&(best + d)) {
            near += c as u64;
        }
    }
    (near as f64) / (total as f64)
}
