use anyhow::{ bail, Result };
use std::{ path::Path, sync::Arc };

use crate::{ log_info, Config };
use crate::logger::Logger;
use crate::mods::{ index::ReferenceIndex, regions, replay::parse_live_capture, scorer };

/// Lookup mode — score an entire recorded capture as one window against
/// the reference and print the full decision, gates and runner-up included.
/// Useful for answering "would this capture ever match?" without replaying
/// it second by second.
pub fn run_lookup(cfg: &Config, logger: Arc<Logger>) -> Result<()> {
    log_info!(logger, "track-align (lookup) starting…")?;

    if cfg.reference_path.is_empty() {
        bail!("--reference <PATH> is required in lookup mode");
    }
    if cfg.live_path.is_empty() {
        bail!("--live <PATH> is required in lookup mode");
    }

    let entries = crate::mods::index::parse_reference(Path::new(&cfg.reference_path), &logger)?;
    let index = Arc::new(ReferenceIndex::build(&entries, cfg.max_hash_occurrences)?);

    let quanta = parse_live_capture(Path::new(&cfg.live_path), &logger)?;
    let live: Vec<crate::mods::index::FingerprintEntry> = quanta
        .iter()
        .map(|q| crate::mods::index::FingerprintEntry::new(q.timestamp_s, q.hashes.clone()))
        .collect();

    let score = cfg.score_params();
    let search = cfg.search_params();
    let decision = regions::match_window(&live, &index, &search, &score);
    let concentration = scorer::global_concentration(&live, &index, score.cluster_tolerance_s);

    println!("Reference: {} ({} s, {} distinct hashes, {} common dropped)",
        cfg.reference_path,
        index.duration_s(),
        index.hash_count(),
        index.dropped_common());
    let total_live_hashes: usize = live
        .iter()
        .map(|e| e.hashes.len())
        .sum();
    let known_hashes: usize = live
        .iter()
        .flat_map(|e| e.hashes.iter())
        .filter(|&&(h, _)| index.contains(h))
        .count();

    println!("Live:      {} ({} second(s))", cfg.live_path, live.len());
    println!("  hashes known to the reference: {} / {}", known_hashes, total_live_hashes);
    println!();

    if decision.is_matched {
        println!("MATCH at reference offset {} s", decision.offset_s);
    } else {
        let reason = decision.reject.map(|r| r.as_str()).unwrap_or("not matched");
        println!("NO MATCH ({})", reason);
    }
    println!("  index hits       : {}", decision.total_matches);
    println!("  confidence       : {:.4}", decision.confidence);
    println!("  dominance        : {}", if decision.dominance.is_finite() {
        format!("{:.2}", decision.dominance)
    } else {
        "unchallenged".to_string()
    });
    println!("  density          : {:.5}", decision.density);
    println!("  consistency      : {:.3}", decision.consistency);
    println!("  concentration    : {:.3}", concentration);
    for (i, c) in decision.candidates.iter().enumerate() {
        println!(
            "  candidate #{}     : offset={} raw={} clustered={} consistency={:.3} score={:.1}",
            i + 1,
            c.offset_s,
            c.raw_count,
            c.clustered_count,
            c.consistency,
            c.final_score
        );
    }

    log_info!(
        logger,
        "Lookup: matched={} offset={} confidence={:.4} dominance={:.2} density={:.5} consistency={:.3}",
        decision.is_matched,
        decision.offset_s,
        decision.confidence,
        decision.dominance,
        decision.density,
        decision.consistency
    )?;
    Ok(())
}
