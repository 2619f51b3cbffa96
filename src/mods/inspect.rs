use anyhow::{ bail, Result };
use std::{ path::Path, sync::Arc };

use crate::{ log_info, Config };
use crate::logger::Logger;
use crate::mods::index::ReferenceIndex;

/// Inspect mode — build the reference index and report its shape, so a bad
/// fingerprint export is caught before anyone tries to match against it.
pub fn run_inspect(cfg: &Config, logger: Arc<Logger>) -> Result<()> {
    log_info!(logger, "track-align (inspect) starting…")?;

    if cfg.reference_path.is_empty() {
        bail!("--reference <PATH> is required in inspect mode");
    }

    let entries = crate::mods::index::parse_reference(Path::new(&cfg.reference_path), &logger)?;
    let total_hashes: usize = entries
        .iter()
        .map(|e| e.hashes.len())
        .sum();
    let index = ReferenceIndex::build(&entries, cfg.max_hash_occurrences)?;

    println!("Reference: {}", cfg.reference_path);
    println!("  covered seconds   : {}", entries.len());
    println!("  duration          : {} s", index.duration_s());
    println!("  hashes in file    : {}", total_hashes);
    println!("  distinct hashes   : {}", index.hash_count());
    println!("  common dropped    : {} (cap {})", index.dropped_common(), cfg.max_hash_occurrences);
    println!("  longest hash list : {}", index.max_list_len());
    let per_second = (total_hashes as f64) / (entries.len().max(1) as f64);
    println!("  hashes per second : {:.1}", per_second);

    logger.info(
        &format!(
            "Inspect: {} second(s), {} distinct hash(es), {} dropped, max list {}",
            entries.len(),
            index.hash_count(),
            index.dropped_common(),
            index.max_list_len()
        )
    )?;
    Ok(())
}
