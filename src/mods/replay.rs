use anyhow::{ bail, Context, Result };
use crossbeam_channel::bounded;
use std::{
    collections::BTreeMap,
    fs::{ File, OpenOptions },
    io::{ BufRead, BufReader, Write },
    path::Path,
    sync::{ atomic::{ AtomicBool, Ordering }, Arc },
    thread,
};

use crate::{ log_info, Config };
use crate::logger::Logger;
use crate::mods::{
    index::{ parse_hash, FingerprintEntry, ReferenceIndex },
    pipeline::QuantumOutcome,
    session::{ run_session, FingerprintGenerator },
};

/// One second of a recorded live capture: measured level plus the hashes
/// that second produced (possibly none).
#[derive(Clone, Debug)]
pub struct CaptureQuantum {
    pub timestamp_s: u32,
    pub rms: f32,
    pub hashes: Vec<(u64, u32)>,
}

/// Parse a live-capture CSV (`timestamp_s,rms,hash,time_ms`; one row per
/// hash, with `-` in the hash column for quanta that produced none).
/// Timestamps are normalized so the first recorded second becomes zero.
pub fn parse_live_capture(path: &Path, logger: &Logger) -> Result<Vec<CaptureQuantum>> {
    let file = File::open(path).with_context(|| format!("Cannot open live capture: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(h) => h?,
        None => bail!("Live capture is empty: {}", path.display()),
    };
    let cols: Vec<&str> = header
        .split(',')
        .map(|c| c.trim())
        .collect();
    let col = |name: &str| -> Result<usize> {
        cols
            .iter()
            .position(|c| *c == name)
            .with_context(|| format!("Live capture is missing a '{}' column", name))
    };
    let ts_col = col("timestamp_s")?;
    let rms_col = col("rms")?;
    let hash_col = col("hash")?;
    let ms_col = col("time_ms")?;

    let mut by_second: BTreeMap<u32, CaptureQuantum> = BTreeMap::new();
    for (row, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line
            .split(',')
            .map(|f| f.trim())
            .collect();
        let need = ts_col.max(rms_col).max(hash_col).max(ms_col);
        if fields.len() <= need {
            bail!("Malformed live capture row {} (expected {} columns): {}", row + 2, need + 1, line);
        }
        let ts: u32 = fields[ts_col]
            .parse()
            .with_context(|| format!("Bad timestamp_s in live capture row {}", row + 2))?;
        let rms: f32 = fields[rms_col]
            .parse()
            .with_context(|| format!("Bad rms in live capture row {}", row + 2))?;

        let q = by_second
            .entry(ts)
            .or_insert_with(|| CaptureQuantum { timestamp_s: ts, rms, hashes: Vec::new() });
        q.rms = rms;
        if fields[hash_col] != "-" {
            let hash = parse_hash(fields[hash_col]).with_context(||
                format!("Bad hash in live capture row {}", row + 2)
            )?;
            let time_ms: u32 = fields[ms_col]
                .parse()
                .with_context(|| format!("Bad time_ms in live capture row {}", row + 2))?;
            q.hashes.push((hash, time_ms));
        }
    }

    if by_second.is_empty() {
        bail!("Live capture has no data rows: {}", path.display());
    }

    let base = *by_second.keys().next().ok_or_else(|| anyhow::anyhow!("empty capture"))?;
    let quanta: Vec<CaptureQuantum> = by_second
        .into_values()
        .map(|mut q| {
            q.timestamp_s -= base;
            q
        })
        .collect();

    let total_hashes: usize = quanta
        .iter()
        .map(|q| q.hashes.len())
        .sum();
    let _ = log_info!(
        logger,
        "Live capture: {} recorded second(s), {} hash(es), base timestamp {}",
        quanta.len(),
        total_hashes,
        base
    );
    Ok(quanta)
}

/// Replay "DSP": instead of hashing PCM, look up the hashes the capture
/// recorded for this engine second. Gaps in the recording yield a quantum
/// with no hashes, exactly as a silent second would live.
pub struct ReplayGenerator {
    by_second: BTreeMap<u32, Vec<(u64, u32)>>,
}

impl ReplayGenerator {
    pub fn new(quanta: &[CaptureQuantum]) -> Self {
        let by_second = quanta
            .iter()
            .map(|q| (q.timestamp_s, q.hashes.clone()))
            .collect();
        Self { by_second }
    }
}

impl FingerprintGenerator for ReplayGenerator {
    fn generate(&mut self, _pcm: &[f32], _sr: u32, timestamp_s: u32) -> Vec<FingerprintEntry> {
        let hashes = self.by_second.get(&timestamp_s).cloned().unwrap_or_default();
        vec![FingerprintEntry::new(timestamp_s, hashes)]
    }
}

fn write_match_header(file: &mut std::fs::File) -> Result<()> {
    writeln!(
        file,
        "timestamp,quantum_s,matched,offset_s,confidence,dominance,density,consistency,stable"
    )?;
    file.flush()?;
    Ok(())
}

fn write_match_row(file: &mut std::fs::File, out: &QuantumOutcome) -> Result<()> {
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
    writeln!(
        file,
        "{},{},{},{},{:.4},{:.2},{:.5},{:.3},{}",
        now,
        out.quantum_s,
        out.decision.is_matched,
        out.decision.offset_s,
        out.decision.confidence,
        if out.decision.dominance.is_finite() { out.decision.dominance } else { 999.0 },
        out.decision.density,
        out.decision.consistency,
        out.stability.is_stable
    )?;
    file.flush()?;
    Ok(())
}

/// Replay mode — feed a recorded live capture through the full streaming
/// pipeline against a reference index, writing one row per quantum to the
/// match CSV and stopping at the first stable alignment.
pub fn run_replay(cfg: &Config, logger: Arc<Logger>) -> Result<()> {
    log_info!(
        logger,
        "track-align (replay) starting…  window_s={} tolerance_s={} dominance>={:.2} density>={:.4} consistency>={:.2}",
        cfg.window_size_s,
        cfg.cluster_tolerance_s,
        cfg.min_dominance_ratio,
        cfg.min_density,
        cfg.min_consistency
    )?;

    if cfg.reference_path.is_empty() {
        bail!("--reference <PATH> is required in replay mode");
    }
    if cfg.live_path.is_empty() {
        bail!("--live <PATH> is required in replay mode");
    }

    let entries = crate::mods::index::parse_reference(Path::new(&cfg.reference_path), &logger)?;
    let index = Arc::new(ReferenceIndex::build(&entries, cfg.max_hash_occurrences)?);
    log_info!(
        logger,
        "Reference index: {} distinct hash(es) over {} s, {} overly common hash(es) dropped",
        index.hash_count(),
        index.duration_s(),
        index.dropped_common()
    )?;

    let quanta = parse_live_capture(Path::new(&cfg.live_path), &logger)?;
    let last_second = quanta.last().map(|q| q.timestamp_s).unwrap_or(0);

    let csv_path = Path::new(&cfg.match_csv_path);
    let mut csv_file = OpenOptions::new().create(true).append(true).open(csv_path)?;
    if csv_file.metadata()?.len() == 0 {
        write_match_header(&mut csv_file)?;
    }

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = quit.clone();
        let _ = ctrlc::set_handler(move || {
            quit.store(true, Ordering::SeqCst);
        });
    }

    // Producer: one PCM block per engine second, constant-filled at the
    // recorded level so the measured RMS matches the capture. Seconds the
    // capture never recorded are replayed as silence.
    let (tx, rx) = bounded::<Vec<f32>>(cfg.max_buffered_quanta.max(1));
    let sr = cfg.sample_rate_hz as usize;
    let levels: Vec<f32> = {
        let mut v = vec![0.0f32; (last_second as usize) + 1];
        for q in &quanta {
            v[q.timestamp_s as usize] = q.rms;
        }
        v
    };
    let producer = thread::spawn(move || {
        for level in levels {
            if tx.send(vec![level; sr]).is_err() {
                break;
            }
        }
    });

    let mut generator = ReplayGenerator::new(&quanta);
    let result = run_session(cfg, index, rx, &mut generator, logger.clone(), quit, &mut |out| {
        write_match_row(&mut csv_file, out)
    })?;

    let _ = producer.join();

    match result {
        Some(stable) => {
            log_info!(
                logger,
                "STABLE MATCH at quantum {}: reference offset {} s (confidence {:.2})",
                stable.quantum_s,
                stable.offset_s,
                stable.confidence
            )?;
            println!(
                "Stable match: live second {} aligns to reference second {} (confidence {:.2})",
                stable.quantum_s,
                stable.offset_s + (stable.quantum_s as i32),
                stable.confidence
            );
        }
        None => {
            logger.warn("Replay finished without a stable match")?;
            println!("No stable match found in the capture.");
        }
    }
    println!("Per-quantum rows written to {}; log at {}", csv_path.display(), logger.file_path());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("track-align-test-{}-{}", std::process::id(), name));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn quiet_logger() -> Logger {
        Logger::new_with_level("/dev/null", false, crate::logger::LogLevel::Error).unwrap()
    }

    #[test]
    fn capture_rows_group_by_second_and_normalize_to_zero() {
        let path = write_temp(
            "capture-ok.csv",
            "timestamp_s,rms,hash,time_ms\n\
             120,0.0310,1a2b3c,150\n\
             120,0.0310,4d5e6f,730\n\
             121,0.0021,-,0\n\
             123,0.0450,7788aa,40\n"
        );
        let quanta = parse_live_capture(&path, &quiet_logger()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(quanta.len(), 3);
        assert_eq!(quanta[0].timestamp_s, 0);
        assert_eq!(quanta[0].hashes.len(), 2);
        assert_eq!(quanta[0].hashes[0], (0x1a2b3c, 150));
        // the `-` row keeps the quantum but records no hashes
        assert_eq!(quanta[1].timestamp_s, 1);
        assert!(quanta[1].hashes.is_empty());
        assert!((quanta[1].rms - 0.0021).abs() < 1e-6);
        // the recording gap at 122 simply has no quantum here
        assert_eq!(quanta[2].timestamp_s, 3);
    }

    #[test]
    fn malformed_capture_rows_fail_with_the_row_number() {
        let path = write_temp(
            "capture-bad.csv",
            "timestamp_s,rms,hash,time_ms\n\
             10,0.05,aa11,100\n\
             11,not-a-number,bb22,200\n"
        );
        let err = parse_live_capture(&path, &quiet_logger()).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(format!("{:#}", err).contains("row 3"));
    }

    #[test]
    fn replay_generator_fills_recording_gaps_with_empty_quanta() {
        let quanta = vec![
            CaptureQuantum { timestamp_s: 0, rms: 0.05, hashes: vec![(0xaa, 10)] },
            CaptureQuantum { timestamp_s: 2, rms: 0.04, hashes: vec![(0xbb, 20)] }
        ];
        let mut gen = ReplayGenerator::new(&quanta);
        let at_gap = gen.generate(&[], 48_000, 1);
        assert_eq!(at_gap.len(), 1);
        assert!(at_gap[0].hashes.is_empty());
        let at_two = gen.generate(&[], 48_000, 2);
        assert_eq!(at_two[0].hashes, vec![(0xbb, 20)]);
    }
}
