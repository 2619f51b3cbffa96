use anyhow::Result;
use crossbeam_channel::Receiver;
use std::{
    sync::{ atomic::{ AtomicBool, Ordering }, Arc, Mutex },
    thread,
    time::{ Duration, Instant },
};

use crate::{ log_debug, log_info, log_warn, Config };
use crate::logger::Logger;
use crate::mods::{
    index::{ FingerprintEntry, ReferenceIndex },
    pipeline::{ MatchPipeline, QuantumOutcome },
};

/// External DSP stage that turns one quantum of PCM into fingerprint
/// entries. The engine never looks inside the hashes it returns.
pub trait FingerprintGenerator: Send {
    fn generate(
        &mut self,
        pcm: &[f32],
        sample_rate_hz: u32,
        timestamp_s: u32
    ) -> Vec<FingerprintEntry>;
}

/// Terminal result of a session: the accepted stable alignment.
#[derive(Clone, Copy, Debug)]
pub struct StableMatch {
    pub offset_s: i32,
    pub quantum_s: u32,
    pub confidence: f64,
}

#[inline]
pub fn rms(x: &[f32]) -> f32 {
    let e =
        x
            .iter()
            .map(|v| v * v)
            .sum::<f32>() / (x.len().max(1) as f32);
    e.sqrt()
}

/// First-difference pre-emphasis; doubles as the optional high-pass stage.
#[inline]
pub fn preemph_diff_in_place(x: &mut [f32]) {
    let mut prev = 0.0f32;
    for s in x.iter_mut() {
        let cur = *s;
        *s = cur - prev;
        prev = cur;
    }
}

/// Warm-up gain: pull the measured input level toward the target, bounded.
#[inline]
pub fn calibration_gain(measured_rms: f32, target_rms: f32, min_gain: f32, max_gain: f32) -> f32 {
    if measured_rms <= 1e-9 {
        return max_gain;
    }
    (target_rms / measured_rms).clamp(min_gain, max_gain)
}

/// Mutex-protected sample accumulator between the capture producer and the
/// matching consumer. Bounded: overflow drops whole quanta from the front.
struct FeedState {
    samples: Vec<f32>,
    /// Quanta dropped by backpressure that the consumer has not yet folded
    /// into its sample clock.
    dropped_quanta: u64,
    closed: bool,
}

/// Absorb one producer block, enforcing the bounded-buffer policy.
/// Returns how many whole quanta were dropped to make room.
fn absorb_block(
    st: &mut FeedState,
    block: &[f32],
    cap_samples: usize,
    quantum_samples: usize
) -> u64 {
    st.samples.extend_from_slice(block);
    let mut dropped = 0u64;
    while st.samples.len() > cap_samples && st.samples.len() >= quantum_samples {
        st.samples.drain(0..quantum_samples);
        dropped += 1;
    }
    st.dropped_quanta += dropped;
    dropped
}

fn feed_thread(
    rx: Receiver<Vec<f32>>,
    state: Arc<Mutex<FeedState>>,
    cap_samples: usize,
    quantum_samples: usize,
    stop: Arc<AtomicBool>,
    logger: Arc<Logger>
) {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(block) => {
                let dropped = {
                    let mut st = state.lock().unwrap();
                    absorb_block(&mut st, &block, cap_samples, quantum_samples)
                };
                if dropped > 0 {
                    let _ = log_warn!(
                        logger,
                        "Matching is behind capture; dropped {} quantum(s) of audio",
                        dropped
                    );
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                break;
            }
        }
    }
    state.lock().unwrap().closed = true;
}

/// Run one matching session: drain exactly one second of samples per
/// quantum, fingerprint it, slide the matcher, and stop on the first
/// stable match, cancellation, or end of input.
///
/// The total-sample clock advances across dropped quanta too, so live
/// timestamps always reflect true elapsed capture time.
pub fn run_session(
    cfg: &Config,
    index: Arc<ReferenceIndex>,
    rx: Receiver<Vec<f32>>,
    generator: &mut dyn FingerprintGenerator,
    logger: Arc<Logger>,
    cancel: Arc<AtomicBool>,
    on_quantum: &mut dyn FnMut(&QuantumOutcome) -> Result<()>
) -> Result<Option<StableMatch>> {
    let quantum_samples = (cfg.sample_rate_hz as usize).max(1);
    let cap_samples = quantum_samples * cfg.max_buffered_quanta.max(1);

    let state = Arc::new(
        Mutex::new(FeedState {
            samples: Vec::with_capacity(cap_samples + quantum_samples),
            dropped_quanta: 0,
            closed: false,
        })
    );
    let stop = Arc::new(AtomicBool::new(false));
    let feed = {
        let state = state.clone();
        let stop = stop.clone();
        let logger = logger.clone();
        thread::spawn(move ||
            feed_thread(rx, state, cap_samples, quantum_samples, stop, logger)
        )
    };

    let mut pipeline = MatchPipeline::from_config(cfg, index);
    let mut total_samples: u64 = 0;

    // gain calibration warm-up (off unless enabled)
    let mut gain = 1.0f32;
    let mut calibrated = !cfg.enable_gain_calibration;
    let warmup_samples = ((cfg.gain_warmup_s as f64) * (cfg.sample_rate_hz as f64)) as u64;
    let mut warm_energy = 0.0f64;
    let mut warm_count = 0u64;

    // single exit value so the stop/join epilogue runs on every path,
    // sink errors included
    let mut outcome: Result<Option<StableMatch>> = Ok(None);
    let mut next = Instant::now();

    loop {
        // cancellation is cooperative, checked at quantum boundaries only
        if cancel.load(Ordering::SeqCst) {
            let _ = log_info!(logger, "Session cancelled; finishing current quantum and stopping");
            break;
        }

        let (quantum, closed) = {
            let mut st = state.lock().unwrap();
            if st.dropped_quanta > 0 {
                // dropped audio still happened: advance the clock past it
                total_samples += st.dropped_quanta * (quantum_samples as u64);
                st.dropped_quanta = 0;
            }
            if st.samples.len() >= quantum_samples {
                let q: Vec<f32> = st.samples.drain(0..quantum_samples).collect();
                (Some(q), st.closed)
            } else {
                (None, st.closed)
            }
        };

        let Some(mut q) = quantum else {
            if closed {
                break;
            }
            thread::sleep(Duration::from_millis(5));
            continue;
        };

        let quantum_s = (total_samples / (quantum_samples as u64)) as u32;
        total_samples += quantum_samples as u64;

        if !calibrated {
            for &v in &q {
                warm_energy += (v as f64) * (v as f64);
            }
            warm_count += q.len() as u64;
            if warm_count >= warmup_samples {
                let measured = (warm_energy / (warm_count as f64)).sqrt() as f32;
                gain = calibration_gain(measured, cfg.gain_target_rms, cfg.gain_min, cfg.gain_max);
                calibrated = true;
                let _ = log_info!(
                    logger,
                    "Gain calibration: measured_rms={:.5} -> gain={:.2}",
                    measured,
                    gain
                );
            }
        } else if cfg.enable_gain_calibration {
            for v in q.iter_mut() {
                *v *= gain;
            }
        }
        if cfg.enable_high_pass {
            preemph_diff_in_place(&mut q);
        }

        let level = rms(&q);
        let entries = generator.generate(&q, cfg.sample_rate_hz, quantum_s);
        let out = pipeline.process_quantum(quantum_s, level, entries);

        if out.quality.advise_reposition {
            let _ = log_warn!(
                logger,
                "Live signal has been feature-poor for {} quantum(s); the capture position likely needs to change",
                pipeline.low_feature_streak()
            );
        }
        let _ = log_debug!(
            logger,
            "quantum={} window={} matched={} offset={} conf={:.2} dom={:.2} dens={:.4} cons={:.2} streak={} cont={:?}",
            out.quantum_s,
            pipeline.window_len(),
            out.decision.is_matched,
            out.decision.offset_s,
            out.decision.confidence,
            out.decision.dominance,
            out.decision.density,
            out.decision.consistency,
            out.stability.consecutive_matches,
            out.stability.continuity
        );

        if let Err(e) = on_quantum(&out) {
            let _ = logger.error(&format!("Per-quantum sink failed: {:#}", e));
            outcome = Err(e);
            break;
        }

        if out.is_stable() {
            outcome = Ok(
                Some(StableMatch {
                    offset_s: out.decision.offset_s,
                    quantum_s: out.quantum_s,
                    confidence: out.decision.confidence,
                })
            );
            break;
        }

        // pacing (replay runs as fast as input arrives unless asked not to)
        if cfg.realtime {
            next += Duration::from_secs(1);
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }
    }

    // release the feed thread on every exit path
    stop.store(true, Ordering::SeqCst);
    let _ = feed.join();

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn ref_hash(t: u32, j: u32) -> u64 {
        0x4000_0000 + ((t as u64) << 8) + (j as u64)
    }

    fn reference(seconds: u32) -> Vec<FingerprintEntry> {
        (0..seconds)
            .map(|t| {
                FingerprintEntry::new(
                    t,
                    (0..8)
                        .map(|j| (ref_hash(t, j), j * 100))
                        .collect()
                )
            })
            .collect()
    }

    /// Stub DSP stage: every quantum reproduces the hashes of reference
    /// second `base + timestamp`, i.e. a clean stream at offset `base`.
    struct OffsetGenerator {
        base: u32,
    }
    impl FingerprintGenerator for OffsetGenerator {
        fn generate(
            &mut self,
            _pcm: &[f32],
            _sample_rate_hz: u32,
            timestamp_s: u32
        ) -> Vec<FingerprintEntry> {
            vec![
                FingerprintEntry::new(
                    timestamp_s,
                    (0..8)
                        .map(|j| (ref_hash(self.base + timestamp_s, j), j * 100))
                        .collect()
                )
            ]
        }
    }

    /// Stub DSP stage producing hashes the index has never seen.
    struct NoiseGen;
    impl FingerprintGenerator for NoiseGen {
        fn generate(&mut self, _p: &[f32], _sr: u32, ts: u32) -> Vec<FingerprintEntry> {
            vec![FingerprintEntry::new(ts, vec![(0x9999_0000 + (ts as u64), 0)])]
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.sample_rate_hz = 800; // keep test quanta tiny
        cfg.realtime = false;
        cfg.max_buffered_quanta = 64; // no backpressure drops in tests
        cfg
    }

    fn test_logger() -> Arc<Logger> {
        Arc::new(Logger::new_with_level("/dev/null", false, crate::logger::LogLevel::Error).unwrap())
    }

    #[test]
    fn session_reaches_a_stable_match_on_clean_input() {
        let cfg = test_config();
        let index = Arc::new(
            ReferenceIndex::build(&reference(400), cfg.max_hash_occurrences).unwrap()
        );

        let (tx, rx) = bounded::<Vec<f32>>(8);
        let sr = cfg.sample_rate_hz as usize;
        let producer = thread::spawn(move || {
            for _ in 0..20 {
                tx.send(vec![0.1f32; sr]).unwrap();
            }
            // sender dropped => end of input
        });

        let mut gen = OffsetGenerator { base: 123 };
        let cancel = Arc::new(AtomicBool::new(false));
        let mut seen = 0usize;
        let result = run_session(
            &cfg,
            index,
            rx,
            &mut gen,
            test_logger(),
            cancel,
            &mut |out| {
                seen += 1;
                assert_eq!(out.quantum_s as usize, seen - 1);
                Ok(())
            }
        ).unwrap();

        producer.join().unwrap();
        let stable = result.expect("no stable match on clean input");
        assert_eq!(stable.offset_s, 123);
        assert!(seen >= 5);
    }

    #[test]
    fn session_ends_quietly_when_input_runs_out() {
        let cfg = test_config();
        let index = Arc::new(
            ReferenceIndex::build(&reference(50), cfg.max_hash_occurrences).unwrap()
        );

        let (tx, rx) = bounded::<Vec<f32>>(8);
        let sr = cfg.sample_rate_hz as usize;
        // only three quanta: below the minimum window population
        for _ in 0..3 {
            tx.send(vec![0.05f32; sr]).unwrap();
        }
        drop(tx);

        let mut gen = NoiseGen;
        let cancel = Arc::new(AtomicBool::new(false));
        let result = run_session(
            &cfg,
            index,
            rx,
            &mut gen,
            test_logger(),
            cancel,
            &mut |_| Ok(())
        ).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn sink_error_still_tears_down_the_feed_thread() {
        let cfg = test_config();
        let index = Arc::new(
            ReferenceIndex::build(&reference(50), cfg.max_hash_occurrences).unwrap()
        );

        let (tx, rx) = bounded::<Vec<f32>>(8);
        let sr = cfg.sample_rate_hz as usize;
        tx.send(vec![0.1f32; sr]).unwrap();

        let mut gen = NoiseGen;
        let cancel = Arc::new(AtomicBool::new(false));
        let err = run_session(
            &cfg,
            index,
            rx,
            &mut gen,
            test_logger(),
            cancel,
            &mut |_| anyhow::bail!("sink gave up")
        ).unwrap_err();
        assert!(format!("{:#}", err).contains("sink gave up"));

        // the feed thread was stopped and joined before the error surfaced,
        // so its receiver is gone and the producer side is disconnected
        assert!(tx.send(vec![0.1f32; sr]).is_err());
    }

    #[test]
    fn dropped_quanta_still_advance_the_live_clock() {
        let mut cfg = test_config();
        cfg.max_buffered_quanta = 2;
        cfg.enable_gain_calibration = true;
        cfg.gain_target_rms = 0.05;
        cfg.gain_warmup_s = 1.0;
        let index = Arc::new(
            ReferenceIndex::build(&reference(50), cfg.max_hash_occurrences).unwrap()
        );

        // the whole capture is queued up front; a slow sink forces the
        // bounded accumulator to drop most of it
        let (tx, rx) = bounded::<Vec<f32>>(16);
        let sr = cfg.sample_rate_hz as usize;
        for _ in 0..12 {
            tx.send(vec![0.01f32; sr]).unwrap();
        }
        drop(tx);

        struct RecordingGen {
            seen: Vec<(u32, f32)>,
        }
        impl FingerprintGenerator for RecordingGen {
            fn generate(&mut self, pcm: &[f32], _sr: u32, ts: u32) -> Vec<FingerprintEntry> {
                self.seen.push((ts, pcm[0]));
                vec![FingerprintEntry::new(ts, vec![(0x7777_0000 + (ts as u64), 0)])]
            }
        }

        let mut gen = RecordingGen { seen: Vec::new() };
        let cancel = Arc::new(AtomicBool::new(false));
        let result = run_session(
            &cfg,
            index,
            rx,
            &mut gen,
            test_logger(),
            cancel,
            &mut |_| {
                thread::sleep(Duration::from_millis(50));
                Ok(())
            }
        ).unwrap();
        assert!(result.is_none());

        let ts: Vec<u32> = gen.seen
            .iter()
            .map(|&(t, _)| t)
            .collect();
        assert!(ts.len() < 12, "expected drops, processed all {} quanta", ts.len());
        assert!(ts.windows(2).all(|w| w[0] < w[1]), "timestamps not monotonic: {:?}", ts);
        // every quantum, dropped or processed, advanced the clock
        assert_eq!(*ts.last().unwrap(), 11);

        // one-quantum warm-up: first processed quantum is unscaled, the
        // rest carry the calibrated gain (0.05 / 0.01 = 5)
        assert!((gen.seen[0].1 - 0.01).abs() < 1e-4);
        assert!((gen.seen[1].1 - 0.05).abs() < 1e-4);
    }

    #[test]
    fn backpressure_drops_oldest_quanta_and_counts_them() {
        let mut st = FeedState { samples: Vec::new(), dropped_quanta: 0, closed: false };
        // cap of two 10-sample quanta
        let dropped = absorb_block(&mut st, &vec![0.0f32; 50], 20, 10);
        assert_eq!(dropped, 3);
        assert_eq!(st.samples.len(), 20);
        assert_eq!(st.dropped_quanta, 3);

        // under cap: nothing dropped
        let dropped = absorb_block(&mut st, &[], 20, 10);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn calibration_gain_is_clamped() {
        assert_eq!(calibration_gain(0.01, 0.05, 0.5, 8.0), 5.0);
        assert_eq!(calibration_gain(0.001, 0.05, 0.5, 8.0), 8.0);
        assert_eq!(calibration_gain(0.5, 0.05, 0.5, 8.0), 0.5);
        // dead silence maxes out rather than dividing by zero
        assert_eq!(calibration_gain(0.0, 0.05, 0.5, 8.0), 8.0);
    }

    #[test]
    fn rms_of_constant_block_is_its_amplitude() {
        let x = vec![0.25f32; 256];
        assert!((rms(&x) - 0.25).abs() < 1e-6);
    }
}
