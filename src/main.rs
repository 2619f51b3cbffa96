//! src/main.rs

use anyhow::Result;
use std::{ env, sync::Arc };

mod logger;
use logger::Logger;

use crate::logger::LogLevel;

// expose the split engine + mode files in src/mods/
mod mods;

use crate::mods::scorer::ScoreParams;
use crate::mods::regions::SearchParams;

// ───────────────────────────────────────────────────────────────────────────────
// Modes
// ───────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Stream a recorded live capture through the sliding matcher.
    Replay,
    /// Score an entire capture as one window and print the full decision.
    Lookup,
    /// Build the reference index and report its shape.
    Inspect,
}

// ───────────────────────────────────────────────────────────────────────────────
// Config
// ───────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,

    // input/output paths
    pub reference_path: String,
    pub live_path: String,
    pub match_csv_path: String,
    pub log_path: String,
    pub log_level: LogLevel,

    // sliding window
    pub window_size_s: u32,
    pub slide_interval_s: u32,

    // index construction
    pub max_hash_occurrences: u32,

    // offset scoring and decision gates
    pub cluster_tolerance_s: i32,
    pub consistency_weight: f64,
    pub min_dominance_ratio: f64,
    pub min_density: f64,
    pub min_consistency: f64,
    pub min_window_entries: usize,

    // coarse-to-fine search
    pub region_size_s: u32,
    pub top_candidate_regions: usize,
    pub early_exit_confidence: f64,
    pub early_exit_concentration: f64,

    // signal quality gate
    pub difficult_segment_rms: f32,
    pub min_hash_threshold: usize,
    pub max_consecutive_low_feature: u32,
    pub hard_skip_weak: bool,

    // stability tracking
    pub required_stable_offsets: u32,
    pub small_offset_change_s: i32,
    pub large_offset_change_s: i32,

    // capture conditioning (both off unless asked for)
    pub enable_gain_calibration: bool,
    pub gain_target_rms: f32,
    pub gain_min: f32,
    pub gain_max: f32,
    pub gain_warmup_s: f32,
    pub enable_high_pass: bool,

    // session plumbing
    pub sample_rate_hz: u32,
    pub max_buffered_quanta: usize,
    pub realtime: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Replay,

            reference_path: String::new(),
            live_path: String::new(),
            match_csv_path: "Match.csv".to_string(),
            log_path: "TrackAlign.log".to_string(),
            log_level: LogLevel::Info,

            window_size_s: 10,
            slide_interval_s: 1,

            max_hash_occurrences: 30,

            cluster_tolerance_s: 3,
            consistency_weight: 0.5,
            min_dominance_ratio: 1.2,
            min_density: 0.003,
            min_consistency: 0.40,
            min_window_entries: 5,

            region_size_s: 5,
            top_candidate_regions: 10,
            early_exit_confidence: 0.5,
            early_exit_concentration: 0.5,

            difficult_segment_rms: 0.01,
            min_hash_threshold: 3,
            max_consecutive_low_feature: 10,
            hard_skip_weak: false,

            required_stable_offsets: 3,
            small_offset_change_s: 2,
            large_offset_change_s: 10,

            enable_gain_calibration: false,
            gain_target_rms: 0.05,
            gain_min: 0.5,
            gain_max: 8.0,
            gain_warmup_s: 2.0,
            enable_high_pass: false,

            sample_rate_hz: 48_000,
            max_buffered_quanta: 4,
            realtime: false,
        }
    }
}

impl Config {
    pub fn score_params(&self) -> ScoreParams {
        ScoreParams {
            cluster_tolerance_s: self.cluster_tolerance_s,
            consistency_weight: self.consistency_weight,
            min_dominance_ratio: self.min_dominance_ratio,
            min_density: self.min_density,
            min_consistency: self.min_consistency,
            min_window_entries: self.min_window_entries,
        }
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            region_size_s: self.region_size_s,
            top_candidate_regions: self.top_candidate_regions,
            early_exit_confidence: self.early_exit_confidence,
            early_exit_concentration: self.early_exit_concentration,
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// CLI
// ───────────────────────────────────────────────────────────────────────────────

fn print_usage(cfg: &Config) {
    println!("Usage: track_align [OPTIONS]\n");
    println!("General paths:");
    println!("  --reference <PATH>            Reference fingerprint CSV (required)");
    println!("  --live <PATH>                 Recorded live-capture CSV (replay/lookup)");
    println!(
        "  --match-csv-path <PATH>       Per-quantum match CSV (default: {})",
        cfg.match_csv_path
    );
    println!("  --log-path <PATH>             Path to the log file (default: {})", cfg.log_path);
    println!(
        "  --log-level <LEVEL>           Log level: debug, info, warning, error (default: info)"
    );
    println!();
    println!("Modes:");
    println!("  --mode replay         (default) Stream the capture through the sliding matcher");
    println!("  --mode lookup         Score the whole capture as one window and print details");
    println!("  --mode inspect        Build the reference index and report its shape");
    println!();
    println!("Window and index:");
    println!(
        "  -ws, --window-sec <SEC>       Sliding window length in seconds (default: {})",
        cfg.window_size_s
    );
    println!(
        "  --slide-sec <SEC>             Quanta between matcher evaluations (default: {})",
        cfg.slide_interval_s
    );
    println!(
        "  --max-occurrences <N>         Drop hashes appearing more than N times in the reference (default: {})",
        cfg.max_hash_occurrences
    );
    println!();
    println!("Decision thresholds:");
    println!(
        "  --tolerance-sec <SEC>         Offsets within this of each other cluster together (default: {})",
        cfg.cluster_tolerance_s
    );
    println!(
        "  --consistency-weight <W>      Temporal-consistency weight in the score (default: {:.2})",
        cfg.consistency_weight
    );
    println!(
        "  --min-dominance <RATIO>       Best/runner-up score ratio to accept (default: {:.2})",
        cfg.min_dominance_ratio
    );
    println!(
        "  --min-density <FRAC>          Index hits per window hash to accept (default: {:.3})",
        cfg.min_density
    );
    println!(
        "  --min-consistency <FRAC>      Consecutive-run fraction to accept (default: {:.2})",
        cfg.min_consistency
    );
    println!(
        "  --min-window-entries <N>      Seconds of audio before matching starts (default: {})",
        cfg.min_window_entries
    );
    println!();
    println!("Coarse-to-fine search:");
    println!(
        "  --region-sec <SEC>            Coarse region size in seconds (default: {})",
        cfg.region_size_s
    );
    println!(
        "  --top-regions <N>             Regions kept for the fine pass (default: {})",
        cfg.top_candidate_regions
    );
    println!(
        "  --early-exit-confidence <C>   Fine-pass confidence needed to skip the full pass (default: {:.2})",
        cfg.early_exit_confidence
    );
    println!(
        "  --early-exit-concentration <C> Offset concentration needed to skip the full pass (default: {:.2})",
        cfg.early_exit_concentration
    );
    println!();
    println!("Signal quality:");
    println!(
        "  --rms-threshold <RMS>         Below this the quantum is flagged weak (default: {:.3})",
        cfg.difficult_segment_rms
    );
    println!(
        "  --min-hashes <N>              Below this the quantum is feature-poor (default: {})",
        cfg.min_hash_threshold
    );
    println!(
        "  --max-low-feature <N>         Feature-poor quanta before advising reposition (default: {})",
        cfg.max_consecutive_low_feature
    );
    println!("  --hard-skip-weak              Skip matching entirely on weak quanta");
    println!();
    println!("Stability:");
    println!(
        "  --stable-count <N>            Consecutive agreeing matches for stability (default: {})",
        cfg.required_stable_offsets
    );
    println!(
        "  --small-change-sec <SEC>      Offset drift treated as continuation (default: {})",
        cfg.small_offset_change_s
    );
    println!(
        "  --large-change-sec <SEC>      Offset jump that restarts tracking (default: {})",
        cfg.large_offset_change_s
    );
    println!();
    println!("Capture conditioning:");
    println!("  --gain-calibration            Enable warm-up gain calibration");
    println!(
        "  --gain-target-rms <RMS>       Calibration target level (default: {:.3})",
        cfg.gain_target_rms
    );
    println!(
        "  --gain-warmup-sec <SEC>       Calibration warm-up length (default: {:.1})",
        cfg.gain_warmup_s
    );
    println!("  --high-pass                   Enable first-difference pre-emphasis");
    println!();
    println!("Session:");
    println!(
        "  --sample-rate <HZ>            Engine sample rate (default: {})",
        cfg.sample_rate_hz
    );
    println!(
        "  --max-buffered-quanta <N>     Buffered seconds before oldest audio is dropped (default: {})",
        cfg.max_buffered_quanta
    );
    println!("  --realtime                    Pace replay at one quantum per wall-clock second");
}

fn parse_arguments() -> std::result::Result<Config, String> {
    let args: Vec<String> = env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --mode".to_string());
                }
                match args[i + 1].to_lowercase().as_str() {
                    "replay" => {
                        config.mode = Mode::Replay;
                    }
                    "lookup" => {
                        config.mode = Mode::Lookup;
                    }
                    "inspect" => {
                        config.mode = Mode::Inspect;
                    }
                    other => {
                        return Err(format!("Unknown mode: {}", other));
                    }
                }
                i += 2;
            }
            "--reference" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --reference".to_string());
                }
                config.reference_path = args[i + 1].to_string();
                i += 2;
            }
            "--live" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --live".to_string());
                }
                config.live_path = args[i + 1].to_string();
                i += 2;
            }
            "--match-csv-path" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --match-csv-path".to_string());
                }
                config.match_csv_path = args[i + 1].to_string();
                i += 2;
            }
            "--log-path" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --log-path".to_string());
                }
                config.log_path = args[i + 1].to_string();
                i += 2;
            }
            "--log-level" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --log-level".to_string());
                }
                match args[i + 1].to_lowercase().as_str() {
                    "debug" => {
                        config.log_level = LogLevel::Debug;
                    }
                    "info" => {
                        config.log_level = LogLevel::Info;
                    }
                    "warning" | "warn" => {
                        config.log_level = LogLevel::Warning;
                    }
                    "error" => {
                        config.log_level = LogLevel::Error;
                    }
                    other => {
                        return Err(
                            format!("Invalid log level: {}. Valid options: debug, info, warning, error", other)
                        );
                    }
                }
                i += 2;
            }
            "-ws" | "--window-sec" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for window-sec".to_string());
                }
                let v: u32 = args[i + 1].parse().map_err(|_| "Invalid window-sec value".to_string())?;
                config.window_size_s = v.max(1);
                i += 2;
            }
            "--slide-sec" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --slide-sec".to_string());
                }
                let v: u32 = args[i + 1].parse().map_err(|_| "Invalid slide-sec value".to_string())?;
                config.slide_interval_s = v.max(1);
                i += 2;
            }
            "--max-occurrences" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --max-occurrences".to_string());
                }
                let v: u32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid max-occurrences value".to_string())?;
                config.max_hash_occurrences = v.max(1);
                i += 2;
            }
            "--tolerance-sec" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --tolerance-sec".to_string());
                }
                let v: i32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid tolerance-sec value".to_string())?;
                config.cluster_tolerance_s = v.max(0);
                i += 2;
            }
            "--consistency-weight" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --consistency-weight".to_string());
                }
                let v: f64 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid consistency-weight value".to_string())?;
                config.consistency_weight = v.max(0.0);
                i += 2;
            }
            "--min-dominance" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --min-dominance".to_string());
                }
                let v: f64 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid min-dominance value".to_string())?;
                config.min_dominance_ratio = v.max(1.0);
                i += 2;
            }
            "--min-density" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --min-density".to_string());
                }
                let v: f64 = args[i + 1].parse().map_err(|_| "Invalid min-density value".to_string())?;
                config.min_density = v.clamp(0.0, 1.0);
                i += 2;
            }
            "--min-consistency" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --min-consistency".to_string());
                }
                let v: f64 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid min-consistency value".to_string())?;
                config.min_consistency = v.clamp(0.0, 1.0);
                i += 2;
            }
            "--min-window-entries" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --min-window-entries".to_string());
                }
                let v: usize = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid min-window-entries value".to_string())?;
                config.min_window_entries = v.max(1);
                i += 2;
            }
            "--region-sec" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --region-sec".to_string());
                }
                let v: u32 = args[i + 1].parse().map_err(|_| "Invalid region-sec value".to_string())?;
                config.region_size_s = v.max(1);
                i += 2;
            }
            "--top-regions" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --top-regions".to_string());
                }
                let v: usize = args[i + 1].parse().map_err(|_| "Invalid top-regions value".to_string())?;
                config.top_candidate_regions = v.max(1);
                i += 2;
            }
            "--early-exit-confidence" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --early-exit-confidence".to_string());
                }
                let v: f64 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid early-exit-confidence value".to_string())?;
                config.early_exit_confidence = v.clamp(0.0, 1.0);
                i += 2;
            }
            "--early-exit-concentration" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --early-exit-concentration".to_string());
                }
                let v: f64 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid early-exit-concentration value".to_string())?;
                config.early_exit_concentration = v.clamp(0.0, 1.0);
                i += 2;
            }
            "--rms-threshold" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --rms-threshold".to_string());
                }
                let v: f32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid rms-threshold value".to_string())?;
                config.difficult_segment_rms = v.max(0.0);
                i += 2;
            }
            "--min-hashes" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --min-hashes".to_string());
                }
                let v: usize = args[i + 1].parse().map_err(|_| "Invalid min-hashes value".to_string())?;
                config.min_hash_threshold = v;
                i += 2;
            }
            "--max-low-feature" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --max-low-feature".to_string());
                }
                let v: u32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid max-low-feature value".to_string())?;
                config.max_consecutive_low_feature = v.max(1);
                i += 2;
            }
            "--hard-skip-weak" => {
                config.hard_skip_weak = true;
                i += 1;
            }
            "--stable-count" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --stable-count".to_string());
                }
                let v: u32 = args[i + 1].parse().map_err(|_| "Invalid stable-count value".to_string())?;
                config.required_stable_offsets = v.max(1);
                i += 2;
            }
            "--small-change-sec" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --small-change-sec".to_string());
                }
                let v: i32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid small-change-sec value".to_string())?;
                config.small_offset_change_s = v.max(0);
                i += 2;
            }
            "--large-change-sec" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --large-change-sec".to_string());
                }
                let v: i32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid large-change-sec value".to_string())?;
                config.large_offset_change_s = v.max(1);
                i += 2;
            }
            "--gain-calibration" => {
                config.enable_gain_calibration = true;
                i += 1;
            }
            "--gain-target-rms" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --gain-target-rms".to_string());
                }
                let v: f32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid gain-target-rms value".to_string())?;
                config.gain_target_rms = v.max(0.0);
                i += 2;
            }
            "--gain-warmup-sec" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --gain-warmup-sec".to_string());
                }
                let v: f32 = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid gain-warmup-sec value".to_string())?;
                config.gain_warmup_s = v.max(0.0);
                i += 2;
            }
            "--high-pass" => {
                config.enable_high_pass = true;
                i += 1;
            }
            "--sample-rate" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --sample-rate".to_string());
                }
                let v: u32 = args[i + 1].parse().map_err(|_| "Invalid sample-rate value".to_string())?;
                config.sample_rate_hz = v.max(1);
                i += 2;
            }
            "--max-buffered-quanta" => {
                if i + 1 >= args.len() {
                    return Err("Missing value for --max-buffered-quanta".to_string());
                }
                let v: usize = args[i + 1]
                    .parse()
                    .map_err(|_| "Invalid max-buffered-quanta value".to_string())?;
                config.max_buffered_quanta = v.max(1);
                i += 2;
            }
            "--realtime" => {
                config.realtime = true;
                i += 1;
            }
            "-h" | "--help" => {
                print_usage(&config);
                std::process::exit(0);
            }
            other => {
                return Err(format!("Unknown argument: {}", other));
            }
        }
    }

    if config.large_offset_change_s <= config.small_offset_change_s {
        return Err("--large-change-sec must be greater than --small-change-sec".to_string());
    }

    Ok(config)
}

fn main() -> Result<()> {
    let cli = match parse_arguments() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}\n", e);
            print_usage(&Config::default());
            std::process::exit(1);
        }
    };

    let logger = Arc::new(Logger::new_with_level(&cli.log_path, true, cli.log_level)?);

    let result = match cli.mode {
        Mode::Replay => mods::replay::run_replay(&cli, logger.clone()),
        Mode::Lookup => mods::lookup::run_lookup(&cli, logger.clone()),
        Mode::Inspect => mods::inspect::run_inspect(&cli, logger.clone()),
    };
    if let Err(e) = &result {
        let _ = log_error!(logger, "fatal: {:#}", e);
    }
    result
}
