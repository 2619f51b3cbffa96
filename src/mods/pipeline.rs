use std::sync::Arc;

use crate::Config;
use crate::mods::{
    index::{ FingerprintEntry, ReferenceIndex },
    regions::{ self, SearchParams },
    scorer::{ MatchDecision, RejectReason, ScoreParams },
    stability::{ StabilityStatus, StabilityTracker },
    window::{ LiveWindow, QualityReport, SignalQualityGate },
};

/// Everything the caller needs to know about one processed quantum.
#[derive(Clone, Debug)]
pub struct QuantumOutcome {
    pub quantum_s: u32,
    pub quality: QualityReport,
    pub decision: MatchDecision,
    pub stability: StabilityStatus,
    /// True when the quality gate hard-skipped scoring for this quantum.
    pub skipped: bool,
}

impl QuantumOutcome {
    pub fn is_stable(&self) -> bool {
        self.stability.is_stable
    }
}

/// Caller-owned per-session matching state: sliding live window, quality
/// gate and stability tracker around the coarse-to-fine matcher. Scoring
/// itself stays pure; all streaming state lives here.
pub struct MatchPipeline {
    index: Arc<ReferenceIndex>,
    window: LiveWindow,
    gate: SignalQualityGate,
    tracker: StabilityTracker,
    score: ScoreParams,
    search: SearchParams,
    slide_interval_s: u32,
    hard_skip_weak: bool,
}

impl MatchPipeline {
    pub fn from_config(cfg: &Config, index: Arc<ReferenceIndex>) -> Self {
        Self {
            index,
            window: LiveWindow::new(cfg.window_size_s),
            gate: SignalQualityGate::new(
                cfg.difficult_segment_rms,
                cfg.min_hash_threshold,
                cfg.max_consecutive_low_feature
            ),
            tracker: StabilityTracker::new(
                cfg.required_stable_offsets,
                cfg.small_offset_change_s,
                cfg.large_offset_change_s
            ),
            score: cfg.score_params(),
            search: cfg.search_params(),
            slide_interval_s: cfg.slide_interval_s.max(1),
            hard_skip_weak: cfg.hard_skip_weak,
        }
    }

    /// Feed one quantum worth of live evidence and run a full slide.
    pub fn process_quantum(
        &mut self,
        quantum_s: u32,
        rms: f32,
        entries: Vec<FingerprintEntry>
    ) -> QuantumOutcome {
        let hash_count: usize = entries
            .iter()
            .map(|e| e.hashes.len())
            .sum();
        let quality = self.gate.assess(rms, hash_count);

        for e in entries {
            self.window.push(e);
        }

        let off_slide = quantum_s % self.slide_interval_s != 0;
        if off_slide || (self.hard_skip_weak && quality.is_weak()) {
            // annotate-only quantum (between slides, or the caller opted
            // into hard skipping and the signal is weak): the stability
            // streak is left untouched, as if the quantum never happened
            return QuantumOutcome {
                quantum_s,
                quality,
                decision: MatchDecision::rejected(RejectReason::InsufficientData),
                stability: StabilityStatus {
                    continuity: crate::mods::stability::Continuity::NotMatched,
                    consecutive_matches: self.tracker.consecutive_matches(),
                    is_stable: false,
                    offset_s: self.tracker.last_offset(),
                },
                skipped: true,
            };
        }

        let decision = if self.window.is_empty() {
            MatchDecision::rejected(RejectReason::InsufficientData)
        } else {
            regions::match_window(self.window.entries(), &self.index, &self.search, &self.score)
        };
        let stability = self.tracker.update(&decision);

        QuantumOutcome {
            quantum_s,
            quality,
            decision,
            stability,
            skipped: false,
        }
    }

    /// Restart the session state; the shared index is kept.
    pub fn reset(&mut self) {
        self.window.clear();
        self.tracker.reset();
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// How many quanta in a row produced too few hashes.
    pub fn low_feature_streak(&self) -> u32 {
        self.gate.consecutive_low()
    }
}
