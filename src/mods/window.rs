use crate::mods::index::FingerprintEntry;

/// Time-bounded FIFO of recent live fingerprint entries. After every push,
/// nothing older than `latest - window_size_s` is retained.
pub struct LiveWindow {
    window_size_s: u32,
    entries: Vec<FingerprintEntry>,
}

impl LiveWindow {
    pub fn new(window_size_s: u32) -> Self {
        Self {
            window_size_s: window_size_s.max(1),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: FingerprintEntry) {
        self.entries.push(entry);
        let latest = self.entries
            .iter()
            .map(|e| e.timestamp_s)
            .max()
            .unwrap_or(0);
        let cutoff = latest.saturating_sub(self.window_size_s);
        self.entries.retain(|e| e.timestamp_s >= cutoff);
    }

    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Cheap pre-checks on a live quantum before full scoring runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct QualityReport {
    /// RMS below the difficult-segment threshold.
    pub weak_energy: bool,
    /// Fewer hashes than the minimum for this quantum.
    pub feature_poor: bool,
    /// Too many consecutive feature-poor quanta; the live position likely
    /// needs to change. Advisory only, never fatal.
    pub advise_reposition: bool,
}

impl QualityReport {
    pub fn is_weak(&self) -> bool {
        self.weak_energy || self.feature_poor
    }
}

/// Tracks consecutive feature-poor quanta and labels weak segments.
/// Neither check blocks matching by default — the caller decides whether
/// a weak quantum is skipped or merely annotated.
pub struct SignalQualityGate {
    rms_threshold: f32,
    min_hash_threshold: usize,
    max_consecutive_low: u32,
    consecutive_low: u32,
}

impl SignalQualityGate {
    pub fn new(rms_threshold: f32, min_hash_threshold: usize, max_consecutive_low: u32) -> Self {
        Self {
            rms_threshold,
            min_hash_threshold,
            max_consecutive_low: max_consecutive_low.max(1),
            consecutive_low: 0,
        }
    }

    pub fn assess(&mut self, rms: f32, hash_count: usize) -> QualityReport {
        let weak_energy = rms < self.rms_threshold;
        let feature_poor = hash_count < self.min_hash_threshold;

        if feature_poor {
            self.consecutive_low = self.consecutive_low.saturating_add(1);
        } else {
            self.consecutive_low = 0;
        }

        QualityReport {
            weak_energy,
            feature_poor,
            advise_reposition: self.consecutive_low >= self.max_consecutive_low,
        }
    }

    pub fn consecutive_low(&self) -> u32 {
        self.consecutive_low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: u32) -> FingerprintEntry {
        FingerprintEntry::new(ts, vec![(ts as u64, 0)])
    }

    #[test]
    fn never_retains_entries_older_than_window() {
        use rand::{ seq::SliceRandom, SeedableRng };
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        let mut timestamps: Vec<u32> = (0..200).collect();
        timestamps.shuffle(&mut rng);

        let mut w = LiveWindow::new(10);
        for ts in timestamps {
            w.push(entry(ts));
            let latest = w
                .entries()
                .iter()
                .map(|e| e.timestamp_s)
                .max()
                .unwrap();
            for e in w.entries() {
                assert!(
                    e.timestamp_s + 10 >= latest,
                    "entry {} retained past latest {}",
                    e.timestamp_s,
                    latest
                );
            }
        }
    }

    #[test]
    fn in_order_pushes_keep_a_full_window() {
        let mut w = LiveWindow::new(10);
        for ts in 0..50u32 {
            w.push(entry(ts));
        }
        // cutoff is latest - window, inclusive
        assert_eq!(w.len(), 11);
        assert_eq!(w.entries()[0].timestamp_s, 39);
        assert_eq!(w.entries().last().unwrap().timestamp_s, 49);
    }

    #[test]
    fn gate_flags_weak_and_feature_poor_quanta() {
        let mut g = SignalQualityGate::new(0.01, 3, 10);

        let q = g.assess(0.2, 8);
        assert!(!q.weak_energy && !q.feature_poor && !q.advise_reposition);

        let q = g.assess(0.001, 1);
        assert!(q.weak_energy);
        assert!(q.feature_poor);
        assert!(!q.advise_reposition);
    }

    #[test]
    fn reposition_advisory_after_consecutive_low_feature_quanta() {
        let mut g = SignalQualityGate::new(0.01, 3, 10);
        for i in 0..9 {
            let q = g.assess(0.5, 0);
            assert!(!q.advise_reposition, "advisory raised too early at {}", i);
        }
        let q = g.assess(0.5, 0);
        assert!(q.advise_reposition);

        // one healthy quantum resets the counter
        let q = g.assess(0.5, 5);
        assert!(!q.advise_reposition);
        assert_eq!(g.consecutive_low(), 0);
    }
}
