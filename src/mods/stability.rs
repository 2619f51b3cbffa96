use crate::mods::scorer::MatchDecision;

/// Rolling view of how the tracker classified the latest decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Continuity {
    NotMatched,
    Fresh,
    Continued,
    /// Drift between the small and large thresholds: neither a continuation
    /// nor clearly a new position, so the counter is held.
    Ambiguous,
    /// Drift at or past the large threshold: treated as a brand new match.
    HardReset,
}

#[derive(Clone, Copy, Debug)]
pub struct StabilityStatus {
    pub continuity: Continuity,
    pub consecutive_matches: u32,
    pub is_stable: bool,
    pub offset_s: Option<i32>,
}

/// Consumes successive match decisions and decides when a match is stable
/// enough to act on. Live and reference clocks advance together, so a
/// continuing match keeps a near-constant offset; the thresholds bound how
/// far successive offsets may wander from that expectation.
pub struct StabilityTracker {
    required_stable_offsets: u32,
    small_change_s: i32,
    large_change_s: i32,

    consecutive_matches: u32,
    history: Vec<i32>,
    last_offset: Option<i32>,
}

impl StabilityTracker {
    pub fn new(required_stable_offsets: u32, small_change_s: i32, large_change_s: i32) -> Self {
        Self {
            required_stable_offsets: required_stable_offsets.max(1),
            small_change_s,
            large_change_s,
            consecutive_matches: 0,
            history: Vec::new(),
            last_offset: None,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_matches = 0;
        self.history.clear();
        self.last_offset = None;
    }

    pub fn update(&mut self, decision: &MatchDecision) -> StabilityStatus {
        if !decision.is_matched {
            // transient miss: drop the streak but keep the offset history
            self.consecutive_matches = 0;
            return self.status(Continuity::NotMatched);
        }

        let offset = decision.offset_s;
        let continuity = match self.last_offset {
            None => {
                self.consecutive_matches = 1;
                self.history.clear();
                self.history.push(offset);
                Continuity::Fresh
            }
            Some(last) => {
                let drift = (offset - last).abs();
                if drift <= self.small_change_s {
                    self.consecutive_matches += 1;
                    self.push_history(offset);
                    Continuity::Continued
                } else if drift < self.large_change_s {
                    // ambiguous continuity: hold the counter steady
                    Continuity::Ambiguous
                } else {
                    // a jump this large is a new position, not drift
                    self.consecutive_matches = 1;
                    self.history.clear();
                    self.history.push(offset);
                    Continuity::HardReset
                }
            }
        };
        self.last_offset = Some(offset);

        self.status(continuity)
    }

    fn push_history(&mut self, offset: i32) {
        self.history.push(offset);
        let cap = self.required_stable_offsets as usize;
        if self.history.len() > cap {
            let drop = self.history.len() - cap;
            self.history.drain(0..drop);
        }
    }

    pub fn is_stable(&self) -> bool {
        if self.consecutive_matches < self.required_stable_offsets {
            return false;
        }
        self.mean_step_drift() <= (self.small_change_s as f64)
    }

    /// Mean absolute offset change between successive retained matches.
    fn mean_step_drift(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let steps = self.history.len() - 1;
        let sum: i64 = self.history
            .windows(2)
            .map(|w| ((w[1] - w[0]) as i64).abs())
            .sum();
        (sum as f64) / (steps as f64)
    }

    pub fn consecutive_matches(&self) -> u32 {
        self.consecutive_matches
    }

    pub fn last_offset(&self) -> Option<i32> {
        self.last_offset
    }

    fn status(&self, continuity: Continuity) -> StabilityStatus {
        StabilityStatus {
            continuity,
            consecutive_matches: self.consecutive_matches,
            is_stable: self.is_stable(),
            offset_s: self.last_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::scorer::{ MatchDecision, RejectReason };

    fn matched(offset_s: i32) -> MatchDecision {
        MatchDecision {
            is_matched: true,
            offset_s,
            confidence: 0.9,
            dominance: 5.0,
            density: 0.8,
            consistency: 0.9,
            total_matches: 40,
            candidates: Vec::new(),
            reject: None,
        }
    }

    fn missed() -> MatchDecision {
        MatchDecision::rejected(RejectReason::NoCandidates)
    }

    #[test]
    fn stable_after_required_consecutive_matches() {
        let mut t = StabilityTracker::new(3, 2, 10);

        let s = t.update(&matched(500));
        assert_eq!(s.continuity, Continuity::Fresh);
        assert!(!s.is_stable);

        let s = t.update(&matched(500));
        assert_eq!(s.continuity, Continuity::Continued);
        assert!(!s.is_stable);

        let s = t.update(&matched(501));
        assert_eq!(s.continuity, Continuity::Continued);
        assert!(s.is_stable);
        assert_eq!(s.offset_s, Some(501));
    }

    #[test]
    fn transient_miss_resets_streak_but_not_history() {
        let mut t = StabilityTracker::new(3, 2, 10);
        t.update(&matched(100));
        t.update(&matched(100));

        let s = t.update(&missed());
        assert_eq!(s.continuity, Continuity::NotMatched);
        assert_eq!(s.consecutive_matches, 0);
        // the remembered offset survives the miss
        assert_eq!(t.last_offset(), Some(100));

        // resuming at the same offset continues rather than starting fresh
        let s = t.update(&matched(100));
        assert_eq!(s.continuity, Continuity::Continued);
    }

    #[test]
    fn ambiguous_drift_holds_the_counter() {
        let mut t = StabilityTracker::new(3, 2, 10);
        t.update(&matched(200));
        t.update(&matched(200));
        assert_eq!(t.consecutive_matches(), 2);

        // 5 s drift sits between the small (2 s) and large (10 s) thresholds
        let s = t.update(&matched(205));
        assert_eq!(s.continuity, Continuity::Ambiguous);
        assert_eq!(s.consecutive_matches, 2);
        assert!(!s.is_stable);
    }

    #[test]
    fn offset_jump_hard_resets_to_a_fresh_match() {
        let mut t = StabilityTracker::new(3, 2, 10);
        t.update(&matched(300));
        t.update(&matched(300));
        t.update(&matched(300));
        assert!(t.is_stable());

        // mid-stream jump by 50 s must clear history, not count as drift
        let s = t.update(&matched(350));
        assert_eq!(s.continuity, Continuity::HardReset);
        assert_eq!(s.consecutive_matches, 1);
        assert!(!s.is_stable);
        assert_eq!(s.offset_s, Some(350));

        // and the streak rebuilds at the new position
        t.update(&matched(350));
        let s = t.update(&matched(350));
        assert!(s.is_stable);
    }
}
