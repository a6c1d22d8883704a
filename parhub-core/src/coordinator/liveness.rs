//! Heartbeat round bookkeeping
//!
//! Pure set algebra over heart identities; the monitor drives it once per
//! beat. A heart that misses one round goes on probation, a second
//! consecutive miss fails it.

use std::collections::BTreeSet;

/// Result of closing one heartbeat round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Hearts that answered without being tracked yet
    pub new_hearts: Vec<String>,
    /// Hearts that missed two consecutive rounds
    pub failures: Vec<String>,
}

impl Transition {
    pub fn is_empty(&self) -> bool {
        self.new_hearts.is_empty() && self.failures.is_empty()
    }
}

/// Alive / probation / responded sets
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    alive: BTreeSet<String>,
    probation: BTreeSet<String>,
    responded: BTreeSet<String>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a valid pong for this round
    pub fn record(&mut self, heart: &str) {
        if !self.responded.contains(heart) {
            self.responded.insert(heart.to_string());
        }
    }

    /// Classify every heart for the round that just ended and start a new one
    pub fn close_round(&mut self) -> Transition {
        let good: BTreeSet<String> = self.alive.intersection(&self.responded).cloned().collect();
        let missed: BTreeSet<String> = self.alive.difference(&good).cloned().collect();
        let failures: Vec<String> = self.probation.intersection(&missed).cloned().collect();
        let new_hearts: Vec<String> = self.responded.difference(&good).cloned().collect();

        self.alive.extend(new_hearts.iter().cloned());
        for heart in &failures {
            self.alive.remove(heart);
        }
        self.probation = missed.intersection(&self.alive).cloned().collect();
        self.responded.clear();

        Transition {
            new_hearts,
            failures,
        }
    }

    pub fn is_alive(&self, heart: &str) -> bool {
        self.alive.contains(heart)
    }

    pub fn on_probation(&self, heart: &str) -> bool {
        self.probation.contains(heart)
    }

    pub fn alive(&self) -> impl Iterator<Item = &str> {
        self.alive.iter().map(String::as_str)
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }

    /// Responses recorded so far in the current round
    pub fn responded_count(&self) -> usize {
        self.responded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(liveness: &mut Liveness, responders: &[&str]) -> Transition {
        for heart in responders {
            liveness.record(heart);
        }
        liveness.close_round()
    }

    #[test]
    fn test_responder_is_adopted() {
        let mut liveness = Liveness::new();
        let t = round(&mut liveness, &["h1"]);
        assert_eq!(t.new_hearts, vec!["h1"]);
        assert!(t.failures.is_empty());
        assert!(liveness.is_alive("h1"));

        // steady state produces no transitions
        for _ in 0..10 {
            assert!(round(&mut liveness, &["h1"]).is_empty());
        }
    }

    #[test]
    fn test_two_missed_rounds_fail() {
        let mut liveness = Liveness::new();
        round(&mut liveness, &["h1", "h2"]);

        let t = round(&mut liveness, &["h2"]);
        assert!(t.failures.is_empty());
        assert!(liveness.is_alive("h1"));
        assert!(liveness.on_probation("h1"));

        let t = round(&mut liveness, &["h2"]);
        assert_eq!(t.failures, vec!["h1"]);
        assert!(!liveness.is_alive("h1"));
        assert!(!liveness.on_probation("h1"));
        assert_eq!(liveness.alive_count(), 1);
    }

    #[test]
    fn test_probation_cleared_by_reply() {
        let mut liveness = Liveness::new();
        round(&mut liveness, &["h1"]);
        round(&mut liveness, &[]);
        assert!(liveness.on_probation("h1"));

        let t = round(&mut liveness, &["h1"]);
        assert!(t.is_empty());
        assert!(liveness.is_alive("h1"));
        assert!(!liveness.on_probation("h1"));

        // a single miss after recovery is only probation again
        assert!(round(&mut liveness, &[]).failures.is_empty());
    }

    #[test]
    fn test_failed_heart_can_return_as_new() {
        let mut liveness = Liveness::new();
        round(&mut liveness, &["h1"]);
        round(&mut liveness, &[]);
        assert_eq!(round(&mut liveness, &[]).failures, vec!["h1"]);

        let t = round(&mut liveness, &["h1"]);
        assert_eq!(t.new_hearts, vec!["h1"]);
    }

    #[test]
    fn test_responded_cleared_each_round() {
        let mut liveness = Liveness::new();
        liveness.record("h1");
        liveness.record("h1");
        assert_eq!(liveness.responded_count(), 1);
        liveness.close_round();
        assert_eq!(liveness.responded_count(), 0);
    }
}
