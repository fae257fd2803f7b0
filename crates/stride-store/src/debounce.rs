use std::time::Duration;

use tokio::time::Instant;

/// What the caller should do after recording a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveDecision {
    /// Persist immediately.
    Now,
    /// Persist at this deadline unless something forces it sooner.
    At(Instant),
    /// A deadline is already armed.
    Wait,
}

/// Batches text deltas so a save is not issued per character, while
/// completed parts and messages are persisted right away.
#[derive(Debug)]
pub struct SaveDebouncer {
    max_deltas: u32,
    interval: Duration,
    pending_deltas: u32,
    deadline: Option<Instant>,
}

impl SaveDebouncer {
    pub fn new(max_deltas: u32, interval: Duration) -> Self {
        Self {
            max_deltas: max_deltas.max(1),
            interval,
            pending_deltas: 0,
            deadline: None,
        }
    }

    /// A text delta was applied.
    pub fn record_delta(&mut self, now: Instant) -> SaveDecision {
        self.pending_deltas += 1;
        if self.pending_deltas >= self.max_deltas {
            return SaveDecision::Now;
        }
        match self.deadline {
            Some(_) => SaveDecision::Wait,
            None => {
                let deadline = now + self.interval;
                self.deadline = Some(deadline);
                SaveDecision::At(deadline)
            }
        }
    }

    /// A part or message completed, or the user added a message.
    pub fn record_boundary(&mut self) -> SaveDecision {
        SaveDecision::Now
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_pending(&self) -> bool {
        self.pending_deltas > 0 || self.deadline.is_some()
    }

    /// Reset after a save was issued.
    pub fn saved(&mut self) {
        self.pending_deltas = 0;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_delta_arms_deadline() {
        tokio::time::pause();
        let now = Instant::now();
        let mut d = SaveDebouncer::new(5, Duration::from_millis(500));
        assert_eq!(
            d.record_delta(now),
            SaveDecision::At(now + Duration::from_millis(500))
        );
        assert_eq!(d.record_delta(now), SaveDecision::Wait);
        assert!(d.has_pending());
    }

    #[tokio::test]
    async fn delta_count_forces_save() {
        tokio::time::pause();
        let now = Instant::now();
        let mut d = SaveDebouncer::new(3, Duration::from_secs(10));
        d.record_delta(now);
        d.record_delta(now);
        assert_eq!(d.record_delta(now), SaveDecision::Now);
        d.saved();
        assert!(!d.has_pending());
        assert_eq!(d.deadline(), None);
    }

    #[test]
    fn boundaries_save_immediately() {
        let mut d = SaveDebouncer::new(100, Duration::from_secs(10));
        assert_eq!(d.record_boundary(), SaveDecision::Now);
    }

    #[test]
    fn zero_delta_budget_is_clamped() {
        let mut d = SaveDebouncer::new(0, Duration::from_secs(1));
        assert_eq!(d.record_delta(Instant::now()), SaveDecision::Now);
    }
}
