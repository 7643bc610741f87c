use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Score at which a user is escalated (timed out) and the score reset.
pub const ESCALATION_SCORE: f64 = 3.0;
const DECAY_STEP: f64 = 0.5;
/// Messages inside the window that count as a rapid repeat.
pub const RAPID_REPEAT_COUNT: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModerationState {
    Normal,
    Flagged,
    Escalated,
}

/// Sliding window of one user's recent messages in one server.
#[derive(Clone, Debug)]
pub struct MessageHistory {
    timestamps: VecDeque<Instant>,
    score: f64,
    last_message: Instant,
}

impl MessageHistory {
    pub fn new(now: Instant) -> Self {
        Self {
            timestamps: VecDeque::new(),
            score: 0.0,
            last_message: now,
        }
    }

    /// Trim to `window`, append `now`; returns the message count inside the window.
    pub fn observe(&mut self, now: Instant, window: Duration) -> usize {
        while let Some(&front) = self.timestamps.front() {
            if now.saturating_duration_since(front) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.push_back(now);
        self.last_message = now;
        self.timestamps.len()
    }

    /// Apply this message's violations to the score.
    ///
    /// Each violation adds 1. A clean message while the window holds at most half the
    /// burst threshold decays the score by 0.5. Reaching [`ESCALATION_SCORE`]
    /// escalates and resets.
    pub fn score_message(&mut self, violations: usize, count: usize, threshold: u32) -> ModerationState {
        if violations == 0 {
            if count as f64 <= f64::from(threshold) / 2.0 {
                self.score = (self.score - DECAY_STEP).max(0.0);
            }
            return ModerationState::Normal;
        }

        self.score += violations as f64;
        if self.score >= ESCALATION_SCORE {
            self.score = 0.0;
            ModerationState::Escalated
        } else {
            ModerationState::Flagged
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_drops_old_timestamps() {
        let window = Duration::from_secs(10);
        let mut h = MessageHistory::new(Instant::now());
        assert_eq!(h.observe(Instant::now(), window), 1);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(h.observe(Instant::now(), window), 2);
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(h.observe(Instant::now(), window), 2);
        assert_eq!(h.idle_for(Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn escalates_at_three_and_resets() {
        let mut h = MessageHistory::new(Instant::now());
        assert_eq!(h.score_message(2, 6, 5), ModerationState::Flagged);
        assert_eq!(h.score(), 2.0);
        assert_eq!(h.score_message(1, 7, 5), ModerationState::Escalated);
        assert_eq!(h.score(), 0.0);
    }

    #[tokio::test]
    async fn decay_needs_a_quiet_window() {
        let mut h = MessageHistory::new(Instant::now());
        h.score_message(2, 6, 5);
        // Still busy: no decay.
        assert_eq!(h.score_message(0, 3, 5), ModerationState::Normal);
        assert_eq!(h.score(), 2.0);
        h.score_message(0, 2, 5);
        assert_eq!(h.score(), 1.5);
        for _ in 0..10 {
            h.score_message(0, 1, 5);
        }
        assert_eq!(h.score(), 0.0);
    }
}
