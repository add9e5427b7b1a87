//! Interruption policy: decides whether user speech during agent playback is a barge-in.

use crate::config::InterruptionThresholds;
use crate::turn::TurnState;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionDecision {
    Ignore,
    Interrupt,
}

/// Stateless threshold check. Only meaningful while the agent is speaking.
#[derive(Debug, Clone, Copy)]
pub struct InterruptionPolicy {
    thresholds: InterruptionThresholds,
}

impl InterruptionPolicy {
    pub fn new(thresholds: InterruptionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &InterruptionThresholds {
        &self.thresholds
    }

    /// `speech` is the elapsed duration of the candidate segment, `words` the word
    /// count of whatever transcript fragment exists for it (0 if none yet).
    pub fn evaluate(&self, state: TurnState, speech: Duration, words: usize) -> InterruptionDecision {
        if state != TurnState::AgentSpeaking {
            return InterruptionDecision::Ignore;
        }
        if speech < self.thresholds.min_speech_duration_to_interrupt() {
            return InterruptionDecision::Ignore;
        }
        let min_words = self.thresholds.min_words_to_interrupt;
        if min_words > 0 && words < min_words {
            return InterruptionDecision::Ignore;
        }
        InterruptionDecision::Interrupt
    }

    /// Whether a candidate that passed the duration check still needs words.
    pub fn needs_words(&self, words: usize) -> bool {
        words < self.thresholds.min_words_to_interrupt
    }
}

/// Words in a transcript fragment.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min_ms: u64, words: usize) -> InterruptionPolicy {
        InterruptionPolicy::new(InterruptionThresholds::new(
            Duration::from_millis(min_ms),
            words,
            Duration::from_millis(800),
        ))
    }

    #[test]
    fn duration_only_barge_in() {
        let p = policy(600, 0);
        let speaking = TurnState::AgentSpeaking;
        assert_eq!(p.evaluate(speaking, Duration::from_millis(599), 0), InterruptionDecision::Ignore);
        assert_eq!(p.evaluate(speaking, Duration::from_millis(600), 0), InterruptionDecision::Interrupt);
        assert_eq!(p.evaluate(speaking, Duration::from_millis(700), 0), InterruptionDecision::Interrupt);
    }

    #[test]
    fn words_required_when_configured() {
        let p = policy(300, 2);
        let speaking = TurnState::AgentSpeaking;
        assert_eq!(p.evaluate(speaking, Duration::from_secs(1), 0), InterruptionDecision::Ignore);
        assert_eq!(p.evaluate(speaking, Duration::from_secs(1), 1), InterruptionDecision::Ignore);
        assert_eq!(p.evaluate(speaking, Duration::from_secs(1), 2), InterruptionDecision::Interrupt);
        // Words never compensate for a short blip.
        assert_eq!(p.evaluate(speaking, Duration::from_millis(100), 5), InterruptionDecision::Ignore);
    }

    #[test]
    fn other_states_always_ignore() {
        let p = policy(0, 0);
        for state in [
            TurnState::Idle,
            TurnState::UserSpeaking,
            TurnState::Generating,
            TurnState::Interrupted,
            TurnState::ShuttingDown,
        ] {
            assert_eq!(p.evaluate(state, Duration::from_secs(5), 10), InterruptionDecision::Ignore);
        }
    }

    #[test]
    fn word_count_skips_punctuation() {
        assert_eq!(count_words("  aspetta, un momento ... "), 3);
        assert_eq!(count_words(""), 0);
    }
}
