//! Predictive endpoint detection.
//!
//! Wraps the rule-based detector with a confidence score per detection and a
//! stateless look-ahead estimate of imminent completion, used for UI
//! "about to finish" affordances.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use super::config::EndpointConfig;
use super::rule_based::RuleBasedDetector;
use super::EndpointDetector;

static QUESTION_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "who", "what", "when", "where", "why", "how", "which", "whose", "can", "could", "would",
        "should", "will", "do", "does", "did", "is", "are",
    ]
    .into_iter()
    .collect()
});

static TRAILING_CONJUNCTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["and", "but", "or", "so", "because", "nor", "yet"]
        .into_iter()
        .collect()
});

/// Silence beyond this adds to the detection confidence.
const LONG_SILENCE_MS: f64 = 2000.0;

/// Endpoint detector that also scores its own detections.
pub struct PredictiveDetector {
    inner: RuleBasedDetector,
}

impl PredictiveDetector {
    pub fn new(config: EndpointConfig, sample_rate: u32) -> Self {
        Self {
            inner: RuleBasedDetector::new(config, sample_rate),
        }
    }

    /// Run detection and return a confidence in [0, 1] alongside the result.
    ///
    /// Base 0.6 on a positive detection, +0.2 for terminal punctuation,
    /// +0.1 for a closing-phrase match, +0.1 for silence beyond 2000ms,
    /// capped at 1.0. A negative detection scores 0.0.
    pub fn detect_with_confidence(&mut self, frame: &[f32], transcript: &str) -> (bool, f32) {
        let detected = self.inner.detect_endpoint(frame, transcript);
        if !detected {
            return (false, 0.0);
        }

        let signals = self.inner.last_signals();
        let mut confidence = 0.6f32;
        if signals.punctuation {
            confidence += 0.2;
        }
        if signals.pattern {
            confidence += 0.1;
        }
        if signals.silence_ms > LONG_SILENCE_MS {
            confidence += 0.1;
        }
        (true, confidence.min(1.0))
    }

    /// Stateless estimate of how close the utterance is to completion.
    ///
    /// Does not require an actual detection and does not touch the timing
    /// state machine.
    pub fn predict_next_endpoint(&self, transcript: &str) -> f32 {
        let trimmed = transcript.trim();
        if trimmed.is_empty() {
            return 0.0;
        }

        let words: Vec<String> = trimmed
            .split_whitespace()
            .map(|word| {
                word.chars()
                    .filter(|c| c.is_alphanumeric() || *c == '\'')
                    .collect::<String>()
                    .to_lowercase()
            })
            .collect();

        // A trailing conjunction means the speaker is mid-thought.
        if let Some(last) = words.last() {
            if TRAILING_CONJUNCTIONS.contains(last.as_str()) {
                return 0.1;
            }
        }

        // A question is complete once its mark lands, in-progress before.
        if trimmed.contains('?') {
            return 0.9;
        }
        if words
            .iter()
            .any(|word| QUESTION_WORDS.contains(word.as_str()))
        {
            return 0.3;
        }

        if words.len() <= 3 {
            return 0.8;
        }
        if words.len() > 10 {
            return 0.7;
        }
        0.5
    }
}

impl EndpointDetector for PredictiveDetector {
    fn detect_endpoint(&mut self, frame: &[f32], transcript: &str) -> bool {
        self.detect_with_confidence(frame, transcript).0
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 16000;

    fn detector() -> PredictiveDetector {
        let config = EndpointConfig::default()
            .with_silence_threshold_ms(1500)
            .with_min_utterance_duration_ms(500);
        PredictiveDetector::new(config, SAMPLE_RATE)
    }

    fn speech(duration_ms: u64) -> Vec<f32> {
        vec![0.3; (SAMPLE_RATE as u64 * duration_ms / 1000) as usize]
    }

    fn silence(duration_ms: u64) -> Vec<f32> {
        vec![0.0; (SAMPLE_RATE as u64 * duration_ms / 1000) as usize]
    }

    #[test]
    fn test_negative_detection_scores_zero() {
        let mut detector = detector();
        let (detected, confidence) = detector.detect_with_confidence(&speech(250), "still going");
        assert!(!detected);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_punctuation_boosts_confidence() {
        let mut detector = detector();
        let (detected, confidence) =
            detector.detect_with_confidence(&speech(250), "that works for me.");
        assert!(detected);
        // Base 0.6 + 0.2 punctuation.
        assert!((confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_pattern_and_punctuation_stack() {
        let mut detector = detector();
        let (detected, confidence) = detector.detect_with_confidence(&speech(250), "thank you!");
        assert!(detected);
        // Base 0.6 + 0.2 punctuation + 0.1 pattern.
        assert!((confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_long_silence_boosts_confidence() {
        let mut detector = detector();
        let transcript = "dim the bedroom lamp";
        for _ in 0..4 {
            detector.detect_endpoint(&speech(250), transcript);
        }
        let mut result = (false, 0.0);
        for _ in 0..9 {
            let outcome = detector.detect_with_confidence(&silence(250), transcript);
            if outcome.0 {
                result = outcome;
            }
        }
        assert!(result.0);
        // Silence fires at 1500ms which is not beyond 2000ms: base only.
        assert!((result.1 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_capped_at_one() {
        let config = EndpointConfig::default()
            .with_silence_threshold_ms(2100)
            .with_min_utterance_duration_ms(250);
        let mut detector = PredictiveDetector::new(config, SAMPLE_RATE);

        // The transcript stays signal-free until the recognizer delivers the
        // punctuated closing phrase, so nothing fires before the silence run
        // passes 2000ms and every bonus applies at once.
        let in_progress = "hand me the towel";
        for _ in 0..4 {
            assert!(!detector.detect_endpoint(&speech(250), in_progress));
        }
        for _ in 0..8 {
            assert!(!detector.detect_endpoint(&silence(250), in_progress));
        }
        let (detected, confidence) =
            detector.detect_with_confidence(&silence(250), "okay thanks goodbye.");
        assert!(detected);
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn test_predict_empty_transcript() {
        assert_eq!(detector().predict_next_endpoint(""), 0.0);
        assert_eq!(detector().predict_next_endpoint("   "), 0.0);
    }

    #[test]
    fn test_predict_short_utterance() {
        assert_eq!(detector().predict_next_endpoint("turn it off"), 0.8);
    }

    #[test]
    fn test_predict_question_in_progress_then_complete() {
        let detector = detector();
        assert_eq!(
            detector.predict_next_endpoint("what time does the store"),
            0.3
        );
        assert_eq!(
            detector.predict_next_endpoint("what time does the store close?"),
            0.9
        );
    }

    #[test]
    fn test_predict_trailing_conjunction() {
        assert_eq!(
            detector().predict_next_endpoint("I'd like the large one and"),
            0.1
        );
    }

    #[test]
    fn test_predict_long_utterance() {
        let transcript =
            "please add the blue mug the red plate a set of forks plus napkins to my cart";
        assert_eq!(detector().predict_next_endpoint(transcript), 0.7);
    }

    #[test]
    fn test_predict_default_score() {
        assert_eq!(
            detector().predict_next_endpoint("send them my usual delivery note"),
            0.5
        );
    }
}
