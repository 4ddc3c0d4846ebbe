//! Utterance endpoint detection.
//!
//! Given the latest normalized audio frame and the transcript so far, an
//! [`EndpointDetector`] decides whether the caller has finished speaking.
//! [`RuleBasedDetector`] combines silence timing, terminal punctuation,
//! closing-phrase patterns and a lightweight semantic heuristic;
//! [`PredictiveDetector`] wraps it with a confidence score and a stateless
//! look-ahead estimate for "about to finish" affordances.

pub mod config;
pub mod predictive;
pub mod rule_based;

pub use config::EndpointConfig;
pub use predictive::PredictiveDetector;
pub use rule_based::RuleBasedDetector;

/// Capability trait for utterance-completion detection.
///
/// Detectors are stateful per utterance; the manager calls
/// [`reset`](EndpointDetector::reset) after every finalize.
pub trait EndpointDetector: Send + Sync {
    /// Evaluate the latest frame plus the transcript so far. Returns true at
    /// most once per utterance; subsequent frames return false until speech
    /// resumes or the detector is reset.
    fn detect_endpoint(&mut self, frame: &[f32], transcript: &str) -> bool;

    /// Clear all per-utterance timing and buffers.
    fn reset(&mut self);
}
