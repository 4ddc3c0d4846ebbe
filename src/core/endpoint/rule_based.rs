//! Rule-based endpoint detection.
//!
//! Four independent signals, any of which ends the utterance:
//!
//! 1. Silence timing: RMS energy below the threshold accumulates silence;
//!    once a contiguous run reaches the configured threshold after enough
//!    speech, and a transcript exists, the utterance is done.
//! 2. Terminal punctuation on the trimmed transcript.
//! 3. Closing-phrase patterns (farewells, confirmations, "that's all").
//! 4. Semantic heuristic: a plausible complete clause, but only with silence
//!    corroboration - semantics alone never endpoint.

use std::collections::HashSet;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::config::EndpointConfig;
use super::EndpointDetector;
use crate::core::audio::rms_energy;

static COMPLETION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(goodbye|bye( bye)?|thank you|thanks|that'?s (all|it)|that is (all|it)|stop|no more|nothing else|i'?m (done|finished)|yes please|no thanks?)[\s.!?]*$",
    )
    .expect("completion pattern must compile")
});

static COMMON_VERBS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "is", "are", "was", "were", "am", "be", "been", "have", "has", "had", "do", "does", "did",
        "want", "wanted", "need", "needed", "like", "go", "going", "went", "get", "got", "know",
        "think", "thought", "see", "saw", "say", "said", "tell", "told", "make", "made", "take",
        "took", "come", "came", "call", "called", "help", "start", "started", "finish", "finished",
        "order", "ordered", "buy", "bought", "pay", "paid", "send", "sent", "confirm", "cancel",
        "give", "gave", "put", "look", "looking", "works", "work", "worked",
    ]
    .into_iter()
    .collect()
});

/// Which signals matched on the most recent positive detection. Consumed by
/// the predictive detector's confidence score.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SignalSnapshot {
    pub punctuation: bool,
    pub pattern: bool,
    pub silence_ms: f64,
}

/// Multi-signal rule-based endpoint detector.
pub struct RuleBasedDetector {
    config: EndpointConfig,
    sample_rate: u32,
    speaking: bool,
    speech_ms: f64,
    silence_ms: f64,
    utterance_start: Option<Instant>,
    /// Latch preventing repeated detections for the same utterance.
    fired: bool,
    last_signals: SignalSnapshot,
}

impl RuleBasedDetector {
    pub fn new(config: EndpointConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
            speaking: false,
            speech_ms: 0.0,
            silence_ms: 0.0,
            utterance_start: None,
            fired: false,
            last_signals: SignalSnapshot::default(),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Contiguous silence accumulated since the last speech frame (ms).
    pub fn current_silence_ms(&self) -> f64 {
        self.silence_ms
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub(crate) fn last_signals(&self) -> SignalSnapshot {
        self.last_signals
    }

    /// Update the speech/silence timing state machine for one frame.
    fn track_frame(&mut self, frame: &[f32]) {
        if frame.is_empty() {
            return;
        }
        let frame_ms = frame.len() as f64 / self.sample_rate as f64 * 1000.0;
        let energy = rms_energy(frame);

        if energy >= self.config.energy_threshold {
            if !self.speaking {
                self.speaking = true;
                if self.utterance_start.is_none() {
                    self.utterance_start = Some(Instant::now());
                    self.speech_ms = 0.0;
                    debug!("Endpoint: utterance started");
                }
            }
            // A speech frame resets the silence run and re-arms the latch.
            self.silence_ms = 0.0;
            self.fired = false;
            self.speech_ms += frame_ms;
        } else {
            if self.speaking {
                self.speaking = false;
                debug!(
                    "Endpoint: silence after {:.0}ms of speech",
                    self.speech_ms
                );
            }
            self.silence_ms += frame_ms;
        }
    }

    fn punctuation_signal(&self, trimmed: &str) -> bool {
        trimmed
            .chars()
            .last()
            .map(|last| self.config.punctuation.contains(&last))
            .unwrap_or(false)
    }

    fn pattern_signal(trimmed: &str) -> bool {
        !trimmed.is_empty() && COMPLETION_PATTERN.is_match(trimmed)
    }

    /// Verb-presence heuristic over three or more words. Only meaningful in
    /// combination with ongoing silence.
    fn semantic_signal(&self, trimmed: &str) -> bool {
        if self.silence_ms <= 0.0 {
            return false;
        }
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        if words.len() < 3 {
            return false;
        }
        words.iter().any(|word| {
            let normalized: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '\'')
                .collect::<String>()
                .to_lowercase();
            COMMON_VERBS.contains(normalized.as_str())
        })
    }
}

impl EndpointDetector for RuleBasedDetector {
    fn detect_endpoint(&mut self, frame: &[f32], transcript: &str) -> bool {
        self.track_frame(frame);

        let trimmed = transcript.trim();
        if trimmed.is_empty() {
            return false;
        }

        let silence = self.silence_ms >= self.config.silence_threshold_ms as f64
            && self.speech_ms >= self.config.min_utterance_duration_ms as f64;
        let punctuation = self.punctuation_signal(trimmed);
        let pattern = Self::pattern_signal(trimmed);
        let semantic = self.semantic_signal(trimmed);

        let detected = silence || punctuation || pattern || semantic;
        if !detected || self.fired {
            return false;
        }

        self.fired = true;
        self.last_signals = SignalSnapshot {
            punctuation,
            pattern,
            silence_ms: self.silence_ms,
        };
        debug!(
            silence,
            punctuation, pattern, semantic, "Endpoint detected"
        );
        true
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.speech_ms = 0.0;
        self.silence_ms = 0.0;
        self.utterance_start = None;
        self.fired = false;
        self.last_signals = SignalSnapshot::default();
    }
}
