//! Tunables for utterance endpoint detection.

/// Configuration for an endpoint detector instance. Immutable once the
/// detector is constructed.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Contiguous silence required before the silence signal fires (ms).
    pub silence_threshold_ms: u64,
    /// Minimum accumulated speech before silence can end the utterance (ms).
    /// Filters out brief noise spikes masquerading as utterances.
    pub min_utterance_duration_ms: u64,
    /// RMS energy below which a frame counts as silence (normalized samples).
    pub energy_threshold: f32,
    /// Terminal punctuation that endpoints immediately. Covers Latin and CJK
    /// terminal marks by default.
    pub punctuation: Vec<char>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 800,
            min_utterance_duration_ms: 500,
            energy_threshold: 0.01,
            punctuation: vec!['.', '!', '?', '。', '！', '？'],
        }
    }
}

impl EndpointConfig {
    pub fn with_silence_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.silence_threshold_ms = threshold_ms;
        self
    }

    pub fn with_min_utterance_duration_ms(mut self, duration_ms: u64) -> Self {
        self.min_utterance_duration_ms = duration_ms;
        self
    }

    pub fn with_energy_threshold(mut self, threshold: f32) -> Self {
        self.energy_threshold = threshold;
        self
    }

    pub fn with_punctuation(mut self, punctuation: Vec<char>) -> Self {
        self.punctuation = punctuation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_covers_cjk_punctuation() {
        let config = EndpointConfig::default();
        assert!(config.punctuation.contains(&'。'));
        assert!(config.punctuation.contains(&'？'));
        assert!(config.punctuation.contains(&'.'));
    }

    #[test]
    fn test_builder_methods() {
        let config = EndpointConfig::default()
            .with_silence_threshold_ms(1500)
            .with_min_utterance_duration_ms(500)
            .with_energy_threshold(0.02);
        assert_eq!(config.silence_threshold_ms, 1500);
        assert_eq!(config.min_utterance_duration_ms, 500);
        assert_eq!(config.energy_threshold, 0.02);
    }
}
