//! Audio processing boundary consumed by the streaming manager.
//!
//! The manager does not own feature extraction or the recognizer; it only
//! needs raw chunks turned into a normalized waveform so the endpoint
//! detector can measure frame energy. `LinearPcmProcessor` covers the common
//! linear16 case; callers with a real DSP front end implement
//! [`AudioProcessor`] themselves.

use std::sync::Arc;

/// Error types for audio chunk processing
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),
}

/// Boundary trait for turning raw audio bytes into normalized samples.
pub trait AudioProcessor: Send + Sync {
    /// Decode a raw chunk into f32 samples normalized to [-1.0, 1.0].
    fn process_chunk(&self, chunk: &[u8]) -> Result<Vec<f32>, AudioError>;

    /// Apply noise reduction to a normalized waveform.
    fn apply_noise_reduction(&self, samples: Vec<f32>) -> Vec<f32>;
}

/// Shared handle to an audio processor implementation.
pub type SharedAudioProcessor = Arc<dyn AudioProcessor>;

/// Default processor for 16-bit little-endian PCM (linear16).
#[derive(Debug, Default, Clone)]
pub struct LinearPcmProcessor;

impl AudioProcessor for LinearPcmProcessor {
    fn process_chunk(&self, chunk: &[u8]) -> Result<Vec<f32>, AudioError> {
        if chunk.len() % 2 != 0 {
            return Err(AudioError::InvalidFormat(format!(
                "linear16 chunk has odd byte length {}",
                chunk.len()
            )));
        }

        let samples = chunk
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        Ok(samples)
    }

    fn apply_noise_reduction(&self, mut samples: Vec<f32>) -> Vec<f32> {
        if samples.is_empty() {
            return samples;
        }

        // DC-offset removal only; heavier filtering belongs to an external
        // DSP implementation of the trait.
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        for sample in &mut samples {
            *sample -= mean;
        }
        samples
    }
}

/// Root-mean-square energy of a normalized frame.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_chunk_decodes_linear16() {
        let processor = LinearPcmProcessor;
        // Two samples: 0 and i16::MAX.
        let chunk = [0u8, 0u8, 0xFF, 0x7F];
        let samples = processor.process_chunk(&chunk).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - (i16::MAX as f32 / 32768.0)).abs() < 1e-6);
    }

    #[test]
    fn test_process_chunk_rejects_odd_length() {
        let processor = LinearPcmProcessor;
        let result = processor.process_chunk(&[0u8, 1u8, 2u8]);
        assert!(matches!(result, Err(AudioError::InvalidFormat(_))));
    }

    #[test]
    fn test_noise_reduction_removes_dc_offset() {
        let processor = LinearPcmProcessor;
        let samples = vec![0.5, 0.5, 0.5, 0.5];
        let filtered = processor.apply_noise_reduction(samples);
        assert!(filtered.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn test_rms_energy() {
        assert_eq!(rms_energy(&[]), 0.0);
        assert_eq!(rms_energy(&[0.0, 0.0]), 0.0);
        let energy = rms_energy(&[0.5, -0.5, 0.5, -0.5]);
        assert!((energy - 0.5).abs() < 1e-6);
    }
}
