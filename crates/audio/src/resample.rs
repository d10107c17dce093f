//! Audio resampling.

use lvsr_core::{AsrError, AsrResult, AudioBuffer};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

const CHUNK_SIZE: usize = 1024;

/// Audio resampler for converting sample rates.
pub struct Resampler {
    target_sample_rate: usize,
}

impl Resampler {
    /// Create a new resampler with target sample rate.
    pub fn new(target_sample_rate: usize) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> usize {
        self.target_sample_rate
    }

    /// Resample a mono buffer to the target sample rate.
    ///
    /// The resampler delay is trimmed, so the output holds
    /// `ceil(len * ratio)` samples aligned with the input.
    pub fn resample(&self, buffer: &AudioBuffer) -> AsrResult<AudioBuffer> {
        if buffer.sample_rate == self.target_sample_rate {
            return Ok(buffer.clone());
        }
        if buffer.channels != 1 {
            return Err(AsrError::Audio(
                "Resampling requires mono audio. Use to_mono() first.".to_string(),
            ));
        }

        let ratio = self.target_sample_rate as f64 / buffer.sample_rate as f64;
        let expected = (buffer.samples.len() as f64 * ratio).ceil() as usize;

        let mut resampler = FftFixedIn::<f32>::new(
            buffer.sample_rate,
            self.target_sample_rate,
            CHUNK_SIZE,
            1,
            1,
        )
        .map_err(|e| AsrError::Audio(format!("Failed to create resampler: {}", e)))?;
        let delay = resampler.output_delay();

        let mut output = Vec::with_capacity(expected + delay);
        let mut chunks = buffer.samples.chunks_exact(CHUNK_SIZE);
        for chunk in chunks.by_ref() {
            let produced = resampler
                .process(&[chunk], None)
                .map_err(|e| AsrError::Audio(format!("Resampling failed: {}", e)))?;
            output.extend_from_slice(&produced[0]);
        }

        let tail = chunks.remainder();
        if !tail.is_empty() {
            let produced = resampler
                .process_partial(Some(&[tail]), None)
                .map_err(|e| AsrError::Audio(format!("Resampling failed: {}", e)))?;
            output.extend_from_slice(&produced[0]);
        }

        // Досливаем задержку фильтра.
        while output.len() < expected + delay {
            let produced = resampler
                .process_partial::<&[f32]>(None, None)
                .map_err(|e| AsrError::Audio(format!("Resampling failed: {}", e)))?;
            if produced[0].is_empty() {
                break;
            }
            output.extend_from_slice(&produced[0]);
        }

        let samples: Vec<f32> = output.into_iter().skip(delay).take(expected).collect();
        debug!(
            "Ресемплинг {} Гц -> {} Гц: {} -> {} сэмплов",
            buffer.sample_rate,
            self.target_sample_rate,
            buffer.samples.len(),
            samples.len()
        );
        Ok(AudioBuffer::new(samples, self.target_sample_rate, 1))
    }

    /// Down-mix to mono, then resample.
    pub fn prepare(&self, buffer: &AudioBuffer) -> AsrResult<AudioBuffer> {
        self.resample(&crate::loader::to_mono(buffer)?)
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new(16000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resampler_no_change() {
        let buffer = AudioBuffer::new(vec![0.0; 1024], 16000, 1);
        let resampler = Resampler::new(16000);
        let result = resampler.resample(&buffer).unwrap();

        assert_eq!(result.sample_rate, 16000);
        assert_eq!(result.samples.len(), buffer.samples.len());
    }

    #[test]
    fn test_resampler_output_length() {
        let buffer = AudioBuffer::new(vec![0.1; 8000 + 333], 8000, 1);
        let result = Resampler::new(16000).resample(&buffer).unwrap();
        assert_eq!(result.sample_rate, 16000);
        assert!(result.samples.len() <= 2 * 8333);
        assert!(result.samples.len() >= 2 * 8333 - CHUNK_SIZE);
    }

    #[test]
    fn test_resampler_requires_mono() {
        let buffer = AudioBuffer::new(vec![0.0; 2048], 8000, 2);
        assert!(Resampler::new(16000).resample(&buffer).is_err());
        assert_eq!(
            Resampler::new(16000).prepare(&buffer).unwrap().channels,
            1
        );
    }
}
