//! Лог-амплитудная спектрограмма.
//!
//! Окно Ханна, STFT без центрирования и паддинга, `ln(|X| + 1e-6)` по каждому
//! из `n_fft / 2 + 1` частотных бинов.

use lvsr_core::{AsrError, AsrResult, FeatureExtractorConfig, FeatureSequence};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Добавка под логарифм.
const LOG_FLOOR: f32 = 1e-6;

/// Экстрактор лог-спектрограммы.
pub struct LogSpectrogram {
    config: FeatureExtractorConfig,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for LogSpectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSpectrogram")
            .field("config", &self.config)
            .finish()
    }
}

impl LogSpectrogram {
    pub fn new(config: FeatureExtractorConfig) -> Self {
        let window = hann_window(config.n_fft);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.n_fft);
        Self {
            config,
            window,
            fft,
        }
    }

    /// Число признаков на фрейм.
    pub fn num_features(&self) -> usize {
        self.config.num_features()
    }

    /// Частота дискретизации, которую ожидает экстрактор.
    pub fn sample_rate(&self) -> usize {
        self.config.sample_rate
    }

    /// Число фреймов для сигнала длины `num_samples`.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        if num_samples < self.config.n_fft {
            0
        } else {
            1 + (num_samples - self.config.n_fft) / self.config.hop_length
        }
    }

    /// Извлечь признаки из моно-сигнала.
    ///
    /// Пустой сигнал, сигнал короче одного окна и неконечные сэмплы
    /// отклоняются.
    pub fn extract(&self, samples: &[f32]) -> AsrResult<FeatureSequence> {
        if samples.is_empty() {
            return Err(AsrError::Data("empty recording".into()));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(AsrError::Data("recording contains non-finite samples".into()));
        }
        let num_frames = self.num_frames(samples.len());
        if num_frames == 0 {
            return Err(AsrError::Data(format!(
                "recording of {} samples is shorter than one window ({})",
                samples.len(),
                self.config.n_fft
            )));
        }

        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_features = self.num_features();
        let mut data = Vec::with_capacity(num_frames * num_features);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];

        for frame in 0..num_frames {
            let start = frame * hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(samples[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);
            data.extend(
                buffer
                    .iter()
                    .take(num_features)
                    .map(|c| (c.norm() + LOG_FLOOR).ln()),
            );
        }

        FeatureSequence::new(data, num_frames, num_features)
    }
}

impl Default for LogSpectrogram {
    fn default() -> Self {
        Self::new(FeatureExtractorConfig::default())
    }
}

/// Periodic Hann window.
fn hann_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / length as f32).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window() {
        let window = hann_window(256);
        assert_eq!(window.len(), 256);
        assert!(window[0].abs() < 1e-6);
        assert!((window[128] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_frame_count() {
        let extractor = LogSpectrogram::default();
        assert_eq!(extractor.num_features(), 129);
        assert_eq!(extractor.num_frames(255), 0);
        assert_eq!(extractor.num_frames(256), 1);
        assert_eq!(extractor.num_frames(383), 1);
        assert_eq!(extractor.num_frames(384), 2);
        assert_eq!(extractor.num_frames(16000), 124);
    }

    #[test]
    fn test_silence_hits_floor() {
        let features = LogSpectrogram::default().extract(&[0.0; 512]).unwrap();
        assert_eq!(features.num_frames(), 3);
        let floor = LOG_FLOOR.ln();
        assert!(features.data().iter().all(|v| (v - floor).abs() < 1e-4));
    }

    #[test]
    fn test_tone_peaks_at_its_bin() {
        // 16 периодов на окно 256 => пик в бине 16
        let samples: Vec<f32> = (0..1024)
            .map(|n| (2.0 * PI * 16.0 * n as f32 / 256.0).sin())
            .collect();
        let features = LogSpectrogram::default().extract(&samples).unwrap();
        let frame = features.frame(0);
        let peak = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
    }

    #[test]
    fn test_rejects_bad_recordings() {
        let extractor = LogSpectrogram::default();
        assert!(matches!(extractor.extract(&[]), Err(AsrError::Data(_))));
        assert!(matches!(extractor.extract(&[0.1; 100]), Err(AsrError::Data(_))));
        let mut samples = vec![0.0; 512];
        samples[10] = f32::NAN;
        assert!(matches!(extractor.extract(&samples), Err(AsrError::Data(_))));
    }
}
