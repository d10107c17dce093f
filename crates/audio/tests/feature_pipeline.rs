//! Integration tests: WAV on disk -> mono 16 kHz -> log-spectrogram -> normalization.

use std::f32::consts::PI;

use audio::{load_wav, LogSpectrogram, Normalization, Resampler};
use lvsr_core::{AsrResult, DataStream, FeatureExample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Тон 440 Гц поверх слабого белого шума: каждая частотная полоса меняется
/// от фрейма к фрейму.
fn write_noisy_tone(path: &std::path::Path, sample_rate: u32, channels: u16, seconds: f32) {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let mut rng = StdRng::seed_from_u64(17);
    let total = (sample_rate as f32 * seconds) as usize;
    for n in 0..total {
        let tone = (2.0 * PI * 440.0 * n as f32 / sample_rate as f32).sin() * 0.4;
        let v = tone + rng.gen_range(-0.1f32..0.1);
        for _ in 0..channels {
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
    }
    writer.finalize().unwrap();
}

struct Single(Vec<FeatureExample>);

impl DataStream for Single {
    type Item = FeatureExample;

    fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<FeatureExample>> + '_> {
        Box::new(self.0.iter().cloned().map(Ok))
    }
}

#[test]
fn test_wav_to_normalized_features() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tone.wav");
    write_noisy_tone(&path, 8000, 2, 0.5);

    let buffer = load_wav(&path).unwrap();
    assert_eq!(buffer.channels, 2);

    let prepared = Resampler::new(16000).prepare(&buffer).unwrap();
    assert_eq!(prepared.sample_rate, 16000);
    assert_eq!(prepared.channels, 1);

    let extractor = LogSpectrogram::default();
    let features = extractor.extract(&prepared.samples).unwrap();
    assert_eq!(features.num_features(), 129);
    assert_eq!(
        features.num_frames(),
        extractor.num_frames(prepared.samples.len())
    );
    assert!(features.data().iter().all(|v| v.is_finite()));

    let mut stream = Single(vec![FeatureExample {
        id: "tone".into(),
        features,
        labels: vec![27],
    }]);
    let norm = Normalization::fit(&mut stream).unwrap();
    let (raw_mean, raw_std) = (norm.mean.clone(), norm.std.clone());
    let mut normalized = norm.wrap_stream(stream);
    let example = normalized.epoch_iter().next().unwrap().unwrap();

    // После нормализации каждый признак центрирован с точностью до
    // округления f32 относительно исходного масштаба.
    let width = example.features.num_features();
    let frames = example.features.num_frames() as f32;
    for f in 0..width {
        let mean: f32 = example.features.frames().map(|fr| fr[f]).sum::<f32>() / frames;
        let rounding = 8.0 * f32::EPSILON * (raw_mean[f].abs() + raw_std[f]) / raw_std[f];
        let tolerance = 1e-3f32.max(rounding);
        assert!(mean.abs() < tolerance, "feature {f} mean {mean}, tolerance {tolerance}");
    }
}
