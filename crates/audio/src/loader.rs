//! WAV file loading.

use hound::WavReader;
use lvsr_core::{AsrError, AsrResult, AudioBuffer};
use std::path::Path;
use tracing::debug;

/// Load a WAV file and return an AudioBuffer.
///
/// Integer PCM is scaled to [-1.0, 1.0]. Headers without channels or sample
/// rate, empty files and non-finite samples are rejected.
pub fn load_wav(path: impl AsRef<Path>) -> AsrResult<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path).map_err(|e| {
        AsrError::Audio(format!("Failed to open WAV {}: {}", path.display(), e))
    })?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate as usize;
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AsrError::Audio(format!("Failed to read samples: {}", e)))?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AsrError::Audio(format!("Failed to read samples: {}", e)))?
        }
    };

    let buffer = AudioBuffer::new(samples, sample_rate, channels);
    buffer.validate()?;
    let samples = &buffer.samples;

    if samples.is_empty() {
        return Err(AsrError::Data(format!("{} contains no samples", path.display())));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(AsrError::Data(format!(
            "{} contains non-finite samples",
            path.display()
        )));
    }

    debug!(
        "Загружен {}: {} сэмплов, {} Гц, {} кан.",
        path.display(),
        samples.len(),
        sample_rate,
        channels
    );
    Ok(buffer)
}

/// Convert multi-channel audio to mono by averaging channels.
pub fn to_mono(buffer: &AudioBuffer) -> AsrResult<AudioBuffer> {
    buffer.validate()?;
    if buffer.channels == 1 {
        return Ok(buffer.clone());
    }

    let mono_samples: Vec<f32> = buffer
        .samples
        .chunks(buffer.channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect();

    Ok(AudioBuffer::new(mono_samples, buffer.sample_rate, 1))
}
