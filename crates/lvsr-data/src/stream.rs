//! Поток признаков поверх датасета.

use audio::{LogSpectrogram, Normalization, Resampler};
use lvsr_core::{
    AsrError, AsrResult, DataStream, Example, FeatureExample, RecognizerConfig, Recording,
};
use tracing::debug;

use crate::batching::BatchStream;
use crate::dataset::Dataset;

/// Превращает примеры датасета в последовательности признаков.
///
/// Ошибка извлечения возвращается как элемент потока; отбраковкой
/// занимаются потребители.
pub struct FeatureStream<D> {
    dataset: D,
    extractor: LogSpectrogram,
    resampler: Resampler,
}

impl<D: Dataset> FeatureStream<D> {
    pub fn new(dataset: D, extractor: LogSpectrogram) -> Self {
        let resampler = Resampler::new(extractor.sample_rate());
        Self {
            dataset,
            extractor,
            resampler,
        }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    fn featurize(&self, example: Example) -> AsrResult<FeatureExample> {
        let features = match example.recording {
            Recording::Waveform(buffer) => {
                let prepared = self.resampler.prepare(&buffer)?;
                self.extractor.extract(&prepared.samples)
            }
            Recording::Features(features) => {
                if features.num_features() != self.extractor.num_features() {
                    Err(AsrError::Data(format!(
                        "precomputed features have width {}, expected {}",
                        features.num_features(),
                        self.extractor.num_features()
                    )))
                } else {
                    Ok(features)
                }
            }
        }
        .map_err(|e| AsrError::Data(format!("utterance '{}': {e}", example.id)))?;

        if example.labels.is_empty() {
            return Err(AsrError::Data(format!("utterance '{}' has no labels", example.id)));
        }
        debug!(
            "Пример {}: {} фреймов, {} меток",
            example.id,
            features.num_frames(),
            example.labels.len()
        );
        Ok(FeatureExample {
            id: example.id,
            features,
            labels: example.labels,
        })
    }
}

impl<D: Dataset> DataStream for FeatureStream<D> {
    type Item = FeatureExample;

    fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<FeatureExample>> + '_> {
        let this = &*self;
        Box::new(
            (0..this.dataset.len())
                .map(move |i| this.dataset.get(i).and_then(|ex| this.featurize(ex))),
        )
    }
}

/// Поток признаков с нормализацией из конфигурации, если она задана.
pub fn build_feature_stream<D>(
    dataset: D,
    config: &RecognizerConfig,
) -> AsrResult<Box<dyn DataStream<Item = FeatureExample>>>
where
    D: Dataset + 'static,
{
    let stream = FeatureStream::new(dataset, LogSpectrogram::new(config.features.clone()));
    match &config.data.normalization {
        Some(path) => {
            let normalization = Normalization::load(path)?;
            Ok(Box::new(normalization.wrap_stream(stream)))
        }
        None => Ok(Box::new(stream)),
    }
}

/// Полный поток батчей: признаки, нормализация, сортировка и паддинг.
///
/// Без `data.batch_size` каждый пример становится батчем из одного элемента.
pub fn build_stream<D>(
    dataset: D,
    config: &RecognizerConfig,
    pad_label: u32,
) -> AsrResult<BatchStream<Box<dyn DataStream<Item = FeatureExample>>>>
where
    D: Dataset + 'static,
{
    let features = build_feature_stream(dataset, config)?;
    Ok(BatchStream::new(
        features,
        config.data.batch_size.unwrap_or(1),
        config.data.sort_k_batches,
        pad_label,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::InMemoryDataset;
    use lvsr_core::{AudioBuffer, FeatureSequence};

    fn waveform(id: &str, samples: usize) -> Example {
        Example {
            id: id.into(),
            recording: Recording::Waveform(AudioBuffer::new(vec![0.1; samples], 16000, 1)),
            labels: vec![1, 27],
        }
    }

    #[test]
    fn test_waveform_and_precomputed_features() {
        let precomputed = Example {
            id: "p".into(),
            recording: Recording::Features(FeatureSequence::new(vec![0.5; 129 * 2], 2, 129).unwrap()),
            labels: vec![27],
        };
        let dataset = InMemoryDataset::new(vec![waveform("w", 512), precomputed]);
        let mut stream = FeatureStream::new(dataset, LogSpectrogram::default());
        let items: Vec<_> = stream.epoch_iter().collect::<AsrResult<_>>().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].features.num_frames(), 3);
        assert_eq!(items[1].features.num_frames(), 2);
    }

    #[test]
    fn test_short_recording_is_error_item() {
        let dataset = InMemoryDataset::new(vec![waveform("short", 100), waveform("ok", 256)]);
        let mut stream = FeatureStream::new(dataset, LogSpectrogram::default());
        let items: Vec<_> = stream.epoch_iter().collect();
        assert!(matches!(items[0], Err(AsrError::Data(_))));
        assert!(items[1].is_ok());
    }

    #[test]
    fn test_wrong_feature_width_rejected() {
        let bad = Example {
            id: "bad".into(),
            recording: Recording::Features(FeatureSequence::new(vec![0.0; 4], 1, 4).unwrap()),
            labels: vec![27],
        };
        let mut stream = FeatureStream::new(InMemoryDataset::new(vec![bad]), LogSpectrogram::default());
        assert!(stream.epoch_iter().next().unwrap().is_err());
    }
}
