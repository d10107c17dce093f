//! Нормализация признаков.
//!
//! Среднее и стандартное отклонение каждого признака по всем фреймам
//! эталонного потока. Артефакт хранится в JSON.

use std::path::Path;

use lvsr_core::{AsrError, AsrResult, DataStream, FeatureExample, FeatureSequence};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Параметры нормализации `(x - mean) / std`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    /// Посчитать статистики по одной эпохе потока.
    ///
    /// Ошибочные примеры пропускаются с предупреждением. Нулевое отклонение
    /// заменяется единицей.
    pub fn fit<S>(stream: &mut S) -> AsrResult<Self>
    where
        S: DataStream<Item = FeatureExample> + ?Sized,
    {
        let mut sum: Vec<f64> = Vec::new();
        let mut sum_sq: Vec<f64> = Vec::new();
        let mut count = 0usize;

        for item in stream.epoch_iter() {
            let example = match item {
                Ok(example) => example,
                Err(e) => {
                    warn!("Пропущен пример при подсчёте нормализации: {e}");
                    continue;
                }
            };
            let width = example.features.num_features();
            if sum.is_empty() {
                sum = vec![0.0; width];
                sum_sq = vec![0.0; width];
            } else if sum.len() != width {
                return Err(AsrError::Data(format!(
                    "example '{}' has {width} features, expected {}",
                    example.id,
                    sum.len()
                )));
            }
            for frame in example.features.frames() {
                for (i, &v) in frame.iter().enumerate() {
                    sum[i] += v as f64;
                    sum_sq[i] += (v as f64) * (v as f64);
                }
            }
            count += example.features.num_frames();
        }

        if count == 0 {
            return Err(AsrError::Data("normalization stream is empty".into()));
        }

        let n = count as f64;
        let mean: Vec<f32> = sum.iter().map(|s| (s / n) as f32).collect();
        let std: Vec<f32> = sum
            .iter()
            .zip(&sum_sq)
            .map(|(s, sq)| {
                let m = s / n;
                let var = (sq / n - m * m).max(0.0);
                let std = var.sqrt() as f32;
                if std > 0.0 {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        info!("Нормализация посчитана по {count} фреймам, {} признаков", mean.len());
        Ok(Self { mean, std })
    }

    pub fn num_features(&self) -> usize {
        self.mean.len()
    }

    /// Применить нормализацию на месте.
    pub fn apply(&self, features: &mut FeatureSequence) -> AsrResult<()> {
        if features.num_features() != self.num_features() {
            return Err(AsrError::Data(format!(
                "normalization expects {} features, got {}",
                self.num_features(),
                features.num_features()
            )));
        }
        let width = self.num_features();
        for (i, v) in features.data_mut().iter_mut().enumerate() {
            let f = i % width;
            *v = (*v - self.mean[f]) / self.std[f];
        }
        Ok(())
    }

    /// Нормализованная копия последовательности.
    pub fn transform(&self, features: &FeatureSequence) -> AsrResult<FeatureSequence> {
        let mut out = features.clone();
        self.apply(&mut out)?;
        Ok(out)
    }

    /// Обернуть поток: каждый пример нормализуется на лету.
    pub fn wrap_stream<S>(self, stream: S) -> NormalizedStream<S>
    where
        S: DataStream<Item = FeatureExample>,
    {
        NormalizedStream {
            inner: stream,
            normalization: self,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> AsrResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> AsrResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let normalization: Self = serde_json::from_str(&content)?;
        if normalization.mean.len() != normalization.std.len() {
            return Err(AsrError::Data(
                "normalization mean and std have different lengths".into(),
            ));
        }
        if normalization.std.iter().any(|s| !(*s > 0.0)) {
            return Err(AsrError::Data("normalization std must be positive".into()));
        }
        Ok(normalization)
    }
}

/// Поток с нормализацией признаков.
pub struct NormalizedStream<S> {
    inner: S,
    normalization: Normalization,
}

impl<S> DataStream for NormalizedStream<S>
where
    S: DataStream<Item = FeatureExample>,
{
    type Item = FeatureExample;

    fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<FeatureExample>> + '_> {
        let normalization = &self.normalization;
        Box::new(self.inner.epoch_iter().map(move |item| {
            let mut example = item?;
            normalization.apply(&mut example.features)?;
            Ok(example)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecStream(Vec<FeatureExample>);

    impl DataStream for VecStream {
        type Item = FeatureExample;

        fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<FeatureExample>> + '_> {
            Box::new(self.0.iter().cloned().map(Ok))
        }
    }

    fn example(frames: &[Vec<f32>]) -> FeatureExample {
        FeatureExample {
            id: "x".into(),
            features: FeatureSequence::from_frames(frames).unwrap(),
            labels: vec![0],
        }
    }

    #[test]
    fn test_fit_known_statistics() {
        // Признак 0: {1, 3, 5, 7} => mean 4, std sqrt(5); признак 1 постоянен.
        let mut stream = VecStream(vec![
            example(&[vec![1.0, 2.0], vec![3.0, 2.0]]),
            example(&[vec![5.0, 2.0], vec![7.0, 2.0]]),
        ]);
        let norm = Normalization::fit(&mut stream).unwrap();
        assert!((norm.mean[0] - 4.0).abs() < 1e-6);
        assert!((norm.std[0] - 5.0f32.sqrt()).abs() < 1e-5);
        assert!((norm.mean[1] - 2.0).abs() < 1e-6);
        assert_eq!(norm.std[1], 1.0);
    }

    #[test]
    fn test_transform_maps_to_standard_score() {
        let norm = Normalization {
            mean: vec![1.0, -2.0],
            std: vec![2.0, 0.5],
        };
        let seq = FeatureSequence::from_frames(&[vec![5.0, -1.0]]).unwrap();
        let out = norm.transform(&seq).unwrap();
        assert_eq!(out.data(), &[2.0, 2.0]);

        let wrong = FeatureSequence::from_frames(&[vec![1.0]]).unwrap();
        assert!(norm.transform(&wrong).is_err());
    }

    #[test]
    fn test_wrap_stream_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norm.json");
        let mut stream = VecStream(vec![example(&[vec![1.0], vec![3.0]])]);
        let norm = Normalization::fit(&mut stream).unwrap();
        norm.save(&path).unwrap();
        let loaded = Normalization::load(&path).unwrap();
        assert_eq!(loaded, norm);

        let mut wrapped = loaded.wrap_stream(stream);
        let items: Vec<_> = wrapped.epoch_iter().collect::<AsrResult<_>>().unwrap();
        assert_eq!(items[0].features.data(), &[-1.0, 1.0]);
    }

    #[test]
    fn test_fit_empty_stream() {
        let mut stream = VecStream(vec![]);
        assert!(matches!(
            Normalization::fit(&mut stream),
            Err(AsrError::Data(_))
        ));
    }
}
