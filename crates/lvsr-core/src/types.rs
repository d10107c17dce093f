//! Общие типы данных распознавателя.
//!
//! Аудио-буферы, последовательности признаков, размеченные примеры и
//! дополненные батчи, которыми обмениваются крейты workspace.

use tracing::warn;

use crate::error::{AsrError, AsrResult};

// ---------------------------------------------------------------------------
// Аудио-буфер
// ---------------------------------------------------------------------------

/// Буфер необработанного аудио.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Аудио-сэмплы (нормализованы к [-1.0, 1.0], каналы перемежаются).
    pub samples: Vec<f32>,

    /// Частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Количество каналов.
    pub channels: usize,
}

impl AudioBuffer {
    /// Создать новый буфер аудио.
    pub fn new(samples: Vec<f32>, sample_rate: usize, channels: usize) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Проверить, что у буфера есть каналы и частота дискретизации.
    pub fn validate(&self) -> AsrResult<()> {
        if self.channels == 0 {
            return Err(AsrError::Audio("audio buffer has zero channels".into()));
        }
        if self.sample_rate == 0 {
            return Err(AsrError::Audio("audio buffer has zero sample rate".into()));
        }
        Ok(())
    }

    /// Длительность в секундах; 0 для буфера без каналов или частоты.
    pub fn duration(&self) -> f32 {
        match self.sample_rate * self.channels {
            0 => 0.0,
            rate => self.samples.len() as f32 / rate as f32,
        }
    }

    /// Количество сэмплов на канал.
    pub fn num_samples(&self) -> usize {
        self.samples.len().checked_div(self.channels).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Последовательность признаков
// ---------------------------------------------------------------------------

/// Матрица признаков `(num_frames, num_features)` в row-major порядке.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSequence {
    data: Vec<f32>,
    num_frames: usize,
    num_features: usize,
}

impl FeatureSequence {
    /// Собрать последовательность из плоского буфера.
    ///
    /// Пустые, неконсистентные по размеру и неконечные данные отклоняются.
    pub fn new(data: Vec<f32>, num_frames: usize, num_features: usize) -> AsrResult<Self> {
        if num_frames == 0 || num_features == 0 {
            return Err(AsrError::Data("empty feature sequence".into()));
        }
        if data.len() != num_frames * num_features {
            return Err(AsrError::Data(format!(
                "feature buffer holds {} values, expected {num_frames}x{num_features}",
                data.len()
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(AsrError::Data("feature sequence contains non-finite values".into()));
        }
        Ok(Self {
            data,
            num_frames,
            num_features,
        })
    }

    /// Собрать последовательность из списка фреймов.
    pub fn from_frames(frames: &[Vec<f32>]) -> AsrResult<Self> {
        let num_features = frames.first().map(Vec::len).unwrap_or(0);
        if frames.iter().any(|f| f.len() != num_features) {
            return Err(AsrError::Data("frames have inconsistent widths".into()));
        }
        let data = frames.iter().flatten().copied().collect();
        Self::new(data, frames.len(), num_features)
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Плоские данные.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Изменяемые плоские данные (для нормализации на месте).
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Фрейм `t`.
    pub fn frame(&self, t: usize) -> &[f32] {
        &self.data[t * self.num_features..(t + 1) * self.num_features]
    }

    /// Итератор по фреймам.
    pub fn frames(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.num_features)
    }
}

// ---------------------------------------------------------------------------
// Примеры
// ---------------------------------------------------------------------------

/// Запись: либо сырой сигнал, либо заранее посчитанные признаки.
#[derive(Debug, Clone)]
pub enum Recording {
    Waveform(AudioBuffer),
    Features(FeatureSequence),
}

/// Размеченный пример до извлечения признаков.
#[derive(Debug, Clone)]
pub struct Example {
    /// Идентификатор высказывания.
    pub id: String,

    pub recording: Recording,

    /// Индексы фонем, завершённые символом конца последовательности.
    pub labels: Vec<u32>,
}

/// Пример после извлечения признаков.
#[derive(Debug, Clone)]
pub struct FeatureExample {
    pub id: String,
    pub features: FeatureSequence,
    pub labels: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Батч
// ---------------------------------------------------------------------------

/// Дополненный батч в time-major раскладке.
///
/// `recordings` — `(T, B, F)`, маски и метки — `(T, B)`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Идентификаторы примеров в порядке батча.
    pub ids: Vec<String>,

    pub recordings: Vec<f32>,
    pub recordings_mask: Vec<f32>,
    pub labels: Vec<u32>,
    pub labels_mask: Vec<f32>,

    /// Длины записей в фреймах.
    pub recording_lengths: Vec<usize>,

    /// Длины меток.
    pub label_lengths: Vec<usize>,

    pub num_features: usize,
}

impl Batch {
    /// Дополнить примеры до максимальной длины и построить маски.
    ///
    /// Значение паддинга меток — `pad_label`; паддинг признаков — нули.
    /// Примеры без меток или с шириной, отличной от первого пригодного,
    /// пропускаются с предупреждением.
    pub fn from_examples(examples: &[FeatureExample], pad_label: u32) -> AsrResult<Self> {
        let Some(num_features) = examples
            .iter()
            .find(|e| !e.labels.is_empty())
            .map(|e| e.features.num_features())
        else {
            return Err(AsrError::Data("cannot build an empty batch".into()));
        };

        let examples: Vec<&FeatureExample> = examples
            .iter()
            .filter(|example| {
                if example.labels.is_empty() {
                    warn!("Пример '{}' без меток пропущен", example.id);
                    return false;
                }
                if example.features.num_features() != num_features {
                    warn!(
                        "Пример '{}' пропущен: {} признаков, в батче {num_features}",
                        example.id,
                        example.features.num_features()
                    );
                    return false;
                }
                true
            })
            .collect();
        let batch_size = examples.len();

        let recording_lengths: Vec<usize> =
            examples.iter().map(|e| e.features.num_frames()).collect();
        let label_lengths: Vec<usize> = examples.iter().map(|e| e.labels.len()).collect();
        let max_frames = recording_lengths.iter().copied().max().unwrap_or(0);
        let max_labels = label_lengths.iter().copied().max().unwrap_or(0);

        let mut recordings = vec![0.0f32; max_frames * batch_size * num_features];
        let mut recordings_mask = vec![0.0f32; max_frames * batch_size];
        for (b, example) in examples.iter().enumerate() {
            for (t, frame) in example.features.frames().enumerate() {
                let offset = (t * batch_size + b) * num_features;
                recordings[offset..offset + num_features].copy_from_slice(frame);
                recordings_mask[t * batch_size + b] = 1.0;
            }
        }

        let mut labels = vec![pad_label; max_labels * batch_size];
        let mut labels_mask = vec![0.0f32; max_labels * batch_size];
        for (b, example) in examples.iter().enumerate() {
            for (t, &label) in example.labels.iter().enumerate() {
                labels[t * batch_size + b] = label;
                labels_mask[t * batch_size + b] = 1.0;
            }
        }

        Ok(Self {
            ids: examples.iter().map(|e| e.id.clone()).collect(),
            recordings,
            recordings_mask,
            labels,
            labels_mask,
            recording_lengths,
            label_lengths,
            num_features,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    /// Максимальная длина записи (T).
    pub fn max_frames(&self) -> usize {
        self.recordings_mask.len() / self.batch_size().max(1)
    }

    /// Максимальная длина меток.
    pub fn max_labels(&self) -> usize {
        self.labels_mask.len() / self.batch_size().max(1)
    }
}
