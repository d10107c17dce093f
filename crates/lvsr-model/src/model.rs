//! Фонемный распознаватель: энкодер + декодер с вниманием.

use candle_core::{DType, Device, Tensor, Var};
use lvsr_core::{
    AsrError, AsrResult, Batch, FeatureSequence, PhonemeAlphabet, RecognizerConfig,
};
use rand::rngs::StdRng;
use tracing::info;

use crate::attention::AttendedContext;
use crate::encoder::{Encoder, EncoderOutput};
use crate::generator::{CostOutput, GenerationMode, Generated, SequenceGenerator};
use crate::params::ParamStore;

/// Тензоры батча на устройстве.
#[derive(Debug, Clone)]
pub struct BatchTensors {
    /// `(T, B, F)`
    pub recordings: Tensor,
    /// `(T, B)`
    pub recordings_mask: Tensor,
    /// `(L, B)` u32
    pub labels: Tensor,
    /// `(L, B)`
    pub labels_mask: Tensor,
}

/// Всё, что нужно обучению и мониторам от одного прохода.
#[derive(Debug, Clone)]
pub struct RecognizerCost {
    pub inputs: BatchTensors,
    pub encoded: EncoderOutput,
    pub generated: CostOutput,
}

/// Teacher-forced разбор одной записи.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Стоимость каждого символа.
    pub costs: Vec<f32>,
    /// Веса внимания по шагам `[step][frame]`.
    pub weights: Vec<Vec<f32>>,
}

pub struct PhonemeRecognizer {
    store: ParamStore,
    encoder: Encoder,
    generator: SequenceGenerator,
    num_features: usize,
    eos: u32,
    device: Device,
}

impl PhonemeRecognizer {
    pub fn new(
        config: &RecognizerConfig,
        alphabet: &PhonemeAlphabet,
        device: &Device,
    ) -> AsrResult<Self> {
        let num_features = config.features.num_features();
        let mut store = ParamStore::new(config.initialization.clone(), config.seed, device);
        let encoder = Encoder::new(&mut store, &config.net, num_features)?;
        let generator =
            SequenceGenerator::new(&mut store, &config.net, encoder.output_dim(), alphabet.len())?;

        info!(
            "Распознаватель: {} тензоров, {} параметров, attention {:?}",
            store.len(),
            store.num_elements(),
            config.net.attention.kind
        );
        Ok(Self {
            store,
            encoder,
            generator,
            num_features,
            eos: alphabet.eos(),
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn eos(&self) -> u32 {
        self.eos
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn generator(&self) -> &SequenceGenerator {
        &self.generator
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    /// Все обучаемые параметры, отсортированные по имени.
    pub fn params(&self) -> Vec<(String, Var)> {
        self.store.vars()
    }

    /// Перенести батч на устройство.
    pub fn batch_tensors(&self, batch: &Batch) -> AsrResult<BatchTensors> {
        if batch.num_features != self.num_features {
            return Err(AsrError::Data(format!(
                "batch has {} features, recognizer expects {}",
                batch.num_features, self.num_features
            )));
        }
        let b = batch.batch_size();
        let t = batch.max_frames();
        let l = batch.max_labels();
        Ok(BatchTensors {
            recordings: Tensor::from_slice(&batch.recordings, (t, b, self.num_features), &self.device)?,
            recordings_mask: Tensor::from_slice(&batch.recordings_mask, (t, b), &self.device)?,
            labels: Tensor::from_slice(&batch.labels, (l, b), &self.device)?,
            labels_mask: Tensor::from_slice(&batch.labels_mask, (l, b), &self.device)?,
        })
    }

    /// Прогнать энкодер. `recordings`: `(T, B, F)`.
    pub fn encode(&self, recordings: &Tensor, mask: Option<&Tensor>) -> AsrResult<EncoderOutput> {
        Ok(self.encoder.forward(recordings, mask)?)
    }

    /// Контекст внимания для батча.
    pub fn context(&self, encoded: &EncoderOutput, mask: Option<&Tensor>) -> AsrResult<AttendedContext> {
        Ok(self.generator.attention().preprocess(&encoded.attended, mask)?)
    }

    /// Teacher-forced стоимость батча.
    pub fn cost(&self, batch: &Batch) -> AsrResult<RecognizerCost> {
        let inputs = self.batch_tensors(batch)?;
        let encoded = self.encode(&inputs.recordings, Some(&inputs.recordings_mask))?;
        let context = self.context(&encoded, Some(&inputs.recordings_mask))?;
        let generated =
            self.generator
                .cost_matrix(&inputs.labels, &inputs.labels_mask, &context)?;
        Ok(RecognizerCost {
            inputs,
            encoded,
            generated,
        })
    }

    /// Контекст одной записи (батч из одного элемента, маска не нужна).
    pub fn single_context(&self, features: &FeatureSequence) -> AsrResult<AttendedContext> {
        if features.num_features() != self.num_features {
            return Err(AsrError::Data(format!(
                "recording has {} features, recognizer expects {}",
                features.num_features(),
                self.num_features
            )));
        }
        let recordings = Tensor::from_slice(
            features.data(),
            (features.num_frames(), 1, self.num_features),
            &self.device,
        )?;
        let encoded = self.encode(&recordings, None)?;
        self.context(&encoded, None)
    }

    /// Teacher-forced стоимости и веса внимания для одной записи.
    pub fn analyze(&self, features: &FeatureSequence, labels: &[u32]) -> AsrResult<Analysis> {
        if labels.is_empty() {
            return Err(AsrError::Data("cannot analyze an empty transcription".into()));
        }
        let context = self.single_context(features)?;
        let labels_tensor = Tensor::from_slice(labels, (labels.len(), 1), &self.device)?;
        let mask = Tensor::ones((labels.len(), 1), DType::F32, &self.device)?;
        let out = self.generator.cost_matrix(&labels_tensor, &mask, &context)?;
        Ok(Analysis {
            costs: out.costs.flatten_all()?.to_vec1::<f32>()?,
            weights: out.weights.squeeze(1)?.to_vec2::<f32>()?,
        })
    }

    /// Генерация для одной записи.
    pub fn generate(
        &self,
        features: &FeatureSequence,
        n_steps: usize,
        mode: GenerationMode,
        rng: &mut StdRng,
    ) -> AsrResult<Generated> {
        let context = self.single_context(features)?;
        Ok(self
            .generator
            .generate(&context, n_steps, self.eos, mode, rng)?)
    }
}
