//! Декодер с вниманием (sequence generator).
//!
//! Шаг декодера:
//! 1. эмбеддинг предыдущего символа (на первом шаге — отдельная стартовая строка);
//! 2. рекуррентный переход на `fork(feedback) + distribute(прошлый glimpse)`;
//! 3. внимание с новым состоянием;
//! 4. readout `W_g · glimpse (+ W_s · h) + b`;
//! 5. log-softmax.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::Linear;
use lvsr_core::{AsrResult, Component, NetConfig, ParamRole};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::attention::{AttendedContext, Attention};
use crate::encoder::linear;
use crate::params::ParamStore;
use crate::recurrent::{RecurrentCell, RecurrentState};

/// Состояние декодера для батча (или луча).
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub recurrent: RecurrentState,
    /// `(B, D)`
    pub glimpse: Tensor,
    /// `(B, T)`
    pub weights: Tensor,
}

impl DecoderState {
    /// Переупорядочить строки. `rows` — u32-индексы.
    pub fn select(&self, rows: &Tensor) -> Result<Self> {
        Ok(Self {
            recurrent: self.recurrent.select(rows)?,
            glimpse: self.glimpse.index_select(rows, 0)?,
            weights: self.weights.index_select(rows, 0)?,
        })
    }
}

/// Выход одного шага.
pub struct StepOutput {
    pub state: DecoderState,
    /// Логиты `(B, V)`.
    pub readouts: Tensor,
    /// `(B, V)`
    pub log_probs: Tensor,
}

/// Teacher-forced стоимости.
#[derive(Debug, Clone)]
pub struct CostOutput {
    /// `−log p(label)` с учётом маски, `(L, B)`.
    pub costs: Tensor,
    /// Веса внимания `(L, B, T)`.
    pub weights: Tensor,
    /// Логиты readout `(L, B, V)`.
    pub readouts: Tensor,
}

/// Способ выбора символа при генерации.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GenerationMode {
    Greedy,
    Sample { temperature: f64 },
}

/// Результат генерации для батча.
#[derive(Debug, Clone)]
pub struct Generated {
    /// Выходы каждой строки до первого конца последовательности включительно.
    pub outputs: Vec<Vec<u32>>,
    /// Сумма `−log p` по сохранённым выходам.
    pub costs: Vec<f64>,
    /// Веса внимания всех шагов `(n_steps, B, T)`.
    pub weights: Tensor,
}

pub struct SequenceGenerator {
    /// `(V + 1, dim_dec)`, последняя строка — стартовый символ.
    feedback: Tensor,
    fork: Linear,
    /// `(D, input_dim)`
    distribute: Tensor,
    transition: RecurrentCell,
    attention: Attention,
    /// `(D, V)`
    readout_glimpse: Tensor,
    /// `(dim_dec, V)`
    readout_states: Option<Tensor>,
    readout_bias: Tensor,
    alphabet_size: usize,
    attended_dim: usize,
}

impl SequenceGenerator {
    pub fn new(
        store: &mut ParamStore,
        config: &NetConfig,
        attended_dim: usize,
        alphabet_size: usize,
    ) -> AsrResult<Self> {
        let name = "recognizer.generator";
        let dim = config.dim_dec;

        let feedback = store.get(
            &format!("{name}.feedback"),
            &[alphabet_size + 1, dim],
            Component::Feedback,
            ParamRole::Weights,
        )?;
        let transition = RecurrentCell::new(
            store,
            &format!("{name}.transition"),
            config.dec_transition,
            dim,
            Component::Transition,
        )?;
        let fork = linear(
            store,
            &format!("{name}.fork"),
            dim,
            transition.input_dim(),
            Component::Generator,
        )?;
        let distribute = store.get(
            &format!("{name}.distribute"),
            &[attended_dim, transition.input_dim()],
            Component::Generator,
            ParamRole::Weights,
        )?;
        let attention = Attention::new(store, &config.attention, dim, attended_dim, dim)?;
        let readout_glimpse = store.get(
            &format!("{name}.readout.glimpse"),
            &[attended_dim, alphabet_size],
            Component::Readout,
            ParamRole::Weights,
        )?;
        let readout_states = if config.use_states_for_readout {
            Some(store.get(
                &format!("{name}.readout.states"),
                &[dim, alphabet_size],
                Component::Readout,
                ParamRole::Weights,
            )?)
        } else {
            None
        };
        let readout_bias = store.get(
            &format!("{name}.readout.bias"),
            &[alphabet_size],
            Component::Readout,
            ParamRole::Biases,
        )?;

        Ok(Self {
            feedback,
            fork,
            distribute,
            transition,
            attention,
            readout_glimpse,
            readout_states,
            readout_bias,
            alphabet_size,
            attended_dim,
        })
    }

    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    /// Индекс стартовой строки эмбеддинга.
    pub fn start_symbol(&self) -> u32 {
        self.alphabet_size as u32
    }

    pub fn start_symbols(&self, batch_size: usize, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(vec![self.start_symbol(); batch_size], batch_size, device)
    }

    pub fn initial_state(&self, context: &AttendedContext) -> Result<DecoderState> {
        let batch = context.batch_size();
        let device = context.attended.device();
        Ok(DecoderState {
            recurrent: self.transition.initial_state(batch, device)?,
            glimpse: Tensor::zeros((batch, self.attended_dim), DType::F32, device)?,
            weights: self.attention.initial_weights(context)?,
        })
    }

    /// Один шаг декодера. `previous`: `(B,)` u32.
    pub fn step(
        &self,
        previous: &Tensor,
        state: &DecoderState,
        context: &AttendedContext,
    ) -> Result<StepOutput> {
        let feedback = self.feedback.index_select(previous, 0)?;
        let inputs = (self.fork.forward(&feedback)? + state.glimpse.matmul(&self.distribute)?)?;
        let recurrent = self.transition.step(&inputs, &state.recurrent, None)?;
        let attended = self
            .attention
            .take_glimpse(&recurrent.states, context, &state.weights)?;

        let mut readouts = attended.glimpse.matmul(&self.readout_glimpse)?;
        if let Some(w) = &self.readout_states {
            readouts = (readouts + recurrent.states.matmul(w)?)?;
        }
        let readouts = readouts.broadcast_add(&self.readout_bias)?;
        let log_probs = candle_nn::ops::log_softmax(&readouts, D::Minus1)?;

        Ok(StepOutput {
            state: DecoderState {
                recurrent,
                glimpse: attended.glimpse,
                weights: attended.weights,
            },
            readouts,
            log_probs,
        })
    }

    /// Teacher forcing: `labels` `(L, B)` u32, `labels_mask` `(L, B)` f32.
    pub fn cost_matrix(
        &self,
        labels: &Tensor,
        labels_mask: &Tensor,
        context: &AttendedContext,
    ) -> Result<CostOutput> {
        let (steps, batch) = labels.dims2()?;
        let mut previous = self.start_symbols(batch, labels.device())?;
        let mut state = self.initial_state(context)?;

        let mut costs = Vec::with_capacity(steps);
        let mut weights = Vec::with_capacity(steps);
        let mut readouts = Vec::with_capacity(steps);
        for t in 0..steps {
            let out = self.step(&previous, &state, context)?;
            let target = labels.i(t)?.contiguous()?;
            let log_prob = out
                .log_probs
                .gather(&target.unsqueeze(1)?, 1)?
                .squeeze(1)?;
            costs.push(log_prob.neg()?);
            weights.push(out.state.weights.clone());
            readouts.push(out.readouts);
            previous = target;
            state = out.state;
        }

        Ok(CostOutput {
            costs: (Tensor::stack(&costs, 0)? * labels_mask)?,
            weights: Tensor::stack(&weights, 0)?,
            readouts: Tensor::stack(&readouts, 0)?,
        })
    }

    /// Генерация на `n_steps` шагов без эталона.
    ///
    /// Строка считается завершённой после первого `eos`; батч при этом
    /// продолжает шагать до бюджета, а последующие выходы отбрасываются.
    pub fn generate(
        &self,
        context: &AttendedContext,
        n_steps: usize,
        eos: u32,
        mode: GenerationMode,
        rng: &mut StdRng,
    ) -> Result<Generated> {
        let batch = context.batch_size();
        let device = context.attended.device();
        let mut previous = self.start_symbols(batch, device)?;
        let mut state = self.initial_state(context)?;

        let mut outputs = vec![Vec::new(); batch];
        let mut costs = vec![0.0f64; batch];
        let mut terminated = vec![false; batch];
        let mut weights = Vec::with_capacity(n_steps);

        for _ in 0..n_steps {
            let out = self.step(&previous, &state, context)?;
            let log_probs = out.log_probs.to_vec2::<f32>()?;
            let mut chosen = Vec::with_capacity(batch);
            for (b, row) in log_probs.iter().enumerate() {
                let symbol = match mode {
                    GenerationMode::Greedy => argmax(row),
                    GenerationMode::Sample { temperature } => sample(row, temperature, rng)?,
                };
                if !terminated[b] {
                    outputs[b].push(symbol);
                    costs[b] -= row[symbol as usize] as f64;
                    terminated[b] = symbol == eos;
                }
                chosen.push(symbol);
            }
            weights.push(out.state.weights.clone());
            previous = Tensor::from_vec(chosen, batch, device)?;
            state = out.state;
        }

        let weights = if weights.is_empty() {
            Tensor::zeros((0, batch, context.length()), DType::F32, device)?
        } else {
            Tensor::stack(&weights, 0)?
        };
        Ok(Generated {
            outputs,
            costs,
            weights,
        })
    }
}

/// Первый индекс максимума.
pub(crate) fn argmax(row: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best as u32
}

fn sample(log_probs: &[f32], temperature: f64, rng: &mut StdRng) -> Result<u32> {
    let scaled: Vec<f64> = log_probs
        .iter()
        .map(|&lp| lp as f64 / temperature.max(1e-6))
        .collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = scaled.iter().map(|v| (v - max).exp()).collect();
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| candle_core::Error::Msg(format!("cannot sample: {e}")))?;
    Ok(dist.sample(rng) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvsr_core::{InitConfig, TransitionType};
    use rand::SeedableRng;

    fn setup(kind: TransitionType, use_states: bool) -> (SequenceGenerator, AttendedContext) {
        let device = Device::Cpu;
        let config = NetConfig {
            dim_dec: 4,
            dim_bidir: 3,
            dims_bottom: vec![],
            dec_transition: kind,
            use_states_for_readout: use_states,
            ..NetConfig::default()
        };
        let mut store = ParamStore::new(InitConfig::default(), 9, &device);
        let generator = SequenceGenerator::new(&mut store, &config, 6, 5).unwrap();
        let attended = Tensor::randn(0f32, 1.0, (7, 2, 6), &device).unwrap();
        let context = generator.attention().preprocess(&attended, None).unwrap();
        (generator, context)
    }

    #[test]
    fn test_cost_matrix_masks_padding() {
        for kind in [
            TransitionType::SimpleRecurrent,
            TransitionType::GatedRecurrent,
            TransitionType::Lstm,
        ] {
            let (generator, context) = setup(kind, true);
            let device = Device::Cpu;
            let labels = Tensor::new(&[[1u32, 2], [3, 4], [4, 0]], &device).unwrap();
            let mask = Tensor::new(&[[1.0f32, 1.0], [1.0, 1.0], [1.0, 0.0]], &device).unwrap();
            let out = generator.cost_matrix(&labels, &mask, &context).unwrap();
            assert_eq!(out.costs.dims(), &[3, 2]);
            assert_eq!(out.weights.dims(), &[3, 2, 7]);
            assert_eq!(out.readouts.dims(), &[3, 2, 5]);
            let costs = out.costs.to_vec2::<f32>().unwrap();
            assert_eq!(costs[2][1], 0.0);
            assert!(costs[0][0] > 0.0 && costs[0][0].is_finite());
        }
    }

    #[test]
    fn test_greedy_generation_stops_at_eos() {
        let (generator, context) = setup(TransitionType::SimpleRecurrent, false);
        let mut rng = StdRng::seed_from_u64(0);
        let generated = generator
            .generate(&context, 6, 2, GenerationMode::Greedy, &mut rng)
            .unwrap();
        assert_eq!(generated.weights.dims(), &[6, 2, 7]);
        for outputs in &generated.outputs {
            assert!(!outputs.is_empty() && outputs.len() <= 6);
            if let Some(pos) = outputs.iter().position(|&s| s == 2) {
                assert_eq!(pos + 1, outputs.len());
            }
        }
    }

    #[test]
    fn test_generation_cost_matches_teacher_forcing() {
        let (generator, context) = setup(TransitionType::GatedRecurrent, false);
        let mut rng = StdRng::seed_from_u64(1);
        let generated = generator
            .generate(&context, 4, 4, GenerationMode::Sample { temperature: 1.0 }, &mut rng)
            .unwrap();
        let device = Device::Cpu;
        for b in 0..2 {
            let outputs = &generated.outputs[b];
            let single = context.row(b).unwrap();
            let labels = Tensor::from_vec(outputs.clone(), (outputs.len(), 1), &device).unwrap();
            let mask = Tensor::ones((outputs.len(), 1), DType::F32, &device).unwrap();
            let costs = generator.cost_matrix(&labels, &mask, &single).unwrap().costs;
            let total: f32 = costs.flatten_all().unwrap().to_vec1::<f32>().unwrap().iter().sum();
            assert!((total as f64 - generated.costs[b]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_argmax_prefers_first() {
        assert_eq!(argmax(&[0.1, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[1.0]), 0);
    }
}
