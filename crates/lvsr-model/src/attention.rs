//! Механизмы внимания.
//!
//! Все варианты считают content-энергии
//! `e_j = v · tanh(W_a a_j + b_a + W_s h)` и отличаются добавочным членом:
//!
//! - `Content` — без добавок;
//! - `ContentAndCumSum` — `w_c · cumsum(prev)_j` внутри `tanh`;
//! - `Hybrid` — оценка сдвига из окна `[-max_left, max_right]` относительно
//!   округлённой ожидаемой позиции прошлого шага;
//! - `Hybrid2` — гауссов член `−½((j − p − μ)/σ)²`.
//!
//! Веса — маскированный softmax: на паддинге ровно ноль.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::Linear;
use lvsr_core::{AsrResult, AttentionConfig, AttentionType, Component, ParamRole};

use crate::encoder::linear;
use crate::params::ParamStore;

/// Штраф для позиций вне окна сдвигов.
const OUT_OF_WINDOW_PENALTY: f32 = -1e4;
/// Границы log σ гауссова сдвига hybrid2.
const LOG_SIGMA_LIMIT: f64 = 5.0;

/// MLP, предсказывающий сдвиг по состоянию декодера.
pub struct ShiftPredictor {
    hidden: Vec<Linear>,
    output: Linear,
}

impl ShiftPredictor {
    fn new(
        store: &mut ParamStore,
        name: &str,
        in_dim: usize,
        dims: &[usize],
        out_dim: usize,
    ) -> AsrResult<Self> {
        let mut hidden = Vec::with_capacity(dims.len());
        let mut prev = in_dim;
        for (i, &dim) in dims.iter().enumerate() {
            hidden.push(linear(
                store,
                &format!("{name}.linear_{i}"),
                prev,
                dim,
                Component::Attention,
            )?);
            prev = dim;
        }
        let output = linear(store, &format!("{name}.output"), prev, out_dim, Component::Attention)?;
        Ok(Self { hidden, output })
    }

    fn forward(&self, states: &Tensor) -> Result<Tensor> {
        let mut x = states.clone();
        for layer in &self.hidden {
            x = layer.forward(&x)?.tanh()?;
        }
        self.output.forward(&x)
    }
}

/// Вариант механизма с его собственными параметрами.
pub enum AttentionMechanism {
    Content,
    ContentAndCumSum {
        /// `(1, match_dim)`
        cumsum_weights: Tensor,
    },
    Hybrid {
        predictor: ShiftPredictor,
        max_left: usize,
        max_right: usize,
    },
    Hybrid2 {
        predictor: ShiftPredictor,
    },
}

/// Предобработанный контекст энкодера, batch-major.
#[derive(Debug, Clone)]
pub struct AttendedContext {
    /// `(B, T, D)`
    pub attended: Tensor,
    /// `W_a a + b_a`, `(B, T, M)`
    pub preprocessed: Tensor,
    /// `(B, T)`, f32
    pub mask: Tensor,
    /// Номера позиций `(1, T)`.
    positions: Tensor,
}

impl AttendedContext {
    pub fn batch_size(&self) -> usize {
        self.mask.dims()[0]
    }

    pub fn length(&self) -> usize {
        self.mask.dims()[1]
    }

    /// Контекст одной строки батча.
    pub fn row(&self, index: usize) -> Result<Self> {
        Ok(Self {
            attended: self.attended.narrow(0, index, 1)?,
            preprocessed: self.preprocessed.narrow(0, index, 1)?,
            mask: self.mask.narrow(0, index, 1)?,
            positions: self.positions.clone(),
        })
    }

    /// Размножить контекст одного примера на `n` строк (луч).
    pub fn expand(&self, n: usize) -> Result<Self> {
        let (_, t, d) = self.attended.dims3()?;
        let m = self.preprocessed.dim(2)?;
        Ok(Self {
            attended: self.attended.broadcast_as((n, t, d))?.contiguous()?,
            preprocessed: self.preprocessed.broadcast_as((n, t, m))?.contiguous()?,
            mask: self.mask.broadcast_as((n, t))?.contiguous()?,
            positions: self.positions.clone(),
        })
    }
}

/// Результат одного шага внимания.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `(B, D)`
    pub glimpse: Tensor,
    /// `(B, T)`
    pub weights: Tensor,
}

pub struct Attention {
    preprocess: Linear,
    /// `(dim_dec, match_dim)`
    state_transform: Tensor,
    /// `(match_dim, 1)`
    energy: Tensor,
    mechanism: AttentionMechanism,
}

impl Attention {
    pub fn new(
        store: &mut ParamStore,
        config: &AttentionConfig,
        state_dim: usize,
        attended_dim: usize,
        match_dim: usize,
    ) -> AsrResult<Self> {
        let name = "recognizer.generator.attention";
        let preprocess = linear(
            store,
            &format!("{name}.preprocess"),
            attended_dim,
            match_dim,
            Component::Attention,
        )?;
        let state_transform = store.get(
            &format!("{name}.state_transform"),
            &[state_dim, match_dim],
            Component::Attention,
            ParamRole::Weights,
        )?;
        let energy = store.get(
            &format!("{name}.energy"),
            &[match_dim, 1],
            Component::Attention,
            ParamRole::Weights,
        )?;

        let predictor_name = format!("{name}.predictor");
        let mechanism = match config.kind {
            AttentionType::Content => AttentionMechanism::Content,
            AttentionType::ContentAndCumsum => AttentionMechanism::ContentAndCumSum {
                cumsum_weights: store.get(
                    &format!("{name}.cumsum_weights"),
                    &[1, match_dim],
                    Component::Attention,
                    ParamRole::Weights,
                )?,
            },
            AttentionType::Hybrid => AttentionMechanism::Hybrid {
                predictor: ShiftPredictor::new(
                    store,
                    &predictor_name,
                    state_dim,
                    &config.shift_predictor_dims,
                    config.max_left + config.max_right + 1,
                )?,
                max_left: config.max_left,
                max_right: config.max_right,
            },
            AttentionType::Hybrid2 => AttentionMechanism::Hybrid2 {
                predictor: ShiftPredictor::new(
                    store,
                    &predictor_name,
                    state_dim,
                    &config.shift_predictor_dims,
                    2,
                )?,
            },
        };

        Ok(Self {
            preprocess,
            state_transform,
            energy,
            mechanism,
        })
    }

    pub fn mechanism(&self) -> &AttentionMechanism {
        &self.mechanism
    }

    /// Подготовить контекст: `attended` `(T, B, D)`, `mask` `(T, B)` в time-major.
    pub fn preprocess(&self, attended: &Tensor, mask: Option<&Tensor>) -> Result<AttendedContext> {
        let attended = attended.transpose(0, 1)?.contiguous()?;
        let (batch, length, _) = attended.dims3()?;
        let mask = match mask {
            Some(mask) => mask.transpose(0, 1)?.contiguous()?,
            None => Tensor::ones((batch, length), DType::F32, attended.device())?,
        };
        let preprocessed = self.preprocess.forward(&attended)?;
        let positions = Tensor::arange(0u32, length as u32, attended.device())?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?;
        Ok(AttendedContext {
            attended,
            preprocessed,
            mask,
            positions,
        })
    }

    /// Веса «прошлого шага» до начала генерации.
    pub fn initial_weights(&self, context: &AttendedContext) -> Result<Tensor> {
        context.mask.zeros_like()
    }

    /// Энергии `(B, T)` для состояния `states` `(B, dim_dec)`.
    pub fn energies(
        &self,
        states: &Tensor,
        context: &AttendedContext,
        previous_weights: &Tensor,
    ) -> Result<Tensor> {
        let (batch, length, match_dim) = context.preprocessed.dims3()?;
        let transformed = states.matmul(&self.state_transform)?.unsqueeze(1)?;
        let mut pre = context.preprocessed.broadcast_add(&transformed)?;
        if let AttentionMechanism::ContentAndCumSum { cumsum_weights } = &self.mechanism {
            let cumsum = previous_weights.cumsum(1)?.unsqueeze(2)?;
            pre = (pre + cumsum.broadcast_mul(cumsum_weights)?)?;
        }
        let content = pre
            .tanh()?
            .reshape((batch * length, match_dim))?
            .matmul(&self.energy)?
            .reshape((batch, length))?;

        match &self.mechanism {
            AttentionMechanism::Content | AttentionMechanism::ContentAndCumSum { .. } => Ok(content),
            AttentionMechanism::Hybrid {
                predictor,
                max_left,
                max_right,
            } => {
                let shifts = predictor.forward(states)?;
                let location =
                    window_energies(&shifts, previous_weights, *max_left, *max_right, length)?;
                content + location
            }
            AttentionMechanism::Hybrid2 { predictor } => {
                let out = predictor.forward(states)?;
                let mu = out.narrow(1, 0, 1)?;
                let sigma = out
                    .narrow(1, 1, 1)?
                    .clamp(-LOG_SIGMA_LIMIT, LOG_SIGMA_LIMIT)?
                    .exp()?;
                let expected = previous_weights
                    .broadcast_mul(&context.positions)?
                    .sum_keepdim(1)?;
                let z = context
                    .positions
                    .broadcast_sub(&(expected + mu)?)?
                    .broadcast_div(&sigma)?;
                content + (z.sqr()? * -0.5)?
            }
        }
    }

    /// Шаг внимания: энергии → маскированный softmax → glimpse.
    pub fn take_glimpse(
        &self,
        states: &Tensor,
        context: &AttendedContext,
        previous_weights: &Tensor,
    ) -> Result<AttentionOutput> {
        let energies = self.energies(states, context, previous_weights)?;
        let weights = masked_softmax(&energies, &context.mask)?;
        let glimpse = weights
            .unsqueeze(1)?
            .matmul(&context.attended)?
            .squeeze(1)?;
        Ok(AttentionOutput { glimpse, weights })
    }
}

/// Оценки сдвигов, разложенные по позициям энкодера.
///
/// Позиция `j` получает оценку сдвига `j − round(p) + max_left`, где `p` —
/// ожидаемая позиция по прошлым весам. Вне окна — большой штраф.
fn window_energies(
    shifts: &Tensor,
    previous_weights: &Tensor,
    max_left: usize,
    max_right: usize,
    length: usize,
) -> Result<Tensor> {
    let window = (max_left + max_right + 1) as i64;
    let previous = previous_weights.to_vec2::<f32>()?;
    let batch = previous.len();

    let mut indices = Vec::with_capacity(batch * length);
    let mut penalty = Vec::with_capacity(batch * length);
    for row in &previous {
        let expected: f32 = row.iter().enumerate().map(|(j, w)| j as f32 * w).sum();
        let center = expected.round() as i64;
        for j in 0..length as i64 {
            let shift = j - center + max_left as i64;
            if (0..window).contains(&shift) {
                indices.push(shift as u32);
                penalty.push(0.0f32);
            } else {
                indices.push(0);
                penalty.push(OUT_OF_WINDOW_PENALTY);
            }
        }
    }

    let device = shifts.device();
    let indices = Tensor::from_vec(indices, (batch, length), device)?;
    let penalty = Tensor::from_vec(penalty, (batch, length), device)?;
    shifts.gather(&indices, 1)? + penalty
}

/// Softmax по немаскированным позициям; маскированные получают ровно ноль.
///
/// Максимум вычитается по немаскированным позициям и в граф не входит:
/// softmax инвариантен к сдвигу. Строка с неконечным максимумом получает
/// равномерное распределение по немаскированным позициям.
pub fn masked_softmax(energies: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let values = energies.to_vec2::<f32>()?;
    let mask_values = mask.to_vec2::<f32>()?;
    let (batch, length) = energies.dims2()?;

    let mut maxes = Vec::with_capacity(batch);
    let mut keep = Vec::with_capacity(batch * length);
    for (row, m) in values.iter().zip(&mask_values) {
        let max = row
            .iter()
            .zip(m)
            .filter(|(_, &m)| m > 0.0)
            .map(|(&e, _)| e)
            .fold(f32::NEG_INFINITY, f32::max);
        let degenerate = !max.is_finite();
        maxes.push(if degenerate { 0.0 } else { max });
        keep.extend(m.iter().map(|&m| u8::from(m > 0.0 && !degenerate)));
    }

    let device = energies.device();
    let max = Tensor::from_vec(maxes, (batch, 1), device)?;
    let keep = Tensor::from_vec(keep, (batch, length), device)?;
    let shifted = energies.broadcast_sub(&max)?;
    let safe = keep.where_cond(&shifted, &shifted.zeros_like()?)?;
    let exp = (safe.exp()? * mask)?;
    let total = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&total)
}
