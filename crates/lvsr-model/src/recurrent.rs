//! Рекуррентные ячейки: простая, GRU и LSTM.
//!
//! Входная проекция (fork) делается снаружи, ячейка получает уже
//! спроецированные входы ширины `multiplier · dim` и хранит только матрицу
//! state→state `(dim, multiplier · dim)`.
//!
//! Маскированный шаг переносит предыдущее состояние:
//! `h = m · h_new + (1 − m) · h_old`.

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use lvsr_core::{AsrResult, Component, ParamRole, TransitionType};

use crate::params::ParamStore;

/// Дифференцируемая сигмоида через `tanh`.
pub(crate) fn sigmoid(x: &Tensor) -> Result<Tensor> {
    ((x * 0.5)?.tanh()? + 1.0)? * 0.5
}

/// Состояние ячейки; `cells` есть только у LSTM.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    pub states: Tensor,
    pub cells: Option<Tensor>,
}

impl RecurrentState {
    /// Выбрать строки батча (для переупорядочивания луча).
    pub fn select(&self, rows: &Tensor) -> Result<Self> {
        Ok(Self {
            states: self.states.index_select(rows, 0)?,
            cells: self
                .cells
                .as_ref()
                .map(|c| c.index_select(rows, 0))
                .transpose()?,
        })
    }
}

/// Рекуррентная ячейка.
#[derive(Debug, Clone)]
pub struct RecurrentCell {
    kind: TransitionType,
    dim: usize,
    /// `(dim, multiplier · dim)`
    state_to_inputs: Tensor,
}

impl RecurrentCell {
    pub fn new(
        store: &mut ParamStore,
        name: &str,
        kind: TransitionType,
        dim: usize,
        component: Component,
    ) -> AsrResult<Self> {
        let width = dim * kind.input_multiplier();
        let state_to_inputs = store.get(
            &format!("{name}.state_to_inputs"),
            &[dim, width],
            component,
            ParamRole::RecurrentWeights,
        )?;
        Ok(Self {
            kind,
            dim,
            state_to_inputs,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Ширина входов, которую ждёт ячейка.
    pub fn input_dim(&self) -> usize {
        self.dim * self.kind.input_multiplier()
    }

    pub fn initial_state(&self, batch_size: usize, device: &Device) -> Result<RecurrentState> {
        let zeros = Tensor::zeros((batch_size, self.dim), DType::F32, device)?;
        let cells = match self.kind {
            TransitionType::Lstm => Some(zeros.clone()),
            _ => None,
        };
        Ok(RecurrentState {
            states: zeros,
            cells,
        })
    }

    /// Один шаг. `inputs`: `(B, input_dim)`, `mask`: `(B, 1)` или `None`.
    pub fn step(
        &self,
        inputs: &Tensor,
        state: &RecurrentState,
        mask: Option<&Tensor>,
    ) -> Result<RecurrentState> {
        let dim = self.dim;
        let h = &state.states;
        let next = match self.kind {
            TransitionType::SimpleRecurrent => RecurrentState {
                states: (inputs + h.matmul(&self.state_to_inputs)?)?.tanh()?,
                cells: None,
            },
            TransitionType::GatedRecurrent => {
                // inputs = [candidate | update | reset]
                let candidate_in = inputs.narrow(D::Minus1, 0, dim)?;
                let gate_in = inputs.narrow(D::Minus1, dim, 2 * dim)?;
                let state_to_state = self.state_to_inputs.narrow(1, 0, dim)?;
                let state_to_gates = self.state_to_inputs.narrow(1, dim, 2 * dim)?;

                let gates = sigmoid(&(gate_in + h.matmul(&state_to_gates)?)?)?;
                let update = gates.narrow(D::Minus1, 0, dim)?;
                let reset = gates.narrow(D::Minus1, dim, dim)?;

                let candidate = (candidate_in + (h * &reset)?.matmul(&state_to_state)?)?.tanh()?;
                let keep = update.affine(-1.0, 1.0)?;
                RecurrentState {
                    states: ((candidate * &update)? + (h * keep)?)?,
                    cells: None,
                }
            }
            TransitionType::Lstm => {
                let gates = (inputs + h.matmul(&self.state_to_inputs)?)?;
                let i_gate = sigmoid(&gates.narrow(D::Minus1, 0, dim)?)?;
                let f_gate = sigmoid(&gates.narrow(D::Minus1, dim, dim)?)?;
                let g_gate = gates.narrow(D::Minus1, 2 * dim, dim)?.tanh()?;
                let o_gate = sigmoid(&gates.narrow(D::Minus1, 3 * dim, dim)?)?;

                let c_prev = match &state.cells {
                    Some(c) => c.clone(),
                    None => h.zeros_like()?,
                };
                // c = f * c_prev + i * g, h = o * tanh(c)
                let c_new = ((f_gate * c_prev)? + (i_gate * g_gate)?)?;
                let h_new = (o_gate * c_new.tanh()?)?;
                RecurrentState {
                    states: h_new,
                    cells: Some(c_new),
                }
            }
        };

        match mask {
            None => Ok(next),
            Some(mask) => Ok(RecurrentState {
                states: masked_update(mask, &next.states, &state.states)?,
                cells: match (&next.cells, &state.cells) {
                    (Some(new), Some(old)) => Some(masked_update(mask, new, old)?),
                    (new, _) => new.clone(),
                },
            }),
        }
    }

    /// Прогнать ячейку по времени.
    ///
    /// `inputs`: `(T, B, input_dim)`, `mask`: `(T, B)`. Возвращает `(T, B, dim)`
    /// в исходном порядке времени, даже при `reverse`.
    pub fn scan(&self, inputs: &Tensor, mask: Option<&Tensor>, reverse: bool) -> Result<Tensor> {
        let (steps, batch, _) = inputs.dims3()?;
        let mut state = self.initial_state(batch, inputs.device())?;
        let mut outputs = Vec::with_capacity(steps);

        let order: Vec<usize> = if reverse {
            (0..steps).rev().collect()
        } else {
            (0..steps).collect()
        };
        for t in order {
            let x = inputs.i(t)?;
            let m = mask.map(|m| m.i(t)?.unsqueeze(1)).transpose()?;
            state = self.step(&x, &state, m.as_ref())?;
            outputs.push(state.states.clone());
        }
        if reverse {
            outputs.reverse();
        }
        Tensor::stack(&outputs, 0)
    }
}

/// `m · new + (1 − m) · old`, `m`: `(B, 1)`.
fn masked_update(mask: &Tensor, new: &Tensor, old: &Tensor) -> Result<Tensor> {
    let keep = mask.affine(-1.0, 1.0)?;
    new.broadcast_mul(mask)? + old.broadcast_mul(&keep)?
}
