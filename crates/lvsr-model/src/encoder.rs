//! Энкодер: bottom MLP → общий fork → двунаправленная рекуррентная сеть.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::Linear;
use lvsr_core::{AsrResult, Component, NetConfig, ParamRole};

use crate::params::ParamStore;
use crate::recurrent::RecurrentCell;

/// Аффинный слой с параметрами из хранилища.
pub(crate) fn linear(
    store: &mut ParamStore,
    name: &str,
    in_dim: usize,
    out_dim: usize,
    component: Component,
) -> AsrResult<Linear> {
    let weight = store.get(
        &format!("{name}.weight"),
        &[out_dim, in_dim],
        component,
        ParamRole::Weights,
    )?;
    let bias = store.get(&format!("{name}.bias"), &[out_dim], component, ParamRole::Biases)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Выходы энкодера, time-major.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Выход bottom MLP `(T, B, dims_bottom.last)`.
    pub bottom: Tensor,
    /// Конкатенация прямого и обратного прохода `(T, B, 2·dim_bidir)`.
    pub attended: Tensor,
}

pub struct Encoder {
    bottom: Vec<Linear>,
    fork: Linear,
    forward: RecurrentCell,
    backward: RecurrentCell,
}

impl Encoder {
    pub fn new(store: &mut ParamStore, config: &NetConfig, num_features: usize) -> AsrResult<Self> {
        let mut bottom = Vec::with_capacity(config.dims_bottom.len());
        let mut in_dim = num_features;
        for (i, &out_dim) in config.dims_bottom.iter().enumerate() {
            bottom.push(linear(
                store,
                &format!("recognizer.bottom.linear_{i}"),
                in_dim,
                out_dim,
                Component::Bottom,
            )?);
            in_dim = out_dim;
        }

        let forward = RecurrentCell::new(
            store,
            "recognizer.encoder.forward",
            config.enc_transition,
            config.dim_bidir,
            Component::Encoder,
        )?;
        let backward = RecurrentCell::new(
            store,
            "recognizer.encoder.backward",
            config.enc_transition,
            config.dim_bidir,
            Component::Encoder,
        )?;
        let fork = linear(
            store,
            "recognizer.encoder.fork",
            in_dim,
            forward.input_dim(),
            Component::Encoder,
        )?;

        Ok(Self {
            bottom,
            fork,
            forward,
            backward,
        })
    }

    /// Ширина выхода (`2·dim_bidir`).
    pub fn output_dim(&self) -> usize {
        2 * self.forward.dim()
    }

    /// `recordings`: `(T, B, F)`, `mask`: `(T, B)`.
    pub fn forward(&self, recordings: &Tensor, mask: Option<&Tensor>) -> Result<EncoderOutput> {
        let mut x = recordings.clone();
        for layer in &self.bottom {
            x = layer.forward(&x)?.tanh()?;
        }
        let bottom = x;

        let inputs = self.fork.forward(&bottom)?;
        let forward = self.forward.scan(&inputs, mask, false)?;
        let backward = self.backward.scan(&inputs, mask, true)?;
        let attended = Tensor::cat(&[&forward, &backward], D::Minus1)?;

        Ok(EncoderOutput { bottom, attended })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, IndexOp};
    use lvsr_core::{InitConfig, TransitionType};

    fn config(kind: TransitionType) -> NetConfig {
        NetConfig {
            dim_dec: 4,
            dim_bidir: 3,
            dims_bottom: vec![5],
            enc_transition: kind,
            ..NetConfig::default()
        }
    }

    #[test]
    fn test_output_shape_and_finite_padding() {
        for kind in [
            TransitionType::SimpleRecurrent,
            TransitionType::GatedRecurrent,
            TransitionType::Lstm,
        ] {
            let device = Device::Cpu;
            let mut store = ParamStore::new(InitConfig::default(), 1, &device);
            let encoder = Encoder::new(&mut store, &config(kind), 6).unwrap();
            let recordings = Tensor::randn(0f32, 1.0, (5, 2, 6), &device).unwrap();
            let mut mask = vec![1.0f32; 10];
            // второй пример длины 3
            mask[3 * 2 + 1] = 0.0;
            mask[4 * 2 + 1] = 0.0;
            let mask = Tensor::from_vec(mask, (5, 2), &device).unwrap();

            let out = encoder.forward(&recordings, Some(&mask)).unwrap();
            assert_eq!(out.bottom.dims(), &[5, 2, 5]);
            assert_eq!(out.attended.dims(), &[5, 2, 6]);
            let values = out.attended.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|v| v.is_finite()), "{kind:?}");
        }
    }

    #[test]
    fn test_padding_does_not_leak_into_real_frames() {
        let device = Device::Cpu;
        let mut store = ParamStore::new(InitConfig::default(), 2, &device);
        let encoder = Encoder::new(&mut store, &config(TransitionType::GatedRecurrent), 6).unwrap();

        let short = Tensor::randn(0f32, 1.0, (3, 1, 6), &device).unwrap();
        let garbage = Tensor::full(7.0f32, (2, 1, 6), &device).unwrap();
        let padded = Tensor::cat(&[&short, &garbage], 0).unwrap();
        let mask = Tensor::new(&[[1.0f32], [1.0], [1.0], [0.0], [0.0]], &device).unwrap();

        let alone = encoder.forward(&short, None).unwrap().attended;
        let batched = encoder.forward(&padded, Some(&mask)).unwrap().attended;
        let diff = (alone - batched.i(0..3).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }
}
