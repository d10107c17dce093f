//! Правила преобразования градиента в шаг.
//!
//! Правило получает шаги всех параметров разом: отсечение по глобальной норме
//! требует видеть их вместе. Правила применяются цепочкой через
//! [`CompositeRule`]; на входе первого правила шаг равен градиенту.

use std::collections::HashMap;

use candle_core::{DType, Result, Tensor};
use lvsr_core::OptimizerConfig;
use tracing::warn;

/// Шаг одного параметра.
#[derive(Debug, Clone)]
pub struct ParamStep {
    pub name: String,
    /// Текущее значение параметра.
    pub param: Tensor,
    pub step: Tensor,
}

/// L2-норма тензора.
pub fn l2_norm(tensor: &Tensor) -> Result<f64> {
    tensor
        .sqr()?
        .sum_all()?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()
        .map(f64::sqrt)
}

/// Глобальная L2-норма набора тензоров.
pub fn global_norm<'a>(tensors: impl IntoIterator<Item = &'a Tensor>) -> Result<f64> {
    let mut total = 0.0;
    for tensor in tensors {
        total += l2_norm(tensor)?.powi(2);
    }
    Ok(total.sqrt())
}

pub trait StepRule {
    fn compute_steps(&mut self, steps: &mut [ParamStep]) -> Result<()>;
}

/// Масштабировать все шаги так, чтобы глобальная норма не превышала порог.
#[derive(Debug, Clone)]
pub struct StepClipping {
    pub threshold: f64,
}

impl StepRule for StepClipping {
    fn compute_steps(&mut self, steps: &mut [ParamStep]) -> Result<()> {
        let norm = global_norm(steps.iter().map(|s| &s.step))?;
        if norm > self.threshold {
            let multiplier = self.threshold / norm;
            for s in steps.iter_mut() {
                s.step = (&s.step * multiplier)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Scale {
    pub learning_rate: f64,
}

impl StepRule for Scale {
    fn compute_steps(&mut self, steps: &mut [ParamStep]) -> Result<()> {
        for s in steps.iter_mut() {
            s.step = (&s.step * self.learning_rate)?;
        }
        Ok(())
    }
}

/// `v ← momentum · v + learning_rate · step`, шаг = `v`.
#[derive(Debug)]
pub struct Momentum {
    pub learning_rate: f64,
    pub momentum: f64,
    velocities: HashMap<String, Tensor>,
}

impl Momentum {
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        Self {
            learning_rate,
            momentum,
            velocities: HashMap::new(),
        }
    }
}

impl StepRule for Momentum {
    fn compute_steps(&mut self, steps: &mut [ParamStep]) -> Result<()> {
        for s in steps.iter_mut() {
            let scaled = (&s.step * self.learning_rate)?;
            let velocity = match self.velocities.get(&s.name) {
                Some(previous) => ((previous * self.momentum)? + scaled)?,
                None => scaled,
            };
            self.velocities.insert(s.name.clone(), velocity.clone());
            s.step = velocity;
        }
        Ok(())
    }
}

/// Заменить неконечный шаг параметра на `fallback · param`.
///
/// При `fallback = 0` параметр на этом шаге не меняется.
#[derive(Debug, Clone)]
pub struct RemoveNotFinite {
    pub fallback: f64,
}

impl StepRule for RemoveNotFinite {
    fn compute_steps(&mut self, steps: &mut [ParamStep]) -> Result<()> {
        for s in steps.iter_mut() {
            if !l2_norm(&s.step)?.is_finite() {
                warn!("Неконечный шаг для {}, заменён на {} · param", s.name, self.fallback);
                s.step = (&s.param * self.fallback)?;
            }
        }
        Ok(())
    }
}

/// Последовательное применение правил.
#[derive(Default)]
pub struct CompositeRule {
    rules: Vec<Box<dyn StepRule + Send>>,
}

impl CompositeRule {
    pub fn new(rules: Vec<Box<dyn StepRule + Send>>) -> Self {
        Self { rules }
    }

    /// Клиппинг → scale (или momentum) → замена неконечных шагов.
    pub fn from_config(config: &OptimizerConfig) -> Self {
        let scale: Box<dyn StepRule + Send> = match config.momentum {
            Some(momentum) => Box::new(Momentum::new(config.learning_rate, momentum)),
            None => Box::new(Scale {
                learning_rate: config.learning_rate,
            }),
        };
        Self::new(vec![
            Box::new(StepClipping {
                threshold: config.clip_threshold,
            }),
            scale,
            Box::new(RemoveNotFinite {
                fallback: config.not_finite_fallback,
            }),
        ])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl StepRule for CompositeRule {
    fn compute_steps(&mut self, steps: &mut [ParamStep]) -> Result<()> {
        for rule in &mut self.rules {
            rule.compute_steps(steps)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn steps(values: &[&[f32]]) -> Vec<ParamStep> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ParamStep {
                name: format!("p{i}"),
                param: Tensor::ones(v.len(), DType::F32, &Device::Cpu).unwrap(),
                step: Tensor::new(*v, &Device::Cpu).unwrap(),
            })
            .collect()
    }

    fn values(steps: &[ParamStep]) -> Vec<Vec<f32>> {
        steps.iter().map(|s| s.step.to_vec1::<f32>().unwrap()).collect()
    }

    #[test]
    fn test_clipping_scales_to_threshold() {
        let mut s = steps(&[&[3.0, 0.0], &[4.0]]);
        StepClipping { threshold: 1.0 }.compute_steps(&mut s).unwrap();
        let norm = global_norm(s.iter().map(|s| &s.step)).unwrap();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((values(&s)[0][0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_clipping_twice_is_noop() {
        let mut s = steps(&[&[30.0, -7.0], &[12.0, 1.0, 2.0]]);
        let mut rule = StepClipping { threshold: 5.0 };
        rule.compute_steps(&mut s).unwrap();
        let once = values(&s);
        rule.compute_steps(&mut s).unwrap();
        for (a, b) in once.iter().flatten().zip(values(&s).iter().flatten()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_small_steps_are_not_clipped() {
        let mut s = steps(&[&[0.1, 0.2]]);
        StepClipping { threshold: 1.0 }.compute_steps(&mut s).unwrap();
        assert_eq!(values(&s), vec![vec![0.1, 0.2]]);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut rule = Momentum::new(0.5, 0.9);
        let mut s = steps(&[&[1.0]]);
        rule.compute_steps(&mut s).unwrap();
        assert!((values(&s)[0][0] - 0.5).abs() < 1e-6);
        let mut s = steps(&[&[1.0]]);
        rule.compute_steps(&mut s).unwrap();
        assert!((values(&s)[0][0] - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_remove_not_finite_uses_fallback() {
        let mut s = steps(&[&[f32::NAN, 1.0], &[2.0]]);
        RemoveNotFinite { fallback: 0.5 }.compute_steps(&mut s).unwrap();
        assert_eq!(values(&s), vec![vec![0.5, 0.5], vec![2.0]]);
    }

    #[test]
    fn test_composite_order() {
        let config = OptimizerConfig {
            clip_threshold: 1.0,
            learning_rate: 0.1,
            momentum: None,
            not_finite_fallback: 0.0,
        };
        let mut rule = CompositeRule::from_config(&config);
        assert_eq!(rule.len(), 3);
        let mut s = steps(&[&[6.0, 8.0], &[f32::INFINITY]]);
        rule.compute_steps(&mut s).unwrap();
        // бесконечная норма обнуляет всё после клиппинга
        assert_eq!(values(&s), vec![vec![0.0, 0.0], vec![0.0]]);
    }
}
