//! Градиентный спуск с цепочкой правил шага.

use candle_core::{Tensor, Var};
use lvsr_core::AsrResult;
use tracing::debug;

use crate::step_rule::{global_norm, l2_norm, ParamStep, StepRule};

/// Статистика одного шага.
#[derive(Debug, Clone, Default)]
pub struct StepStats {
    pub total_gradient_norm: f64,
    pub total_step_norm: f64,
    /// `(имя, норма параметра до шага)`
    pub param_norms: Vec<(String, f64)>,
    /// `(имя, норма градиента)`; параметры без градиента отсутствуют.
    pub grad_norms: Vec<(String, f64)>,
}

pub struct GradientDescent<R: StepRule> {
    params: Vec<(String, Var)>,
    rule: R,
}

impl<R: StepRule> GradientDescent<R> {
    pub fn new(params: Vec<(String, Var)>, rule: R) -> Self {
        let params = params
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .collect();
        Self { params, rule }
    }

    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    /// Обратный проход по `loss` и обновление `param -= step`.
    ///
    /// Параметры, до которых не дошёл градиент, не меняются.
    pub fn step(&mut self, loss: &Tensor) -> AsrResult<StepStats> {
        let grads = loss.backward()?;

        let mut stats = StepStats::default();
        let mut steps = Vec::with_capacity(self.params.len());
        let mut targets = Vec::with_capacity(self.params.len());
        for (name, var) in &self.params {
            stats.param_norms.push((name.clone(), l2_norm(var.as_tensor())?));
            let Some(grad) = grads.get(var.as_tensor()) else {
                debug!("Нет градиента для {name}");
                continue;
            };
            stats.grad_norms.push((name.clone(), l2_norm(grad)?));
            steps.push(ParamStep {
                name: name.clone(),
                param: var.as_tensor().clone(),
                step: grad.clone(),
            });
            targets.push(var);
        }
        stats.total_gradient_norm = stats
            .grad_norms
            .iter()
            .map(|(_, n)| n * n)
            .sum::<f64>()
            .sqrt();

        self.rule.compute_steps(&mut steps)?;
        stats.total_step_norm = global_norm(steps.iter().map(|s| &s.step))?;

        for (var, s) in targets.into_iter().zip(&steps) {
            var.set(&var.sub(&s.step)?)?;
        }
        Ok(stats)
    }
}
