//! Наблюдаемые величины обучения и их агрегация.

use std::collections::BTreeMap;

use candle_core::{Result, Tensor};
use lvsr_core::{AsrResult, Batch, DataStream, MetricsSink};
use lvsr_model::expressions::{entropy, monotonicity_penalty};
use lvsr_model::{PhonemeRecognizer, RecognizerCost};
use tracing::{info, warn};

use crate::algorithm::StepStats;

pub const SEQUENCE_COST: &str = "sequence_log_likelihood";
pub const PHONEME_COST: &str = "phoneme_log_likelihood";
pub const TOTAL_GRADIENT_NORM: &str = "total_gradient_norm";
pub const TOTAL_STEP_NORM: &str = "total_step_norm";

pub const AVERAGE_PREFIX: &str = "average_";
pub const VALID_PREFIX: &str = "valid_";

/// Скалярная стоимость батча: сумма маскированных стоимостей / размер батча.
pub fn batch_loss(cost: &RecognizerCost) -> Result<Tensor> {
    let batch_size = cost.generated.costs.dim(1)?;
    cost.generated.costs.sum_all()? / batch_size as f64
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}

/// Все наблюдаемые величины одного обучающего батча.
pub fn observe(cost: &RecognizerCost, loss: &Tensor) -> Result<Vec<(String, f64)>> {
    let generated = &cost.generated;
    let labels_mask = &cost.inputs.labels_mask;
    let (max_phonemes, batch_size) = labels_mask.dims2()?;
    let max_recording = cost.inputs.recordings_mask.dim(0)?;
    let num_phonemes = scalar(&labels_mask.sum_all()?)?;
    let total_cost = scalar(&generated.costs.sum_all()?)?;

    let readouts = generated.readouts.flatten_all()?;
    let penalty = monotonicity_penalty(&generated.weights, labels_mask)?;
    let entropy = entropy(&generated.weights, labels_mask)?;

    Ok(vec![
        (SEQUENCE_COST.into(), scalar(loss)?),
        (PHONEME_COST.into(), total_cost / num_phonemes.max(1.0)),
        ("min_energy".into(), scalar(&readouts.min(0)?)?),
        ("max_energy".into(), scalar(&readouts.max(0)?)?),
        ("mean_attended".into(), scalar(&cost.encoded.attended.abs()?.mean_all()?)?),
        ("mean_bottom_output".into(), scalar(&cost.encoded.bottom.abs()?.mean_all()?)?),
        ("weights_penalty".into(), penalty / batch_size as f64),
        ("weights_entropy".into(), entropy / num_phonemes.max(1.0)),
        ("batch_size".into(), batch_size as f64),
        ("max_recording_length".into(), max_recording as f64),
        ("max_num_phonemes".into(), max_phonemes as f64),
        ("mask_density".into(), num_phonemes / (max_phonemes * batch_size) as f64),
    ])
}

/// Статистика шага оптимизатора в виде именованных величин.
pub fn step_observables(stats: &StepStats) -> Vec<(String, f64)> {
    let mut values = vec![
        (TOTAL_STEP_NORM.to_string(), stats.total_step_norm),
        (TOTAL_GRADIENT_NORM.to_string(), stats.total_gradient_norm),
    ];
    for (name, norm) in &stats.param_norms {
        values.push((format!("{name}_norm"), *norm));
    }
    for (name, norm) in &stats.grad_norms {
        values.push((format!("{name}_grad_norm"), *norm));
    }
    values
}

/// Среднее по батчам, сбрасывается в лог каждые `every_n_batches` батчей.
#[derive(Debug)]
pub struct TrainingAverager {
    every_n_batches: usize,
    batches: usize,
    sums: BTreeMap<String, (f64, usize)>,
}

impl TrainingAverager {
    pub fn new(every_n_batches: usize) -> Self {
        Self {
            every_n_batches: every_n_batches.max(1),
            batches: 0,
            sums: BTreeMap::new(),
        }
    }

    pub fn accumulate(&mut self, values: &[(String, f64)]) {
        self.batches += 1;
        for (name, value) in values {
            let entry = self.sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    /// Записать средние, если накоплено достаточно батчей.
    pub fn maybe_flush(&mut self, iteration: usize, sink: &mut dyn MetricsSink) -> bool {
        if self.batches < self.every_n_batches {
            return false;
        }
        for (name, (sum, count)) in std::mem::take(&mut self.sums) {
            sink.record(iteration, &format!("{AVERAGE_PREFIX}{name}"), sum / count as f64);
        }
        self.batches = 0;
        true
    }
}

/// Стоимости на валидационном потоке без обновления параметров.
pub fn validate<S>(recognizer: &PhonemeRecognizer, stream: &mut S) -> AsrResult<Vec<(String, f64)>>
where
    S: DataStream<Item = Batch> + ?Sized,
{
    let mut total_cost = 0.0;
    let mut recordings = 0usize;
    let mut phonemes = 0.0;
    for item in stream.epoch_iter() {
        let batch = match item {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Пропуск валидационного батча: {e}");
                continue;
            }
        };
        let cost = recognizer.cost(&batch)?;
        total_cost += scalar(&cost.generated.costs.sum_all()?)?;
        phonemes += scalar(&cost.inputs.labels_mask.sum_all()?)?;
        recordings += batch.batch_size();
    }
    if recordings == 0 {
        warn!("Валидационный поток пуст");
        return Ok(Vec::new());
    }
    let values = vec![
        (format!("{VALID_PREFIX}{SEQUENCE_COST}"), total_cost / recordings as f64),
        (format!("{VALID_PREFIX}{PHONEME_COST}"), total_cost / phonemes.max(1.0)),
    ];
    info!(
        "Валидация: {} записей, {} = {:.4}",
        recordings, values[0].0, values[0].1
    );
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::TrainingLog;

    #[test]
    fn test_averager_flushes_means() {
        let mut averager = TrainingAverager::new(2);
        let mut log = TrainingLog::new();
        averager.accumulate(&[("cost".into(), 1.0), ("norm".into(), 4.0)]);
        assert!(!averager.maybe_flush(1, &mut log));
        averager.accumulate(&[("cost".into(), 3.0), ("norm".into(), 6.0)]);
        assert!(averager.maybe_flush(2, &mut log));
        assert_eq!(log.get(2, "average_cost"), Some(2.0));
        assert_eq!(log.get(2, "average_norm"), Some(5.0));

        averager.accumulate(&[("cost".into(), 10.0)]);
        assert!(!averager.maybe_flush(3, &mut log));
    }

    #[test]
    fn test_step_observables_names() {
        let stats = StepStats {
            total_gradient_norm: 2.0,
            total_step_norm: 0.5,
            param_norms: vec![("w".into(), 1.0)],
            grad_norms: vec![("w".into(), 2.0)],
        };
        let names: Vec<String> = step_observables(&stats).into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["total_step_norm", "total_gradient_norm", "w_norm", "w_grad_norm"]
        );
    }
}
