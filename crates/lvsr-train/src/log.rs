//! Лог обучения: метрики по итерациям и статус цикла.

use std::collections::BTreeMap;

use lvsr_core::MetricsSink;
use serde::{Deserialize, Serialize};

/// Причина штатного завершения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Выполнено заданное число батчей.
    NumBatches,
    /// Выполнено заданное число эпох.
    NumEpochs,
    /// Норма градиента стала NaN.
    Divergence,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStatus {
    pub iterations_done: usize,
    pub epochs_done: usize,
    pub finish_reason: Option<FinishReason>,
}

/// Журнал `итерация → {метрика → значение}`, только дополняется.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "LogRepr", from = "LogRepr")]
pub struct TrainingLog {
    pub status: TrainingStatus,
    rows: BTreeMap<usize, BTreeMap<String, f64>>,
}

impl TrainingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, iteration: usize) -> Option<&BTreeMap<String, f64>> {
        self.rows.get(&iteration)
    }

    pub fn current_row(&self) -> Option<&BTreeMap<String, f64>> {
        self.row(self.status.iterations_done)
    }

    pub fn get(&self, iteration: usize, name: &str) -> Option<f64> {
        self.rows.get(&iteration)?.get(name).copied()
    }

    /// Последнее записанное значение метрики.
    pub fn last(&self, name: &str) -> Option<(usize, f64)> {
        self.rows
            .iter()
            .rev()
            .find_map(|(&i, row)| row.get(name).map(|&v| (i, v)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &BTreeMap<String, f64>)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl MetricsSink for TrainingLog {
    fn record(&mut self, iteration: usize, name: &str, value: f64) {
        self.rows
            .entry(iteration)
            .or_default()
            .insert(name.to_string(), value);
    }
}

/// JSON-представление: неконечные значения хранятся как `null`.
#[derive(Clone, Serialize, Deserialize)]
struct LogRepr {
    status: TrainingStatus,
    rows: BTreeMap<usize, BTreeMap<String, Option<f64>>>,
}

impl From<TrainingLog> for LogRepr {
    fn from(log: TrainingLog) -> Self {
        let rows = log
            .rows
            .into_iter()
            .map(|(i, row)| {
                let row = row
                    .into_iter()
                    .map(|(k, v)| (k, v.is_finite().then_some(v)))
                    .collect();
                (i, row)
            })
            .collect();
        Self {
            status: log.status,
            rows,
        }
    }
}

impl From<LogRepr> for TrainingLog {
    fn from(repr: LogRepr) -> Self {
        let rows = repr
            .rows
            .into_iter()
            .map(|(i, row)| {
                let row = row
                    .into_iter()
                    .map(|(k, v)| (k, v.unwrap_or(f64::NAN)))
                    .collect();
                (i, row)
            })
            .collect();
        Self {
            status: repr.status,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let mut log = TrainingLog::new();
        log.record(0, "valid_cost", 3.0);
        log.record(1, "total_gradient_norm", 1.5);
        log.record(2, "total_gradient_norm", 0.5);
        assert_eq!(log.get(0, "valid_cost"), Some(3.0));
        assert_eq!(log.last("total_gradient_norm"), Some((2, 0.5)));
        assert_eq!(log.len(), 3);
        assert!(log.get(5, "x").is_none());
    }

    #[test]
    fn test_json_keeps_nan_as_null() {
        let mut log = TrainingLog::new();
        log.record(4, "total_gradient_norm", f64::NAN);
        log.record(4, "cost", 2.0);
        log.status.iterations_done = 4;
        log.status.finish_reason = Some(FinishReason::Divergence);

        let json = serde_json::to_string(&log).unwrap();
        assert!(json.contains("null"));
        let back: TrainingLog = serde_json::from_str(&json).unwrap();
        assert!(back.get(4, "total_gradient_norm").unwrap().is_nan());
        assert_eq!(back.get(4, "cost"), Some(2.0));
        assert_eq!(back.status, log.status);
        assert!(back.current_row().is_some());
    }
}
