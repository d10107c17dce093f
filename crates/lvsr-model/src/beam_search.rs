//! Beam search по выходам декодера.
//!
//! Луч для одной записи продвигается одним батчем: контекст энкодера
//! размножается на число живых гипотез, состояние декодера переупорядочивается
//! после каждого отбора.

use std::cmp::Ordering;

use candle_core::{Result, Tensor};
use lvsr_core::{AsrError, AsrResult, FeatureSequence, SearchConfig};
use tracing::debug;

use crate::attention::AttendedContext;
use crate::generator::SequenceGenerator;
use crate::model::PhonemeRecognizer;

/// Гипотеза луча.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Выходы, включая завершающий конец последовательности.
    pub outputs: Vec<u32>,
    /// `−log p(outputs)`.
    pub cost: f64,
    pub finished: bool,
}

impl Hypothesis {
    fn empty() -> Self {
        Self {
            outputs: Vec::new(),
            cost: 0.0,
            finished: false,
        }
    }

    pub fn log_probability(&self) -> f64 {
        -self.cost
    }
}

/// Порядок гипотез: стоимость, затем длина, затем лексикографически.
fn compare(a: &Hypothesis, b: &Hypothesis) -> Ordering {
    a.cost
        .total_cmp(&b.cost)
        .then(a.outputs.len().cmp(&b.outputs.len()))
        .then_with(|| a.outputs.cmp(&b.outputs))
}

struct Candidate {
    parent: usize,
    hypothesis: Hypothesis,
}

/// Индексы `k` наибольших значений; при равенстве меньший индекс раньше.
fn top_k(row: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..row.len()).collect();
    indices.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
    indices.truncate(k);
    indices
}

#[derive(Debug, Clone)]
pub struct BeamSearch {
    beam_size: usize,
    length_divisor: usize,
    ignore_first_eol: bool,
    overgeneration: usize,
    consistency_rtol: f64,
}

impl BeamSearch {
    pub fn new(config: &SearchConfig) -> AsrResult<Self> {
        if config.beam_size == 0 || config.length_divisor == 0 || config.overgeneration == 0 {
            return Err(AsrError::Config(
                "search.beam_size, length_divisor and overgeneration must be positive".into(),
            ));
        }
        Ok(Self {
            beam_size: config.beam_size,
            length_divisor: config.length_divisor,
            ignore_first_eol: config.ignore_first_eol,
            overgeneration: config.overgeneration,
            consistency_rtol: config.consistency_rtol,
        })
    }

    pub fn with_beam_size(mut self, beam_size: usize) -> Self {
        self.beam_size = beam_size.max(1);
        self
    }

    pub fn beam_size(&self) -> usize {
        self.beam_size
    }

    /// Лимит шагов для записи из `input_frames` фреймов.
    pub fn max_steps(&self, input_frames: usize) -> usize {
        (input_frames / self.length_divisor).max(1)
    }

    /// Поиск по контексту одной записи (`batch_size == 1`).
    ///
    /// Возвращает гипотезы от лучшей к худшей.
    pub fn search(
        &self,
        generator: &SequenceGenerator,
        context: &AttendedContext,
        eos: u32,
        max_steps: usize,
    ) -> Result<Vec<Hypothesis>> {
        if context.batch_size() != 1 {
            candle_core::bail!(
                "beam search expects a single recording, got batch of {}",
                context.batch_size()
            );
        }
        let device = context.attended.device();
        let k = generator.alphabet_size().min(self.beam_size * self.overgeneration);

        let mut beam = vec![Hypothesis::empty()];
        let mut state = generator.initial_state(context)?;

        for step in 0..max_steps {
            if beam.iter().all(|h| h.finished) {
                break;
            }
            let expanded = context.expand(beam.len())?;
            let previous: Vec<u32> = beam
                .iter()
                .map(|h| h.outputs.last().copied().unwrap_or(generator.start_symbol()))
                .collect();
            let previous = Tensor::from_vec(previous, beam.len(), device)?;
            let out = generator.step(&previous, &state, &expanded)?;
            let log_probs = out.log_probs.to_vec2::<f32>()?;

            let mut candidates = Vec::new();
            for (parent, (hyp, row)) in beam.iter().zip(&log_probs).enumerate() {
                if hyp.finished {
                    candidates.push(Candidate {
                        parent,
                        hypothesis: hyp.clone(),
                    });
                    continue;
                }
                for symbol in top_k(row, k) {
                    let mut outputs = hyp.outputs.clone();
                    outputs.push(symbol as u32);
                    let first_eol_ignored = self.ignore_first_eol && step == 0;
                    candidates.push(Candidate {
                        parent,
                        hypothesis: Hypothesis {
                            outputs,
                            cost: hyp.cost - row[symbol] as f64,
                            finished: symbol as u32 == eos && !first_eol_ignored,
                        },
                    });
                }
            }
            candidates.sort_by(|a, b| compare(&a.hypothesis, &b.hypothesis));
            candidates.truncate(self.beam_size);

            let rows: Vec<u32> = candidates.iter().map(|c| c.parent as u32).collect();
            let rows = Tensor::from_vec(rows, candidates.len(), device)?;
            state = out.state.select(&rows)?;
            beam = candidates.into_iter().map(|c| c.hypothesis).collect();

            debug!(
                "beam step {step}: best cost {:.4}, {} finished",
                beam[0].cost,
                beam.iter().filter(|h| h.finished).count()
            );
        }

        beam.sort_by(compare);
        Ok(beam)
    }

    /// Распознать запись и сверить лучшую гипотезу с teacher-forced стоимостью.
    pub fn decode(
        &self,
        recognizer: &PhonemeRecognizer,
        features: &FeatureSequence,
    ) -> AsrResult<Vec<Hypothesis>> {
        let context = recognizer.single_context(features)?;
        let max_steps = self.max_steps(features.num_frames());
        let hypotheses = self.search(recognizer.generator(), &context, recognizer.eos(), max_steps)?;
        if let Some(best) = hypotheses.first() {
            self.verify(recognizer, features, best)?;
        }
        Ok(hypotheses)
    }

    /// Пересчитать стоимость гипотезы через teacher forcing.
    pub fn verify(
        &self,
        recognizer: &PhonemeRecognizer,
        features: &FeatureSequence,
        hypothesis: &Hypothesis,
    ) -> AsrResult<f64> {
        let analysis = recognizer.analyze(features, &hypothesis.outputs)?;
        let rescored: f64 = analysis.costs.iter().map(|&c| c as f64).sum();
        let scale = rescored.abs().max(hypothesis.cost.abs());
        // f32-точность на коротких гипотезах
        let tolerance = self.consistency_rtol * scale + 1e-6;
        if !((rescored - hypothesis.cost).abs() <= tolerance) {
            return Err(AsrError::Consistency(format!(
                "beam cost {} differs from rescored cost {rescored}",
                hypothesis.cost
            )));
        }
        Ok(rescored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyp(outputs: &[u32], cost: f64) -> Hypothesis {
        Hypothesis {
            outputs: outputs.to_vec(),
            cost,
            finished: false,
        }
    }

    #[test]
    fn test_top_k_breaks_ties_by_index() {
        assert_eq!(top_k(&[0.1, 0.5, 0.5, 0.2], 3), vec![1, 2, 3]);
        assert_eq!(top_k(&[0.1, 0.2], 5), vec![1, 0]);
    }

    #[test]
    fn test_ordering_ties() {
        let mut hyps = vec![hyp(&[2, 1], 1.0), hyp(&[3], 1.0), hyp(&[1, 3], 1.0), hyp(&[0], 0.5)];
        hyps.sort_by(compare);
        let outputs: Vec<Vec<u32>> = hyps.into_iter().map(|h| h.outputs).collect();
        assert_eq!(outputs, vec![vec![0], vec![3], vec![1, 3], vec![2, 1]]);
    }

    #[test]
    fn test_max_steps() {
        let search = BeamSearch::new(&SearchConfig::default()).unwrap();
        assert_eq!(search.max_steps(2), 1);
        assert_eq!(search.max_steps(10), 3);
        assert_eq!(search.max_steps(0), 1);
    }

    #[test]
    fn test_rejects_zero_beam() {
        let config = SearchConfig {
            beam_size: 0,
            ..SearchConfig::default()
        };
        assert!(matches!(BeamSearch::new(&config), Err(AsrError::Config(_))));
    }
}
