//! Главный цикл обучения.
//!
//! Состояния: граница эпохи → шаги по батчам → (граница эпохи | завершение |
//! аварийная остановка). Расходимость проверяется один раз на батч: если
//! глобальная норма градиента стала NaN, цикл останавливается после этого
//! батча.

use lvsr_core::{AsrError, AsrResult, Batch, DataStream, MetricsSink, RecognizerConfig};
use lvsr_model::PhonemeRecognizer;
use tracing::{debug, info, warn};

use crate::algorithm::GradientDescent;
use crate::checkpoint::CheckpointStore;
use crate::log::{FinishReason, TrainingLog};
use crate::monitor::{
    batch_loss, observe, step_observables, validate, TrainingAverager, SEQUENCE_COST,
    TOTAL_GRADIENT_NORM,
};
use crate::step_rule::CompositeRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    EpochBoundary,
    BatchStep,
    Finished(FinishReason),
    Aborted,
}

pub type BatchStreamBox = Box<dyn DataStream<Item = Batch>>;

/// Всё, кроме обучающего потока: так поток можно итерировать, пока
/// обновляется остальное состояние.
struct Trainer {
    recognizer: PhonemeRecognizer,
    config: RecognizerConfig,
    algorithm: GradientDescent<CompositeRule>,
    valid_stream: Option<BatchStreamBox>,
    checkpoints: Option<CheckpointStore>,
    log: TrainingLog,
    averager: TrainingAverager,
    num_batches: Option<usize>,
    max_epochs: Option<usize>,
}

impl Trainer {
    /// Один шаг обучения; возвращает глобальную норму градиента.
    fn batch_step(&mut self, batch: &Batch) -> AsrResult<f64> {
        let cost = self.recognizer.cost(batch)?;
        let loss = batch_loss(&cost)?;
        let mut values = observe(&cost, &loss)?;
        let stats = self.algorithm.step(&loss)?;

        self.log.status.iterations_done += 1;
        let iteration = self.log.status.iterations_done;
        self.log.record(iteration, TOTAL_GRADIENT_NORM, stats.total_gradient_norm);

        values.extend(step_observables(&stats));
        let cost_value = values[0].1;
        self.averager.accumulate(&values);
        self.averager.maybe_flush(iteration, &mut self.log);

        if iteration % self.config.monitoring.print_every_n_batches == 0 {
            info!(
                "Итерация {iteration}: {SEQUENCE_COST} = {cost_value:.4}, {TOTAL_GRADIENT_NORM} = {:.4}, батч {}",
                stats.total_gradient_norm,
                batch.batch_size()
            );
        }
        debug!("Норма шага {:.6}", stats.total_step_norm);
        Ok(stats.total_gradient_norm)
    }

    fn run_validation(&mut self) -> AsrResult<()> {
        let Some(stream) = self.valid_stream.as_mut() else {
            return Ok(());
        };
        let values = validate(&self.recognizer, stream.as_mut())?;
        let iteration = self.log.status.iterations_done;
        for (name, value) in values {
            self.log.record(iteration, &name, value);
        }
        Ok(())
    }

    fn checkpoint(&self) -> AsrResult<()> {
        match &self.checkpoints {
            Some(store) => store.save(&self.recognizer, &self.config, &self.log),
            None => Ok(()),
        }
    }

    fn batches_exhausted(&self) -> bool {
        self.num_batches
            .is_some_and(|n| self.log.status.iterations_done >= n)
    }

    fn epochs_exhausted(&self) -> bool {
        self.max_epochs
            .is_some_and(|n| self.log.status.epochs_done >= n)
    }
}

pub struct MainLoop<S> {
    train_stream: S,
    trainer: Trainer,
    state: LoopState,
    resumed: bool,
}

impl<S: DataStream<Item = Batch>> MainLoop<S> {
    pub fn new(recognizer: PhonemeRecognizer, config: RecognizerConfig, train_stream: S) -> Self {
        let algorithm =
            GradientDescent::new(recognizer.params(), CompositeRule::from_config(&config.optimizer));
        let averager = TrainingAverager::new(config.monitoring.average_every_n_batches);
        Self {
            train_stream,
            trainer: Trainer {
                recognizer,
                config,
                algorithm,
                valid_stream: None,
                checkpoints: None,
                log: TrainingLog::new(),
                averager,
                num_batches: None,
                max_epochs: None,
            },
            state: LoopState::EpochBoundary,
            resumed: false,
        }
    }

    pub fn with_validation(mut self, stream: BatchStreamBox) -> Self {
        self.trainer.valid_stream = Some(stream);
        self
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.trainer.checkpoints = Some(store);
        self
    }

    pub fn finish_after_batches(mut self, num_batches: usize) -> Self {
        self.trainer.num_batches = Some(num_batches);
        self
    }

    pub fn finish_after_epochs(mut self, num_epochs: usize) -> Self {
        self.trainer.max_epochs = Some(num_epochs);
        self
    }

    /// Продолжить с сохранённого лога.
    pub fn resume_from(mut self, log: TrainingLog) -> Self {
        self.trainer.log = log;
        self.resumed = true;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn log(&self) -> &TrainingLog {
        &self.trainer.log
    }

    pub fn recognizer(&self) -> &PhonemeRecognizer {
        &self.trainer.recognizer
    }

    /// Ошибка `Numerical`, если цикл остановлен из-за расходимости.
    pub fn ensure_converged(&self) -> AsrResult<()> {
        if self.state == LoopState::Aborted {
            return Err(AsrError::Numerical(format!(
                "gradient norm became NaN at iteration {}",
                self.trainer.log.status.iterations_done
            )));
        }
        Ok(())
    }

    pub fn into_recognizer(self) -> PhonemeRecognizer {
        self.trainer.recognizer
    }

    pub fn run(&mut self) -> AsrResult<LoopState> {
        if self.trainer.num_batches.is_none() && self.trainer.max_epochs.is_none() {
            return Err(AsrError::Config(
                "training needs a batch or epoch limit".into(),
            ));
        }
        self.trainer.log.status.finish_reason = None;
        let status = &self.trainer.log.status;
        info!(
            "Старт обучения: {} итераций и {} эпох позади{}",
            status.iterations_done,
            status.epochs_done,
            if self.resumed { ", продолжение" } else { "" }
        );

        // Перед первой эпохой или при продолжении.
        self.trainer.run_validation()?;
        if !self.resumed {
            self.trainer.checkpoint()?;
        }

        let final_state = 'epochs: loop {
            if self.trainer.batches_exhausted() {
                break LoopState::Finished(FinishReason::NumBatches);
            }
            if self.trainer.epochs_exhausted() {
                break LoopState::Finished(FinishReason::NumEpochs);
            }

            self.state = LoopState::EpochBoundary;
            let mut batches_in_epoch = 0usize;
            for item in self.train_stream.epoch_iter() {
                let batch = match item {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("Пропуск обучающего батча: {e}");
                        continue;
                    }
                };
                self.state = LoopState::BatchStep;
                batches_in_epoch += 1;

                let gradient_norm = self.trainer.batch_step(&batch)?;
                if gradient_norm.is_nan() {
                    warn!(
                        "Норма градиента NaN на итерации {}, остановка",
                        self.trainer.log.status.iterations_done
                    );
                    break 'epochs LoopState::Aborted;
                }
                if self.trainer.batches_exhausted() {
                    break 'epochs LoopState::Finished(FinishReason::NumBatches);
                }
            }
            if batches_in_epoch == 0 {
                return Err(AsrError::Data("training stream produced no batches".into()));
            }

            self.trainer.log.status.epochs_done += 1;
            info!("Эпоха {} завершена", self.trainer.log.status.epochs_done);
            self.trainer.run_validation()?;
            self.trainer.checkpoint()?;
        };
        self.state = final_state;

        self.trainer.log.status.finish_reason = Some(match self.state {
            LoopState::Finished(reason) => reason,
            _ => FinishReason::Divergence,
        });
        self.trainer.checkpoint()?;
        info!(
            "Обучение остановлено: {:?} после {} итераций",
            self.state, self.trainer.log.status.iterations_done
        );
        Ok(self.state)
    }
}
