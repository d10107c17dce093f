//! # lvsr-train
//!
//! Обучение распознавателя:
//!
//! - [`step_rule`] — клиппинг, масштабирование, momentum, замена неконечных шагов
//! - [`GradientDescent`] — обратный проход и обновление параметров
//! - [`TrainingLog`] — журнал метрик и статус цикла
//! - [`monitor`] — наблюдаемые величины, усреднение, валидация
//! - [`MainLoop`] — эпохи, остановка по NaN, чекпоинты

pub mod algorithm;
pub mod checkpoint;
pub mod log;
pub mod main_loop;
pub mod monitor;
pub mod step_rule;

pub use algorithm::{GradientDescent, StepStats};
pub use checkpoint::{CheckpointState, CheckpointStore};
pub use log::{FinishReason, TrainingLog, TrainingStatus};
pub use main_loop::{BatchStreamBox, LoopState, MainLoop};
pub use step_rule::{
    CompositeRule, Momentum, ParamStep, RemoveNotFinite, Scale, StepClipping, StepRule,
};
