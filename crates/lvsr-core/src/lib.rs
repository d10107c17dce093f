//! # lvsr-core
//!
//! Базовые типы, трейты и определения ошибок для фонемного распознавателя.
//!
//! - Общие типы данных (`AudioBuffer`, `FeatureSequence`, `Batch`)
//! - Типизированная конфигурация с наложением JSON-патчей
//! - Унифицированная обработка ошибок через `AsrError`
//! - Фонемный алфавит [`PhonemeAlphabet`]
//! - Трейты [`DataStream`] и [`MetricsSink`]

pub mod config;
pub mod error;
pub mod phonemes;
pub mod traits;
pub mod types;

pub use config::{
    AttentionConfig, AttentionType, Component, DataConfig, FeatureExtractorConfig, InitConfig,
    InitRule, InitScheme, MonitoringConfig, NetConfig, OptimizerConfig, ParamRole,
    RecognizerConfig, SearchConfig, TransitionType,
};
pub use error::{AsrError, AsrResult};
pub use phonemes::PhonemeAlphabet;
pub use traits::{DataStream, MetricsSink};
pub use types::{AudioBuffer, Batch, Example, FeatureExample, FeatureSequence, Recording};
