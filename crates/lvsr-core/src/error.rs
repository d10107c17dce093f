//! Error types for LVSR.

use thiserror::Error;

/// Main error type for recognizer operations.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Audio processing errors.
    #[error("Audio error: {0}")]
    Audio(String),

    /// Ошибки конфигурации: неизвестный ключ, неверный вариант enum,
    /// несовместимая с формой схема инициализации.
    #[error("Config error: {0}")]
    Config(String),

    /// Некорректный пример данных (пустая запись, несовпадение длин маски и т.п.).
    #[error("Data error: {0}")]
    Data(String),

    /// Численные ошибки (NaN/Inf в loss или градиентах).
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Расхождение между стоимостью beam search и teacher-forced пересчётом.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Несовместимый или повреждённый чекпоинт.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Model construction errors.
    #[error("Model error: {0}")]
    Model(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for recognizer operations.
pub type AsrResult<T> = Result<T, AsrError>;
