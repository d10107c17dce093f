//! # lvsr-data
//!
//! Источники данных для обучения и поиска:
//!
//! - [`Dataset`] — индексируемый набор размеченных примеров (в памяти или по манифесту)
//! - [`FeatureStream`] — извлечение признаков с отбраковкой плохих записей
//! - [`BatchStream`] — сортировка окнами, паддинг и маски

pub mod batching;
pub mod dataset;
pub mod stream;

pub use batching::BatchStream;
pub use dataset::{Dataset, InMemoryDataset, ManifestDataset};
pub use stream::{build_feature_stream, build_stream, FeatureStream};
