//! Трейты-швы между крейтами: поток данных и приёмник метрик.

use crate::error::AsrResult;

/// Перезапускаемый поток данных.
///
/// Каждый вызов [`DataStream::epoch_iter`] начинает новую эпоху.
/// Ошибка отдельного элемента не обрывает эпоху: вызывающая сторона сама
/// решает, пропустить элемент или остановиться.
pub trait DataStream {
    type Item;

    fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<Self::Item>> + '_>;
}

impl<S: DataStream + ?Sized> DataStream for Box<S> {
    type Item = S::Item;

    fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<Self::Item>> + '_> {
        (**self).epoch_iter()
    }
}

/// Приёмник именованных скалярных метрик.
pub trait MetricsSink {
    /// Записать значение метрики на итерации `iteration`.
    fn record(&mut self, iteration: usize, name: &str, value: f64);
}
