//! Батчинг: окна сортировки по длине, паддинг и маски.

use std::collections::VecDeque;

use lvsr_core::{AsrResult, Batch, DataStream, FeatureExample};
use tracing::{debug, warn};

/// Поток дополненных батчей.
///
/// Если задан `sort_k_batches`, набирается окно из
/// `batch_size * sort_k_batches` примеров, которое устойчиво сортируется по
/// числу фреймов и режется на батчи. Последний батч эпохи может быть неполным.
/// Ошибочные примеры пропускаются с предупреждением.
pub struct BatchStream<S> {
    inner: S,
    batch_size: usize,
    sort_k_batches: Option<usize>,
    pad_label: u32,
}

impl<S> BatchStream<S>
where
    S: DataStream<Item = FeatureExample>,
{
    pub fn new(inner: S, batch_size: usize, sort_k_batches: Option<usize>, pad_label: u32) -> Self {
        Self {
            inner,
            batch_size: batch_size.max(1),
            sort_k_batches,
            pad_label,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn window_size(&self) -> usize {
        self.batch_size * self.sort_k_batches.unwrap_or(1)
    }
}

impl<S> DataStream for BatchStream<S>
where
    S: DataStream<Item = FeatureExample>,
{
    type Item = Batch;

    fn epoch_iter(&mut self) -> Box<dyn Iterator<Item = AsrResult<Batch>> + '_> {
        let window_size = self.window_size();
        let batch_size = self.batch_size;
        let sort = self.sort_k_batches.is_some();
        let pad_label = self.pad_label;
        Box::new(BatchIter {
            source: self.inner.epoch_iter(),
            window_size,
            batch_size,
            sort,
            pad_label,
            pending: VecDeque::new(),
            exhausted: false,
        })
    }
}

struct BatchIter<'a> {
    source: Box<dyn Iterator<Item = AsrResult<FeatureExample>> + 'a>,
    window_size: usize,
    batch_size: usize,
    sort: bool,
    pad_label: u32,
    pending: VecDeque<Vec<FeatureExample>>,
    exhausted: bool,
}

impl BatchIter<'_> {
    fn fill_window(&mut self) {
        let mut window = Vec::with_capacity(self.window_size);
        while window.len() < self.window_size {
            match self.source.next() {
                Some(Ok(example)) => window.push(example),
                Some(Err(e)) => warn!("Пример отбракован: {e}"),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        if self.sort {
            // sort_by_key устойчив: равные длины сохраняют порядок потока.
            window.sort_by_key(|e| e.features.num_frames());
        }
        let mut window = window.into_iter().peekable();
        while window.peek().is_some() {
            self.pending
                .push_back(window.by_ref().take(self.batch_size).collect());
        }
    }
}

impl Iterator for BatchIter<'_> {
    type Item = AsrResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_empty() && !self.exhausted {
            self.fill_window();
        }
        let examples = self.pending.pop_front()?;
        debug!("Батч из {} примеров", examples.len());
        Some(Batch::from_examples(&examples, self.pad_label))
    }
}
