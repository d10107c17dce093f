//! Отчёт beam search по высказываниям.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::warn;

use lvsr_core::{DataStream, FeatureExample, PhonemeAlphabet};
use lvsr_model::expressions::{monotonicity_penalty, weights_std};
use lvsr_model::{phoneme_error_rate, Analysis, BeamSearch, PhonemeRecognizer};

/// Метки без завершающего конца последовательности.
fn strip_eos(labels: &[u32], eos: u32) -> &[u32] {
    match labels.split_last() {
        Some((&last, rest)) if last == eos => rest,
        _ => labels,
    }
}

/// Штраф за немонотонность для весов одной записи `[step][frame]`.
fn single_penalty(weights: &[Vec<f32>]) -> Result<f64> {
    let steps = weights.len();
    let frames = weights.first().map(Vec::len).unwrap_or(0);
    let flat: Vec<f32> = weights.iter().flatten().copied().collect();
    let weights = Tensor::from_vec(flat, (steps, 1, frames), &Device::Cpu)?;
    let mask = Tensor::ones((steps, 1), DType::F32, &Device::Cpu)?;
    Ok(monotonicity_penalty(&weights, &mask)?)
}

fn print_analysis(label: &str, analysis: &Analysis) -> Result<()> {
    let cost: f64 = analysis.costs.iter().map(|&c| c as f64).sum();
    println!("{label} cost: {cost:.4}");
    println!("{label} weight std: {:.4}", weights_std(&analysis.weights));
    println!(
        "{label} monotonicity penalty: {:.4}",
        single_penalty(&analysis.weights)?
    );
    Ok(())
}

/// Прогнать поиск по потоку и вернуть средний PER.
pub fn run(
    recognizer: &PhonemeRecognizer,
    search: &BeamSearch,
    alphabet: &PhonemeAlphabet,
    stream: &mut dyn DataStream<Item = FeatureExample>,
    limit: Option<usize>,
) -> Result<f64> {
    let eos = recognizer.eos();
    let mut error_sum = 0.0;
    let mut count = 0usize;

    for item in stream.epoch_iter().take(limit.unwrap_or(usize::MAX)) {
        let example = match item {
            Ok(example) => example,
            Err(e) => {
                warn!("Высказывание пропущено: {e}");
                continue;
            }
        };
        println!("Utterance {count} ({})", example.id);

        let hypotheses = search.decode(recognizer, &example.features)?;
        let Some(best) = hypotheses.first() else {
            warn!("Пустой луч для {}", example.id);
            continue;
        };
        let recognized = recognizer.analyze(&example.features, &best.outputs)?;
        let groundtruth = recognizer.analyze(&example.features, &example.labels)?;

        let reference = strip_eos(&example.labels, eos);
        let error = phoneme_error_rate(reference, strip_eos(&best.outputs, eos));
        error_sum += error;
        count += 1;

        println!("Beam search cost: {:.4}", best.cost);
        println!("{}", alphabet.decode(&best.outputs));
        print_analysis("Recognized", &recognized)?;
        println!("{}", alphabet.decode(&example.labels));
        print_analysis("Groundtruth", &groundtruth)?;
        println!("PER: {error:.4}");
        println!("Average PER: {:.4}", error_sum / count as f64);
    }

    if count == 0 {
        anyhow::bail!("В датасете нет пригодных высказываний");
    }
    Ok(error_sum / count as f64)
}
