//! Статистики весов внимания для мониторинга.

use candle_core::{Result, Tensor};

const ENTROPY_EPS: f32 = 1e-7;

/// Суммарный штраф за немонотонность внимания.
///
/// Для каждого шага `t > 0` считается `Σ_j max(C_t[j] − C_{t−1}[j], 0)`, где
/// `C_t` — кумулятивная сумма весов шага `t`. Штраф нулевой, когда фокус
/// внимания не движется назад. Шаги с нулевой маской не учитываются.
///
/// `weights`: `(L, B, T)`, `labels_mask`: `(L, B)`.
pub fn monotonicity_penalty(weights: &Tensor, labels_mask: &Tensor) -> Result<f64> {
    let weights = weights.to_vec3::<f32>()?;
    let mask = labels_mask.to_vec2::<f32>()?;
    let mut total = 0.0f64;
    for t in 1..weights.len() {
        for (b, (current, previous)) in weights[t].iter().zip(&weights[t - 1]).enumerate() {
            let mut cur_sum = 0.0f64;
            let mut prev_sum = 0.0f64;
            let mut penalty = 0.0f64;
            for (&c, &p) in current.iter().zip(previous) {
                cur_sum += c as f64;
                prev_sum += p as f64;
                penalty += (cur_sum - prev_sum).max(0.0);
            }
            total += penalty * mask[t][b] as f64;
        }
    }
    Ok(total)
}

/// Суммарная энтропия распределений внимания по немаскированным шагам.
pub fn entropy(weights: &Tensor, labels_mask: &Tensor) -> Result<f64> {
    let weights = weights.to_vec3::<f32>()?;
    let mask = labels_mask.to_vec2::<f32>()?;
    let mut total = 0.0f64;
    for (step, mask_row) in weights.iter().zip(&mask) {
        for (row, &m) in step.iter().zip(mask_row) {
            let h: f64 = row
                .iter()
                .map(|&w| -(w as f64) * ((w + ENTROPY_EPS) as f64).ln())
                .sum();
            total += h * m as f64;
        }
    }
    Ok(total)
}

/// Средний по шагам разброс внимания: `sqrt(Σ_j w_j (j − μ)²)`, `μ = Σ_j j·w_j`.
///
/// `weights`: `(L, T)` для одной записи.
pub fn weights_std(weights: &[Vec<f32>]) -> f64 {
    if weights.is_empty() {
        return 0.0;
    }
    let total: f64 = weights
        .iter()
        .map(|row| {
            let mean: f64 = row.iter().enumerate().map(|(j, &w)| j as f64 * w as f64).sum();
            row.iter()
                .enumerate()
                .map(|(j, &w)| w as f64 * (j as f64 - mean).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .sum();
    total / weights.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Веса `(steps, 1, 3)` для одной записи.
    fn tensor3(data: &[[[f32; 3]; 1]]) -> Tensor {
        let flat: Vec<f32> = data.iter().flatten().flatten().copied().collect();
        Tensor::from_vec(flat, (data.len(), 1, 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_monotonic_attention_has_no_penalty() {
        let weights = tensor3(&[[[1.0, 0.0, 0.0]], [[0.0, 1.0, 0.0]], [[0.0, 0.0, 1.0]]]);
        let mask = Tensor::new(&[[1.0f32], [1.0], [1.0]], &Device::Cpu).unwrap();
        assert_eq!(monotonicity_penalty(&weights, &mask).unwrap(), 0.0);
    }

    #[test]
    fn test_backward_jump_is_penalized() {
        // Со второй позиции назад на первую: C = [0,1,1] -> [1,1,1], штраф 1.
        let weights = tensor3(&[[[0.0, 1.0, 0.0]], [[1.0, 0.0, 0.0]]]);
        let mask = Tensor::new(&[[1.0f32], [1.0]], &Device::Cpu).unwrap();
        assert!((monotonicity_penalty(&weights, &mask).unwrap() - 1.0).abs() < 1e-9);

        let masked = Tensor::new(&[[1.0f32], [0.0]], &Device::Cpu).unwrap();
        assert_eq!(monotonicity_penalty(&weights, &masked).unwrap(), 0.0);
    }

    #[test]
    fn test_entropy_values() {
        let weights = tensor3(&[[[1.0, 0.0, 0.0]], [[0.5, 0.5, 0.0]]]);
        let mask = Tensor::new(&[[1.0f32], [1.0]], &Device::Cpu).unwrap();
        let h = entropy(&weights, &mask).unwrap();
        assert!((h - std::f64::consts::LN_2).abs() < 1e-5);

        let uniform = tensor3(&[[[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0]]]);
        let mask = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();
        assert!((entropy(&uniform, &mask).unwrap() - 3.0f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_weights_std() {
        assert_eq!(weights_std(&[vec![0.0, 1.0, 0.0]]), 0.0);
        let spread = weights_std(&[vec![0.5, 0.0, 0.5], vec![0.0, 0.0, 1.0]]);
        assert!((spread - 0.5).abs() < 1e-9);
        assert_eq!(weights_std(&[]), 0.0);
    }
}
