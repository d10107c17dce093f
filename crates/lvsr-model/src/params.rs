//! Хранилище обучаемых параметров и схемы инициализации.
//!
//! Каждый параметр регистрируется под стабильным точечным именем
//! (`recognizer.generator.attention.preprocess.weight`) вместе с узлом дерева
//! компонентов и ролью. Схема берётся из правил конфигурации: побеждает
//! последнее правило, назначенное самому узлу или его предку.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor, Var};
use lvsr_core::{AsrError, AsrResult, Component, InitConfig, InitScheme, ParamRole};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, StandardNormal};
use tracing::debug;

/// Параметры распознавателя.
pub struct ParamStore {
    vars: BTreeMap<String, Var>,
    init: InitConfig,
    rng: StdRng,
    device: Device,
}

impl ParamStore {
    pub fn new(init: InitConfig, seed: u64, device: &Device) -> Self {
        Self {
            vars: BTreeMap::new(),
            init,
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Создать и инициализировать параметр.
    ///
    /// Возвращает тензор, отслеживаемый autograd.
    pub fn get(
        &mut self,
        name: &str,
        shape: &[usize],
        component: Component,
        role: ParamRole,
    ) -> AsrResult<Tensor> {
        if self.vars.contains_key(name) {
            return Err(AsrError::Model(format!("parameter '{name}' registered twice")));
        }
        let scheme = self.init.resolve(component, role).ok_or_else(|| {
            AsrError::Config(format!(
                "no initialization rule for parameter '{name}' ({component:?}, {role:?})"
            ))
        })?;
        let values = generate(scheme, shape, &mut self.rng)
            .map_err(|e| AsrError::Config(format!("parameter '{name}': {e}")))?;
        debug!("Параметр {name} {shape:?}: {scheme:?}");

        let tensor = Tensor::from_vec(values, shape, &self.device)?;
        let var = Var::from_tensor(&tensor)?;
        let tracked = var.as_tensor().clone();
        self.vars.insert(name.to_string(), var);
        Ok(tracked)
    }

    /// Все параметры, отсортированные по имени.
    pub fn vars(&self) -> Vec<(String, Var)> {
        self.vars
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect()
    }

    pub fn var(&self, name: &str) -> Option<&Var> {
        self.vars.get(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Общее число скалярных параметров.
    pub fn num_elements(&self) -> usize {
        self.vars.values().map(|v| v.as_tensor().elem_count()).sum()
    }
}

/// Сгенерировать значения параметра по схеме.
pub fn generate(scheme: InitScheme, shape: &[usize], rng: &mut StdRng) -> Result<Vec<f32>, String> {
    let count: usize = shape.iter().product();
    match scheme {
        InitScheme::Constant { value } => Ok(vec![value as f32; count]),
        InitScheme::IsotropicGaussian { std } => {
            let normal = Normal::new(0.0, std).map_err(|e| e.to_string())?;
            Ok((0..count).map(|_| normal.sample(rng) as f32).collect())
        }
        InitScheme::Orthogonal => orthogonal(shape, rng),
    }
}

/// Ортогональная матрица `(n, k·n)`: `k` независимых ортогональных блоков `n×n`.
fn orthogonal(shape: &[usize], rng: &mut StdRng) -> Result<Vec<f32>, String> {
    let &[rows, cols] = shape else {
        return Err(format!("orthogonal init needs a matrix, got shape {shape:?}"));
    };
    if rows == 0 || cols % rows != 0 {
        return Err(format!(
            "orthogonal init needs a square matrix or a row of square blocks, got {rows}x{cols}"
        ));
    }

    let n = rows;
    let mut out = vec![0.0f32; rows * cols];
    for block in 0..cols / n {
        let q = random_orthogonal(n, rng);
        for i in 0..n {
            for j in 0..n {
                out[i * cols + block * n + j] = q[i * n + j] as f32;
            }
        }
    }
    Ok(out)
}

/// Случайная ортогональная `n×n` (модифицированный Грам-Шмидт над гауссовой матрицей).
fn random_orthogonal(n: usize, rng: &mut StdRng) -> Vec<f64> {
    loop {
        let mut m: Vec<f64> = (0..n * n).map(|_| StandardNormal.sample(rng)).collect();
        let mut degenerate = false;
        // Столбцы ортонормируются по очереди.
        for j in 0..n {
            for k in 0..j {
                let dot: f64 = (0..n).map(|i| m[i * n + j] * m[i * n + k]).sum();
                for i in 0..n {
                    m[i * n + j] -= dot * m[i * n + k];
                }
            }
            let norm: f64 = (0..n).map(|i| m[i * n + j].powi(2)).sum::<f64>().sqrt();
            if norm < 1e-10 {
                degenerate = true;
                break;
            }
            for i in 0..n {
                m[i * n + j] /= norm;
            }
        }
        if !degenerate {
            return m;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvsr_core::InitRule;

    fn gram(values: &[f32], n: usize, cols: usize, block: usize) -> Vec<f64> {
        let mut g = vec![0.0f64; n * n];
        for a in 0..n {
            for b in 0..n {
                g[a * n + b] = (0..n)
                    .map(|i| {
                        values[i * cols + block * n + a] as f64
                            * values[i * cols + block * n + b] as f64
                    })
                    .sum();
            }
        }
        g
    }

    #[test]
    fn test_orthogonal_blocks() {
        let mut rng = StdRng::seed_from_u64(0);
        let values = generate(InitScheme::Orthogonal, &[4, 12], &mut rng).unwrap();
        for block in 0..3 {
            let g = gram(&values, 4, 12, block);
            for a in 0..4 {
                for b in 0..4 {
                    let expected = if a == b { 1.0 } else { 0.0 };
                    assert!((g[a * 4 + b] - expected).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_orthogonal_rejects_incompatible_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(generate(InitScheme::Orthogonal, &[4, 6], &mut rng).is_err());
        assert!(generate(InitScheme::Orthogonal, &[4], &mut rng).is_err());
    }

    #[test]
    fn test_gaussian_and_constant() {
        let mut rng = StdRng::seed_from_u64(3);
        let values = generate(InitScheme::IsotropicGaussian { std: 0.1 }, &[100, 100], &mut rng)
            .unwrap();
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>()
            / values.len() as f64;
        assert!(mean.abs() < 5e-3);
        assert!((var.sqrt() - 0.1).abs() < 5e-3);

        let values = generate(InitScheme::Constant { value: 0.25 }, &[3], &mut rng).unwrap();
        assert_eq!(values, vec![0.25; 3]);
    }

    #[test]
    fn test_store_resolves_rules() {
        let init = InitConfig {
            rules: vec![
                InitRule {
                    component: Component::Recognizer,
                    role: ParamRole::Weights,
                    scheme: InitScheme::Constant { value: 1.0 },
                },
                InitRule {
                    component: Component::Attention,
                    role: ParamRole::Weights,
                    scheme: InitScheme::Constant { value: 2.0 },
                },
            ],
        };
        let mut store = ParamStore::new(init, 0, &Device::Cpu);
        let w = store
            .get("att.w", &[2, 2], Component::Attention, ParamRole::Weights)
            .unwrap();
        assert_eq!(w.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![2.0; 4]);
        let w = store
            .get("readout.w", &[2], Component::Readout, ParamRole::Weights)
            .unwrap();
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![1.0; 2]);

        // Биасы не покрыты правилами.
        assert!(matches!(
            store.get("readout.b", &[2], Component::Readout, ParamRole::Biases),
            Err(AsrError::Config(_))
        ));
        assert!(store
            .get("att.w", &[2, 2], Component::Attention, ParamRole::Weights)
            .is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_orthogonal_on_wrong_shape_is_config_error() {
        let mut store = ParamStore::new(InitConfig::default(), 0, &Device::Cpu);
        assert!(matches!(
            store.get("rec", &[3, 5], Component::Encoder, ParamRole::RecurrentWeights),
            Err(AsrError::Config(_))
        ));
    }
}
