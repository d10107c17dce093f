//! Сохранение и загрузка параметров в safetensors.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use candle_core::{Tensor, Var};
use lvsr_core::{AsrError, AsrResult};
use tracing::info;

/// Записать параметры в файл safetensors.
pub fn save_params(params: &[(String, Var)], path: &Path) -> AsrResult<()> {
    let tensors: HashMap<String, Tensor> = params
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path)
        .map_err(|e| AsrError::Checkpoint(format!("cannot save {}: {e}", path.display())))?;
    info!("Сохранено {} тензоров в {}", params.len(), path.display());
    Ok(())
}

/// Загрузить параметры.
///
/// Набор имён, формы и типы проверяются целиком до присваивания: при любом
/// несовпадении ни один параметр не меняется.
pub fn load_params(params: &[(String, Var)], path: &Path) -> AsrResult<()> {
    let Some((_, first)) = params.first() else {
        return Err(AsrError::Checkpoint("no parameters to load into".into()));
    };
    let device = first.device().clone();
    let mut loaded = candle_core::safetensors::load(path, &device)
        .map_err(|e| AsrError::Checkpoint(format!("cannot read {}: {e}", path.display())))?;

    let expected: BTreeSet<&str> = params.iter().map(|(name, _)| name.as_str()).collect();
    let unexpected: Vec<&String> = loaded
        .keys()
        .filter(|name| !expected.contains(name.as_str()))
        .collect();
    if !unexpected.is_empty() {
        return Err(AsrError::Checkpoint(format!(
            "unexpected parameters in checkpoint: {unexpected:?}"
        )));
    }

    let mut assignments = Vec::with_capacity(params.len());
    for (name, var) in params {
        let tensor = loaded
            .remove(name)
            .ok_or_else(|| AsrError::Checkpoint(format!("missing parameter {name}")))?;
        if tensor.dims() != var.dims() {
            return Err(AsrError::Checkpoint(format!(
                "shape mismatch for {name}: checkpoint {:?}, model {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        if tensor.dtype() != var.dtype() {
            return Err(AsrError::Checkpoint(format!(
                "dtype mismatch for {name}: checkpoint {:?}, model {:?}",
                tensor.dtype(),
                var.dtype()
            )));
        }
        assignments.push((var, tensor));
    }
    for (var, tensor) in assignments {
        var.set(&tensor)?;
    }
    info!("Загружено {} тензоров из {}", params.len(), path.display());
    Ok(())
}
