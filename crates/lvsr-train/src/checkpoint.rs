//! Каталог чекпоинта: `params.safetensors` + `state.json`.

use std::fs;
use std::path::{Path, PathBuf};

use lvsr_core::{AsrError, AsrResult, RecognizerConfig};
use lvsr_model::{load_params, save_params, PhonemeRecognizer};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::log::TrainingLog;

pub const PARAMS_FILE: &str = "params.safetensors";
pub const STATE_FILE: &str = "state.json";

/// Состояние цикла, сохраняемое рядом с параметрами.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub config: RecognizerConfig,
    pub log: TrainingLog,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn params_path(&self) -> PathBuf {
        self.dir.join(PARAMS_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn exists(&self) -> bool {
        self.params_path().is_file() && self.state_path().is_file()
    }

    /// Сохранить параметры и состояние.
    ///
    /// Файлы пишутся во временные и затем переименовываются, чтобы прерванная
    /// запись не портила предыдущий чекпоинт.
    pub fn save(
        &self,
        recognizer: &PhonemeRecognizer,
        config: &RecognizerConfig,
        log: &TrainingLog,
    ) -> AsrResult<()> {
        fs::create_dir_all(&self.dir)?;
        let params_tmp = self.dir.join(format!("{PARAMS_FILE}.tmp"));
        let state_tmp = self.dir.join(format!("{STATE_FILE}.tmp"));

        save_params(&recognizer.params(), &params_tmp)?;
        let state = CheckpointState {
            config: config.clone(),
            log: log.clone(),
        };
        fs::write(&state_tmp, serde_json::to_string_pretty(&state)?)?;

        fs::rename(&params_tmp, self.params_path())?;
        fs::rename(&state_tmp, self.state_path())?;
        info!(
            "Чекпоинт {}: {} итераций, {} эпох",
            self.dir.display(),
            log.status.iterations_done,
            log.status.epochs_done
        );
        Ok(())
    }

    pub fn load_state(&self) -> AsrResult<CheckpointState> {
        let path = self.state_path();
        let text = fs::read_to_string(&path).map_err(|e| {
            AsrError::Checkpoint(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| AsrError::Checkpoint(format!("invalid {}: {e}", path.display())))
    }

    /// Загрузить параметры в `recognizer` и вернуть сохранённое состояние.
    pub fn restore(&self, recognizer: &PhonemeRecognizer) -> AsrResult<CheckpointState> {
        let state = self.load_state()?;
        load_params(&recognizer.params(), &self.params_path())?;
        Ok(state)
    }
}
