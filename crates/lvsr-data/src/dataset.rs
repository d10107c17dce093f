//! Наборы размеченных примеров.

use std::path::{Path, PathBuf};

use audio::load_wav;
use lvsr_core::{AsrError, AsrResult, Example, PhonemeAlphabet, Recording};
use serde::Deserialize;
use tracing::info;

/// Индексируемый набор примеров.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Загрузить пример `index`.
    fn get(&self, index: usize) -> AsrResult<Example>;
}

impl<D: Dataset + ?Sized> Dataset for Box<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> AsrResult<Example> {
        (**self).get(index)
    }
}

/// Примеры, целиком лежащие в памяти.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    examples: Vec<Example>,
}

impl InMemoryDataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> AsrResult<Example> {
        self.examples
            .get(index)
            .cloned()
            .ok_or_else(|| AsrError::Data(format!("example index {index} out of range")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    utterances: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    id: String,
    audio: PathBuf,
    phonemes: Vec<String>,
}

/// Корпус, описанный JSON-манифестом.
///
/// ```json
/// {"utterances": [{"id": "si1", "audio": "wav/si1.wav", "phonemes": ["h#", "sh", "iy", "h#"]}]}
/// ```
///
/// Пути к аудио считаются относительно каталога манифеста. WAV читается лениво.
#[derive(Debug, Clone)]
pub struct ManifestDataset {
    root: PathBuf,
    entries: Vec<ManifestEntry>,
    alphabet: PhonemeAlphabet,
}

impl ManifestDataset {
    pub fn open(path: impl AsRef<Path>, alphabet: PhonemeAlphabet) -> AsrResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| AsrError::Data(format!("invalid manifest {}: {e}", path.display())))?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        info!(
            "Манифест {}: {} высказываний",
            path.display(),
            manifest.utterances.len()
        );
        Ok(Self {
            root,
            entries: manifest.utterances,
            alphabet,
        })
    }

    pub fn alphabet(&self) -> &PhonemeAlphabet {
        &self.alphabet
    }
}

impl Dataset for ManifestDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> AsrResult<Example> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| AsrError::Data(format!("utterance index {index} out of range")))?;
        let labels = self
            .alphabet
            .encode(&entry.phonemes)
            .map_err(|e| AsrError::Data(format!("utterance '{}': {e}", entry.id)))?;
        let buffer = load_wav(self.root.join(&entry.audio))?;
        Ok(Example {
            id: entry.id.clone(),
            recording: Recording::Waveform(buffer),
            labels,
        })
    }
}
