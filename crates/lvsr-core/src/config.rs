//! Конфигурация распознавателя.
//!
//! Конфигурация — строго типизированное дерево структур. Пользовательский
//! JSON-файл накладывается на значения по умолчанию через [`merge_patch`]:
//! неизвестные ключи отклоняются до начала любых вычислений.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AsrError, AsrResult};

/// Полная конфигурация эксперимента.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecognizerConfig {
    /// Форма сети.
    pub net: NetConfig,

    /// Правила инициализации параметров.
    pub initialization: InitConfig,

    /// Гиперпараметры оптимизатора.
    pub optimizer: OptimizerConfig,

    /// Батчинг и нормализация.
    pub data: DataConfig,

    /// Параметры спектрограммы.
    pub features: FeatureExtractorConfig,

    /// Параметры beam search.
    pub search: SearchConfig,

    /// Периодичность мониторинга.
    pub monitoring: MonitoringConfig,

    /// Seed для инициализации весов и сэмплирования.
    pub seed: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            net: NetConfig::default(),
            initialization: InitConfig::default(),
            optimizer: OptimizerConfig::default(),
            data: DataConfig::default(),
            features: FeatureExtractorConfig::default(),
            search: SearchConfig::default(),
            monitoring: MonitoringConfig::default(),
            seed: 1,
        }
    }
}

impl RecognizerConfig {
    /// Наложить JSON-патч на конфигурацию по умолчанию и провалидировать результат.
    pub fn from_patch(patch: &Value) -> AsrResult<Self> {
        let mut base = serde_json::to_value(Self::default())?;
        merge_patch(&mut base, patch)?;
        let config: Self = serde_json::from_value(base)
            .map_err(|e| AsrError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Загрузить патч конфигурации из JSON-файла.
    ///
    /// `None` — конфигурация по умолчанию.
    pub fn load(path: Option<&Path>) -> AsrResult<Self> {
        let Some(path) = path else {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        };
        let content = std::fs::read_to_string(path)?;
        let patch: Value = serde_json::from_str(&content).map_err(|e| {
            AsrError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        Self::from_patch(&patch)
    }

    /// Проверить согласованность значений.
    pub fn validate(&self) -> AsrResult<()> {
        self.net.validate()?;
        self.optimizer.validate()?;
        self.data.validate()?;
        self.features.validate()?;
        self.search.validate()?;
        if self.monitoring.average_every_n_batches == 0 || self.monitoring.print_every_n_batches == 0
        {
            return Err(AsrError::Config(
                "monitoring cadence must be at least one batch".into(),
            ));
        }
        Ok(())
    }
}

/// Наложить `patch` на `base`.
///
/// Объекты сливаются рекурсивно, скаляры и массивы заменяются, массив
/// `initialization.rules` дополняется. Ключ, которого нет в `base`, — ошибка.
pub fn merge_patch(base: &mut Value, patch: &Value) -> AsrResult<()> {
    merge_at(base, patch, "")
}

fn merge_at(base: &mut Value, patch: &Value, path: &str) -> AsrResult<()> {
    let (Value::Object(base_map), Value::Object(patch_map)) = (&mut *base, patch) else {
        return Err(AsrError::Config(format!(
            "expected an object at '{}'",
            if path.is_empty() { "<root>" } else { path }
        )));
    };

    for (key, value) in patch_map {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        let Some(slot) = base_map.get_mut(key) else {
            return Err(AsrError::Config(format!(
                "unknown configuration key '{child_path}'"
            )));
        };

        match (&mut *slot, value) {
            (Value::Object(_), Value::Object(_)) => merge_at(slot, value, &child_path)?,
            (Value::Array(existing), Value::Array(extra)) if child_path == "initialization.rules" => {
                existing.extend(extra.iter().cloned());
            }
            _ => *slot = value.clone(),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Сеть
// ---------------------------------------------------------------------------

/// Тип рекуррентной ячейки.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// `h = tanh(x + h·W)`.
    SimpleRecurrent,
    /// GRU с update/reset гейтами.
    GatedRecurrent,
    /// LSTM (i, f, g, o).
    Lstm,
}

impl TransitionType {
    /// Во сколько раз ширина входной проекции больше размерности состояния.
    pub fn input_multiplier(self) -> usize {
        match self {
            TransitionType::SimpleRecurrent => 1,
            TransitionType::GatedRecurrent => 3,
            TransitionType::Lstm => 4,
        }
    }
}

/// Вариант механизма внимания.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    /// Только content-based энергии.
    Content,
    /// Content + смещение от кумулятивной суммы прошлых весов.
    ContentAndCumsum,
    /// Content + окно сдвигов, предсказанное MLP.
    Hybrid,
    /// Content + непрерывный (гауссов) сдвиг, предсказанный MLP.
    Hybrid2,
}

impl AttentionType {
    /// Нужен ли предиктор сдвига.
    pub fn uses_shift_predictor(self) -> bool {
        matches!(self, AttentionType::Hybrid | AttentionType::Hybrid2)
    }
}

/// Гиперпараметры внимания.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttentionConfig {
    /// Вариант механизма.
    pub kind: AttentionType,

    /// Скрытые слои предиктора сдвига (только hybrid/hybrid2).
    pub shift_predictor_dims: Vec<usize>,

    /// Максимальный сдвиг назад (hybrid).
    pub max_left: usize,

    /// Максимальный сдвиг вперёд (hybrid).
    pub max_right: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            kind: AttentionType::Content,
            shift_predictor_dims: Vec::new(),
            max_left: 0,
            max_right: 0,
        }
    }
}

/// Форма сети.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Размерность состояния декодера.
    pub dim_dec: usize,

    /// Размерность одного направления bidirectional-энкодера.
    pub dim_bidir: usize,

    /// Ширины bottom MLP.
    pub dims_bottom: Vec<usize>,

    /// Ячейка энкодера.
    pub enc_transition: TransitionType,

    /// Ячейка декодера.
    pub dec_transition: TransitionType,

    /// Механизм внимания.
    pub attention: AttentionConfig,

    /// Подавать ли состояние декодера в readout.
    pub use_states_for_readout: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            dim_dec: 100,
            dim_bidir: 100,
            dims_bottom: vec![100],
            enc_transition: TransitionType::SimpleRecurrent,
            dec_transition: TransitionType::SimpleRecurrent,
            attention: AttentionConfig::default(),
            use_states_for_readout: false,
        }
    }
}

impl NetConfig {
    fn validate(&self) -> AsrResult<()> {
        if self.dim_dec == 0 || self.dim_bidir == 0 {
            return Err(AsrError::Config("net dimensions must be positive".into()));
        }
        if self.dims_bottom.contains(&0) {
            return Err(AsrError::Config("net.dims_bottom contains a zero width".into()));
        }
        if self.attention.kind.uses_shift_predictor() {
            if self.attention.shift_predictor_dims.is_empty() {
                return Err(AsrError::Config(format!(
                    "attention '{:?}' requires net.attention.shift_predictor_dims",
                    self.attention.kind
                )));
            }
            if self.attention.shift_predictor_dims.contains(&0) {
                return Err(AsrError::Config(
                    "net.attention.shift_predictor_dims contains a zero width".into(),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Инициализация
// ---------------------------------------------------------------------------

/// Узел дерева компонентов распознавателя.
///
/// Правило инициализации, назначенное узлу, действует на все его потомки.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Recognizer,
    Bottom,
    Encoder,
    Generator,
    Transition,
    Attention,
    Readout,
    Feedback,
}

impl Component {
    /// Родительский узел.
    pub fn parent(self) -> Option<Component> {
        match self {
            Component::Recognizer => None,
            Component::Bottom | Component::Encoder | Component::Generator => {
                Some(Component::Recognizer)
            }
            Component::Transition
            | Component::Attention
            | Component::Readout
            | Component::Feedback => Some(Component::Generator),
        }
    }

    /// `true`, если `self` совпадает с `ancestor` или лежит в его поддереве.
    pub fn is_within(self, ancestor: Component) -> bool {
        let mut current = Some(self);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = node.parent();
        }
        false
    }
}

/// Роль параметра внутри компонента.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    Weights,
    Biases,
    /// Матрицы state→state. Без собственного правила используют `weights`.
    RecurrentWeights,
}

/// Схема инициализации.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitScheme {
    /// Ортогональная матрица (квадратная или из квадратных блоков).
    Orthogonal,
    /// N(0, std²).
    IsotropicGaussian { std: f64 },
    /// Константа.
    Constant { value: f64 },
}

/// Назначение схемы роли параметров в поддереве компонента.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitRule {
    pub component: Component,
    pub role: ParamRole,
    pub scheme: InitScheme,
}

/// Упорядоченный список правил; побеждает последнее подходящее.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitConfig {
    pub rules: Vec<InitRule>,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                InitRule {
                    component: Component::Recognizer,
                    role: ParamRole::Weights,
                    scheme: InitScheme::IsotropicGaussian { std: 0.1 },
                },
                InitRule {
                    component: Component::Recognizer,
                    role: ParamRole::Biases,
                    scheme: InitScheme::Constant { value: 0.0 },
                },
                InitRule {
                    component: Component::Recognizer,
                    role: ParamRole::RecurrentWeights,
                    scheme: InitScheme::Orthogonal,
                },
            ],
        }
    }
}

impl InitConfig {
    /// Найти схему для параметра с ролью `role` в компоненте `component`.
    pub fn resolve(&self, component: Component, role: ParamRole) -> Option<InitScheme> {
        let found = self
            .rules
            .iter()
            .rev()
            .find(|rule| rule.role == role && component.is_within(rule.component))
            .map(|rule| rule.scheme);
        match (found, role) {
            (None, ParamRole::RecurrentWeights) => self.resolve(component, ParamRole::Weights),
            (found, _) => found,
        }
    }
}

// ---------------------------------------------------------------------------
// Оптимизатор, данные, признаки, поиск, мониторинг
// ---------------------------------------------------------------------------

/// Гиперпараметры градиентного спуска.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Порог глобальной нормы градиента.
    pub clip_threshold: f64,

    /// Шаг обучения.
    pub learning_rate: f64,

    /// Коэффициент momentum; `None` — обычный масштабированный градиент.
    pub momentum: Option<f64>,

    /// Значение, которым заменяются неконечные шаги.
    pub not_finite_fallback: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            clip_threshold: 100.0,
            learning_rate: 0.01,
            momentum: None,
            not_finite_fallback: 0.0,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> AsrResult<()> {
        if !(self.clip_threshold > 0.0) {
            return Err(AsrError::Config("optimizer.clip_threshold must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(AsrError::Config("optimizer.learning_rate must be positive".into()));
        }
        if let Some(momentum) = self.momentum {
            if !(0.0..1.0).contains(&momentum) {
                return Err(AsrError::Config("optimizer.momentum must be in [0, 1)".into()));
            }
        }
        if !self.not_finite_fallback.is_finite() {
            return Err(AsrError::Config(
                "optimizer.not_finite_fallback must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Батчинг.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Размер батча; `None` — поток отдельных примеров.
    pub batch_size: Option<usize>,

    /// Сортировать окна из `batch_size * sort_k_batches` примеров по длине.
    pub sort_k_batches: Option<usize>,

    /// Путь к артефакту нормализации.
    pub normalization: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: Some(10),
            sort_k_batches: None,
            normalization: None,
        }
    }
}

impl DataConfig {
    fn validate(&self) -> AsrResult<()> {
        if self.batch_size == Some(0) {
            return Err(AsrError::Config("data.batch_size must be positive".into()));
        }
        match (self.sort_k_batches, self.batch_size) {
            (Some(0), _) => Err(AsrError::Config("data.sort_k_batches must be positive".into())),
            (Some(_), None) => Err(AsrError::Config(
                "data.sort_k_batches requires data.batch_size".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Параметры лог-спектрограммы.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureExtractorConfig {
    /// Целевая частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Размер окна FFT.
    pub n_fft: usize,

    /// Шаг между фреймами.
    pub hop_length: usize,
}

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 256,
            hop_length: 128,
        }
    }
}

impl FeatureExtractorConfig {
    /// Число признаков на фрейм (`n_fft / 2 + 1`).
    pub fn num_features(&self) -> usize {
        self.n_fft / 2 + 1
    }

    fn validate(&self) -> AsrResult<()> {
        if self.n_fft < 2 || self.hop_length == 0 || self.sample_rate == 0 {
            return Err(AsrError::Config("invalid feature extractor parameters".into()));
        }
        Ok(())
    }
}

/// Параметры beam search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    /// Ширина луча.
    pub beam_size: usize,

    /// Лимит шагов = число входных фреймов / `length_divisor`.
    pub length_divisor: usize,

    /// Не замораживать гипотезу на конце последовательности, выданном на первом шаге.
    pub ignore_first_eol: bool,

    /// Сколько кандидатов на гипотезу (в единицах `beam_size`) рассматривать.
    pub overgeneration: usize,

    /// Допуск при сверке стоимости луча с teacher-forced пересчётом.
    pub consistency_rtol: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            beam_size: 10,
            length_divisor: 3,
            ignore_first_eol: true,
            overgeneration: 2,
            consistency_rtol: 1e-5,
        }
    }
}

impl SearchConfig {
    fn validate(&self) -> AsrResult<()> {
        if self.beam_size == 0 || self.length_divisor == 0 || self.overgeneration == 0 {
            return Err(AsrError::Config(
                "search.beam_size, search.length_divisor and search.overgeneration must be positive"
                    .into(),
            ));
        }
        if !(self.consistency_rtol > 0.0) {
            return Err(AsrError::Config("search.consistency_rtol must be positive".into()));
        }
        Ok(())
    }
}

/// Периодичность мониторинга.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    /// Усреднять наблюдаемые величины каждые N батчей.
    pub average_every_n_batches: usize,

    /// Печатать текущую строку лога каждые N батчей.
    pub print_every_n_batches: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            average_every_n_batches: 10,
            print_every_n_batches: 1,
        }
    }
}
