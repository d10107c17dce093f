//! Attention-based encoder-decoder для распознавания фонем на Candle.
//!
//! Двунаправленный рекуррентный энкодер поверх спектрограммы, декодер с
//! вниманием (content, content+cumsum, hybrid, hybrid2), beam search и
//! чекпоинты в safetensors.

pub mod attention;
pub mod beam_search;
pub mod checkpoint;
pub mod encoder;
pub mod error_rate;
pub mod expressions;
pub mod generator;
pub mod model;
pub mod params;
pub mod recurrent;

pub use attention::{AttendedContext, Attention, AttentionMechanism};
pub use beam_search::{BeamSearch, Hypothesis};
pub use checkpoint::{load_params, save_params};
pub use encoder::{Encoder, EncoderOutput};
pub use error_rate::{edit_distance, phoneme_error_rate};
pub use generator::{CostOutput, DecoderState, GenerationMode, Generated, SequenceGenerator};
pub use model::{Analysis, BatchTensors, PhonemeRecognizer, RecognizerCost};
pub use params::ParamStore;
pub use recurrent::{RecurrentCell, RecurrentState};
