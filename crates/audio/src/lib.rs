//! # audio
//!
//! Audio processing module for the phoneme recognizer.
//!
//! This crate handles:
//! - WAV file loading and mono down-mix
//! - Audio resampling to target sample rate (16kHz)
//! - Log-magnitude spectrogram extraction
//! - Per-feature normalization fitted on a reference stream

pub mod loader;
pub mod normalization;
pub mod resample;
pub mod spectrogram;

pub use loader::{load_wav, to_mono};
pub use normalization::{NormalizedStream, Normalization};
pub use resample::Resampler;
pub use spectrogram::LogSpectrogram;
