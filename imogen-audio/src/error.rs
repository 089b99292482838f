//! Error types for the harmonizer engine

use imogen_analysis::AnalysisError;
use thiserror::Error;

/// Ring buffer read failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Requested {requested} samples but only {available} are available")]
    Underflow { requested: usize, available: usize },
}

/// Note numbers outside the MIDI range
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteError {
    #[error("MIDI note out of range: {0}")]
    OutOfRange(u8),
}

/// Configuration errors reported by `prepare` and the control handle.
///
/// Nothing on the audio path returns these; per-block problems are absorbed
/// and counted in `RenderStats`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f64),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),
    #[error("Voice count must be within 1 - {max}, got {count}")]
    InvalidVoiceCount { count: usize, max: usize },
    #[error("Grains per voice must be within 2 - {max}, got {count}")]
    InvalidGrainCount { count: usize, max: usize },
    #[error("Invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f32 },
    #[error("Command queue full")]
    QueueFull,
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Result type for engine configuration
pub type EngineResult<T> = Result<T, EngineError>;
