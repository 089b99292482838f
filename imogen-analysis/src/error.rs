//! Error types for analysis stages

use thiserror::Error;

/// Errors raised while configuring an analysis stage.
///
/// These are only produced at configuration time; per-frame analysis never
/// fails, it degrades to an unvoiced estimate instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(f64),
    #[error("Invalid pitch range: {min} - {max} Hz")]
    InvalidPitchRange { min: f32, max: f32 },
    #[error("Confidence threshold must be within 0.0 - 2.0, got {0}")]
    InvalidThreshold(f32),
}

/// Result type for analysis configuration
pub type AnalysisResult<T> = Result<T, AnalysisError>;
