//! Audio analysis for Imogen
//!
//! Provides the analysis half of the PSOLA pipeline:
//! - Window: Hann coefficients for overlap-add grains
//! - Pitch: ASDF period estimation with confidence gating
//! - Grains: pitch-synchronous grain onset extraction

mod error;
mod grains;
mod pitch;
mod stage;
mod window;

pub use error::{AnalysisError, AnalysisResult};
pub use grains::{GrainExtractor, GrainStrategy, MAX_CANDIDATES};
pub use pitch::{
    period_bounds, DetectorState, PitchDetector, PitchEstimate, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_MAX_HZ, DEFAULT_MIN_HZ,
};
pub use stage::Stage;
pub use window::{compute_window, fill_window, WindowCache};
