//! Pitch detection using the average squared difference function (ASDF)
//!
//! For a frame `x` of length `N` the ASDF at lag `τ` is
//!
//! ```text
//! d(τ) = Σ (x[i] - x[i + τ])²      for i in 0..N-τ
//!      = E_head(τ) + E_tail(τ) - 2 r(τ)
//! ```
//!
//! where `r` is the linear autocorrelation (computed with a zero-padded FFT)
//! and the two energy terms come from a prefix sum of squares. Dividing by
//! `E_head + E_tail` normalizes the result to `[0, 2]`: a perfectly periodic
//! frame scores 0 at its period, uncorrelated noise scores around 1.
//!
//! The detector picks the global minimum over `[min_period, max_period]`,
//! falls back to the first local minimum that is nearly as deep (this avoids
//! reporting a multiple of the true period), refines it with quadratic
//! interpolation and finally gates it with the confidence threshold.

use crate::error::{AnalysisError, AnalysisResult};
use crate::stage::Stage;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Default lowest detectable frequency
pub const DEFAULT_MIN_HZ: f32 = 80.0;
/// Default highest detectable frequency
pub const DEFAULT_MAX_HZ: f32 = 1000.0;
/// Default maximum normalized ASDF accepted as voiced
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.15;

/// Mean-square level below which a frame counts as silence (-80 dBFS)
const SILENCE_MEAN_SQUARE: f64 = 1e-8;
/// How much shallower than the global minimum an earlier dip may be
const OCTAVE_TOLERANCE: f32 = 0.05;

/// Detector state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorState {
    /// Nothing analyzed since creation or release
    #[default]
    Idle,
    /// A frame is being analyzed
    Analyzing,
    /// The last frame had a reliable period
    Voiced,
    /// The last frame was silent or aperiodic
    Unvoiced,
}

/// Result of analyzing one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchEstimate {
    /// Period in samples (held over from the last voiced frame when unvoiced)
    pub period: f32,
    /// 1.0 for a perfectly periodic frame, 0.0 for no periodicity
    pub confidence: f32,
    /// Whether `period` was measured in this frame
    pub voiced: bool,
}

impl PitchEstimate {
    /// Fundamental frequency implied by `period`
    pub fn frequency(&self, sample_rate: f64) -> f32 {
        if self.period > 0.0 {
            (sample_rate / self.period as f64) as f32
        } else {
            0.0
        }
    }
}

/// Per-frame fundamental period estimator
pub struct PitchDetector {
    sample_rate: f64,
    min_hz: f32,
    max_hz: f32,
    min_period: usize,
    max_period: usize,
    threshold: f32,
    state: DetectorState,
    last_period: Option<f32>,
    /// Longest frame analyzed without reallocating (2 * max_period)
    frame_capacity: usize,
    fft_len: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Prefix sums of squared samples
    energy: Vec<f64>,
    /// Normalized ASDF indexed by lag
    asdf: Vec<f32>,
}

impl PitchDetector {
    /// Create a detector for `sample_rate` searching `[min_hz, max_hz]`
    pub fn new(sample_rate: f64, min_hz: f32, max_hz: f32) -> AnalysisResult<Self> {
        validate_sample_rate(sample_rate)?;
        validate_range(sample_rate, min_hz, max_hz)?;
        let (min_period, max_period) = period_bounds(sample_rate, min_hz, max_hz);

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(1);
        let ifft = planner.plan_fft_inverse(1);

        let mut detector = Self {
            sample_rate,
            min_hz,
            max_hz,
            min_period,
            max_period,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            state: DetectorState::Idle,
            last_period: None,
            frame_capacity: 0,
            fft_len: 1,
            fft,
            ifft,
            spectrum: Vec::new(),
            scratch: Vec::new(),
            energy: Vec::new(),
            asdf: Vec::new(),
        };
        detector.allocate();
        Ok(detector)
    }

    /// Size FFT and scratch buffers for the current `max_period`
    fn allocate(&mut self) {
        let frame_capacity = 2 * self.max_period;
        if frame_capacity <= self.frame_capacity {
            return;
        }

        // Zero padding to at least N + max_lag keeps the circular
        // autocorrelation equal to the linear one over the searched lags
        let fft_len = (2 * frame_capacity).next_power_of_two();
        let mut planner = FftPlanner::new();
        self.fft = planner.plan_fft_forward(fft_len);
        self.ifft = planner.plan_fft_inverse(fft_len);

        let scratch_len = self
            .fft
            .get_inplace_scratch_len()
            .max(self.ifft.get_inplace_scratch_len());

        tracing::debug!(frame_capacity, fft_len, "sized ASDF buffers");
        self.fft_len = fft_len;
        self.frame_capacity = frame_capacity;
        self.spectrum = vec![Complex::new(0.0, 0.0); fft_len];
        self.scratch = vec![Complex::new(0.0, 0.0); scratch_len];
        self.energy = vec![0.0; frame_capacity + 1];
        self.asdf = vec![1.0; self.max_period + 2];
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Current search range in Hz
    pub fn pitch_range(&self) -> (f32, f32) {
        (self.min_hz, self.max_hz)
    }

    /// Shortest period searched, in samples
    pub fn min_period(&self) -> usize {
        self.min_period
    }

    /// Longest period searched, in samples
    pub fn max_period(&self) -> usize {
        self.max_period
    }

    /// Frame length needed to search the whole lag range
    pub fn frame_size(&self) -> usize {
        2 * self.max_period
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.threshold
    }

    /// Last period measured in a voiced frame
    pub fn last_period(&self) -> Option<f32> {
        self.last_period
    }

    /// Change the search range.
    ///
    /// Growing `max_period` past what was allocated reallocates, so callers on
    /// the audio thread must stay within the range the detector was built for.
    pub fn set_pitch_range(&mut self, min_hz: f32, max_hz: f32) -> AnalysisResult<()> {
        validate_range(self.sample_rate, min_hz, max_hz)?;
        self.min_hz = min_hz;
        self.max_hz = max_hz;
        self.update_bounds();
        Ok(())
    }

    /// Change the sample rate, recomputing the lag bounds
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> AnalysisResult<()> {
        validate_sample_rate(sample_rate)?;
        validate_range(sample_rate, self.min_hz, self.max_hz)?;
        self.sample_rate = sample_rate;
        self.last_period = None;
        self.update_bounds();
        Ok(())
    }

    /// Set the largest normalized ASDF minimum still accepted as voiced
    pub fn set_confidence_threshold(&mut self, threshold: f32) -> AnalysisResult<()> {
        if !(0.0..=2.0).contains(&threshold) {
            return Err(AnalysisError::InvalidThreshold(threshold));
        }
        self.threshold = threshold;
        Ok(())
    }

    fn update_bounds(&mut self) {
        let (min_period, max_period) = period_bounds(self.sample_rate, self.min_hz, self.max_hz);
        self.min_period = min_period;
        self.max_period = max_period;
        self.allocate();
        if self.asdf.len() < max_period + 2 {
            self.asdf.resize(max_period + 2, 1.0);
        }
    }

    /// Period reported before any voiced frame was seen
    fn fallback_period(&self) -> f32 {
        let center_hz = (self.min_hz as f64 * self.max_hz as f64).sqrt();
        (self.sample_rate / center_hz) as f32
    }

    fn unvoiced(&mut self) -> PitchEstimate {
        self.state = DetectorState::Unvoiced;
        PitchEstimate {
            period: self.last_period.unwrap_or_else(|| self.fallback_period()),
            confidence: 0.0,
            voiced: false,
        }
    }

    /// Analyze one frame.
    ///
    /// Only the most recent `frame_size()` samples are used. Never allocates.
    pub fn detect(&mut self, frame: &[f32]) -> PitchEstimate {
        self.state = DetectorState::Analyzing;

        let n = frame.len().min(self.frame_size());
        let frame = &frame[frame.len() - n..];
        let min_lag = self.min_period.max(2);
        let max_lag = self.max_period.min(n / 2);
        if max_lag <= min_lag {
            return self.unvoiced();
        }

        self.energy[0] = 0.0;
        for (i, &x) in frame.iter().enumerate() {
            self.energy[i + 1] = self.energy[i] + (x as f64) * (x as f64);
        }
        let total = self.energy[n];
        if !total.is_finite() || total / (n as f64) < SILENCE_MEAN_SQUARE {
            return self.unvoiced();
        }

        self.autocorrelate(frame);

        // Lags one past each end are needed for interpolation
        let lo = min_lag - 1;
        let hi = (max_lag + 1).min(n - 1);
        let scale = 1.0 / self.fft_len as f64;
        for lag in lo..=hi {
            let r = self.spectrum[lag].re as f64 * scale;
            let e = self.energy[n - lag] + (total - self.energy[lag]);
            self.asdf[lag] = if e > f64::EPSILON {
                ((e - 2.0 * r) / e).max(0.0) as f32
            } else {
                1.0
            };
        }

        let mut global_lag = min_lag;
        for lag in min_lag..=max_lag {
            if self.asdf[lag] < self.asdf[global_lag] {
                global_lag = lag;
            }
        }
        let global_min = self.asdf[global_lag];

        let chosen = (min_lag..=max_lag)
            .find(|&lag| {
                let d = self.asdf[lag];
                d <= global_min + OCTAVE_TOLERANCE
                    && d <= self.asdf[lag - 1]
                    && d <= self.asdf[lag + 1]
            })
            .unwrap_or(global_lag);

        let depth = self.asdf[chosen];
        if depth >= self.threshold {
            return self.unvoiced();
        }

        let period = chosen as f32 + self.interpolate(chosen);
        self.last_period = Some(period);
        self.state = DetectorState::Voiced;
        PitchEstimate {
            period,
            confidence: (1.0 - depth).clamp(0.0, 1.0),
            voiced: true,
        }
    }

    /// Linear autocorrelation of `frame` into `spectrum[..].re` (unscaled)
    fn autocorrelate(&mut self, frame: &[f32]) {
        for (i, bin) in self.spectrum.iter_mut().enumerate() {
            *bin = Complex::new(frame.get(i).copied().unwrap_or(0.0), 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);
        for bin in self.spectrum.iter_mut() {
            *bin = Complex::new(bin.norm_sqr(), 0.0);
        }
        self.ifft
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);
    }

    /// Sub-sample offset of the minimum at `lag` from a parabola through its neighbours
    fn interpolate(&self, lag: usize) -> f32 {
        let a = self.asdf[lag - 1];
        let b = self.asdf[lag];
        let c = self.asdf[lag + 1];
        let denom = a - 2.0 * b + c;
        if denom <= f32::EPSILON {
            return 0.0;
        }
        (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
    }
}

impl Stage for PitchDetector {
    type Error = AnalysisError;

    fn prepare(&mut self, sample_rate: f64, _max_block_size: usize) -> AnalysisResult<()> {
        self.set_sample_rate(sample_rate)?;
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.state = DetectorState::Idle;
        self.last_period = None;
    }

    fn name(&self) -> &'static str {
        "PitchDetector"
    }
}

fn validate_sample_rate(sample_rate: f64) -> AnalysisResult<()> {
    if sample_rate.is_finite() && sample_rate > 0.0 {
        Ok(())
    } else {
        Err(AnalysisError::InvalidSampleRate(sample_rate))
    }
}

fn validate_range(sample_rate: f64, min_hz: f32, max_hz: f32) -> AnalysisResult<()> {
    let nyquist = (sample_rate / 2.0) as f32;
    if min_hz.is_finite() && max_hz.is_finite() && min_hz > 0.0 && min_hz < max_hz && max_hz < nyquist
    {
        Ok(())
    } else {
        Err(AnalysisError::InvalidPitchRange {
            min: min_hz,
            max: max_hz,
        })
    }
}

/// (shortest, longest) period in samples for a frequency range
pub fn period_bounds(sample_rate: f64, min_hz: f32, max_hz: f32) -> (usize, usize) {
    let min_period = ((sample_rate / max_hz as f64).floor() as usize).max(2);
    let max_period = ((sample_rate / min_hz as f64).ceil() as usize).max(min_period + 2);
    (min_period, max_period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin() * 0.8)
            .collect()
    }

    #[test]
    fn test_sine_periods_within_one_percent() {
        let sample_rate = 48000.0;
        for freq in [90.0, 220.0, 440.0, 660.0, 950.0] {
            let mut detector =
                PitchDetector::new(sample_rate, DEFAULT_MIN_HZ, DEFAULT_MAX_HZ).unwrap();
            let signal = sine(freq, sample_rate as f32, detector.frame_size() * 4);

            let mut estimate = None;
            for frame in signal.chunks_exact(detector.frame_size()) {
                estimate = Some(detector.detect(frame));
            }
            let estimate = estimate.unwrap();

            let expected = sample_rate as f32 / freq;
            assert!(estimate.voiced, "{} Hz not voiced", freq);
            assert!(
                (estimate.period - expected).abs() / expected < 0.01,
                "{} Hz: expected period {}, got {}",
                freq,
                expected,
                estimate.period
            );
            assert!(estimate.confidence > 0.9);
            assert_eq!(detector.state(), DetectorState::Voiced);
        }
    }

    #[test]
    fn test_harmonic_rich_signal_reports_fundamental() {
        let sample_rate = 44100.0;
        let mut detector = PitchDetector::new(sample_rate, 80.0, 1000.0).unwrap();
        let freq = 200.0;
        let frame: Vec<f32> = (0..detector.frame_size())
            .map(|i| {
                let t = 2.0 * PI * freq * i as f32 / sample_rate as f32;
                0.3 * t.sin() + 0.5 * (2.0 * t).sin() + 0.2 * (3.0 * t).sin()
            })
            .collect();

        let estimate = detector.detect(&frame);
        let expected = sample_rate as f32 / freq;
        assert!(estimate.voiced);
        assert!((estimate.period - expected).abs() / expected < 0.01);
    }

    #[test]
    fn test_silence_is_unvoiced() {
        let mut detector = PitchDetector::new(48000.0, DEFAULT_MIN_HZ, DEFAULT_MAX_HZ).unwrap();
        let silence = vec![0.0; detector.frame_size()];

        let estimate = detector.detect(&silence);
        assert!(!estimate.voiced);
        assert_eq!(estimate.confidence, 0.0);
        assert!(estimate.period.is_finite() && estimate.period > 0.0);
        assert_eq!(detector.state(), DetectorState::Unvoiced);
    }

    #[test]
    fn test_unvoiced_holds_last_period() {
        let sample_rate = 48000.0;
        let mut detector = PitchDetector::new(sample_rate, DEFAULT_MIN_HZ, DEFAULT_MAX_HZ).unwrap();
        let frame = sine(300.0, sample_rate as f32, detector.frame_size());
        let voiced = detector.detect(&frame);
        assert!(voiced.voiced);

        let silence = vec![0.0; detector.frame_size()];
        let held = detector.detect(&silence);
        assert!(!held.voiced);
        assert_eq!(held.period, voiced.period);
    }

    #[test]
    fn test_noise_is_unvoiced() {
        let mut detector = PitchDetector::new(48000.0, DEFAULT_MIN_HZ, DEFAULT_MAX_HZ).unwrap();
        // Deterministic LCG noise
        let mut state = 12345u32;
        let noise: Vec<f32> = (0..detector.frame_size())
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
            })
            .collect();

        assert!(!detector.detect(&noise).voiced);
    }

    #[test]
    fn test_short_frame_does_not_panic() {
        let mut detector = PitchDetector::new(48000.0, DEFAULT_MIN_HZ, DEFAULT_MAX_HZ).unwrap();
        assert!(!detector.detect(&[0.5; 10]).voiced);
        assert!(!detector.detect(&[]).voiced);
    }

    #[test]
    fn test_range_validation() {
        assert!(PitchDetector::new(48000.0, 500.0, 100.0).is_err());
        assert!(PitchDetector::new(48000.0, 0.0, 100.0).is_err());
        assert!(PitchDetector::new(48000.0, 80.0, 30000.0).is_err());
        assert!(PitchDetector::new(0.0, 80.0, 1000.0).is_err());

        let mut detector = PitchDetector::new(48000.0, 80.0, 1000.0).unwrap();
        assert!(detector.set_pitch_range(900.0, 200.0).is_err());
        assert_eq!(detector.pitch_range(), (80.0, 1000.0));
        assert!(detector.set_confidence_threshold(-1.0).is_err());
    }

    #[test]
    fn test_sample_rate_change_recomputes_bounds() {
        let mut detector = PitchDetector::new(48000.0, 100.0, 1000.0).unwrap();
        assert_eq!(detector.max_period(), 480);
        assert_eq!(detector.min_period(), 48);

        detector.set_sample_rate(96000.0).unwrap();
        assert_eq!(detector.max_period(), 960);
        assert_eq!(detector.min_period(), 96);

        let frame = sine(250.0, 96000.0, detector.frame_size());
        let estimate = detector.detect(&frame);
        assert!((estimate.frequency(96000.0) - 250.0).abs() < 2.5);
    }
}
