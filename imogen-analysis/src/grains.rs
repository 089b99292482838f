//! Pitch-synchronous grain onset extraction
//!
//! Grains are two half-grains long and centred on one pitch mark per period.
//! The extractor walks the buffer one period at a time: it predicts the next
//! mark from the previous one, searches a small window around the prediction
//! and keeps the candidate whose spacing best matches both the previous
//! spacing and the ideal period. Onsets are reported as grain start indices
//! (`mark - half_grain`), so every reported grain lies entirely inside the
//! analyzed buffer.

use crate::stage::Stage;
use std::convert::Infallible;

/// Most candidates scored per period
pub const MAX_CANDIDATES: usize = 8;

/// Candidate window half-width as a fraction of the period
const CANDIDATE_RADIUS: f32 = 0.25;
/// Candidates weaker than this fraction of the strongest one are ignored
const CANDIDATE_RATIO: f32 = 0.5;
/// Squared amplitude below which a segment counts as silent (-60 dBFS)
const POWER_FLOOR: f32 = 1e-6;

/// How pitch marks are placed within each period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrainStrategy {
    /// Signal peaks with spacing-consistency scoring
    #[default]
    PeakPicking,
    /// Rising zero crossing nearest the prediction (cheaper)
    ZeroCrossing,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    amplitude: f32,
}

/// Locates grain onsets synchronized to a period estimate
pub struct GrainExtractor {
    strategy: GrainStrategy,
    onsets: Vec<usize>,
    max_onsets: usize,
    half_grain: usize,
}

impl GrainExtractor {
    /// Create an extractor for buffers up to `max_len` samples and periods of
    /// at least `min_period` samples
    pub fn new(max_len: usize, min_period: usize) -> Self {
        let max_onsets = max_len / (min_period / 2).max(1) + 2;
        Self {
            strategy: GrainStrategy::default(),
            onsets: Vec::with_capacity(max_onsets),
            max_onsets,
            half_grain: 0,
        }
    }

    pub fn strategy(&self) -> GrainStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: GrainStrategy) {
        self.strategy = strategy;
    }

    /// Onsets from the last extraction, strictly increasing
    pub fn onsets(&self) -> &[usize] {
        &self.onsets
    }

    /// Half the grain length used by the last extraction
    pub fn half_grain(&self) -> usize {
        self.half_grain
    }

    /// Length of every grain from the last extraction
    pub fn grain_length(&self) -> usize {
        2 * self.half_grain
    }

    /// Onset closest to `target`
    pub fn nearest_onset(&self, target: usize) -> Option<usize> {
        match self.onsets.binary_search(&target) {
            Ok(i) => Some(self.onsets[i]),
            Err(i) => {
                let after = self.onsets.get(i).copied();
                let before = i.checked_sub(1).map(|j| self.onsets[j]);
                match (before, after) {
                    (Some(b), Some(a)) => Some(if target - b <= a - target { b } else { a }),
                    (b, a) => b.or(a),
                }
            }
        }
    }

    /// Compute grain onsets for `samples` at `period` samples per cycle.
    ///
    /// Returns an empty set if the buffer cannot hold a single grain.
    pub fn extract(&mut self, samples: &[f32], period: f32) -> &[usize] {
        self.onsets.clear();
        if !period.is_finite() || period < 2.0 {
            return &self.onsets;
        }

        let len = samples.len();
        let half = period.round() as usize;
        self.half_grain = half;
        if len < 2 * half + 1 {
            return &self.onsets;
        }

        let max_mark = len - half;
        let radius = ((period * CANDIDATE_RADIUS).round() as usize).max(1);
        let (first, polarity) = self.anchor(samples, half, max_mark, period);
        self.onsets.push(first - half);

        let mut prev_mark = first;
        let mut prev_spacing = period;
        while self.onsets.len() < self.max_onsets {
            let predicted = (prev_mark as f32 + period).round() as usize;
            if predicted > max_mark {
                break;
            }
            let lo = predicted.saturating_sub(radius).max(prev_mark + 1);
            let hi = (predicted + radius).min(max_mark);

            let mark = match self.strategy {
                GrainStrategy::PeakPicking => self.pick_peak(
                    samples,
                    lo,
                    hi,
                    polarity,
                    prev_mark,
                    prev_spacing,
                    period,
                ),
                GrainStrategy::ZeroCrossing => nearest_rising_crossing(samples, lo, hi, predicted),
            }
            .unwrap_or(predicted);

            self.onsets.push(mark - half);
            prev_spacing = (mark - prev_mark) as f32;
            prev_mark = mark;
        }

        &self.onsets
    }

    /// First pitch mark and the polarity later peaks must match
    fn anchor(&self, samples: &[f32], half: usize, max_mark: usize, period: f32) -> (usize, f32) {
        let end = (half + period.ceil() as usize).min(max_mark);
        match self.strategy {
            GrainStrategy::PeakPicking => {
                // Positive peaks are preferred; negative only if nothing rises above the floor
                for polarity in [1.0, -1.0] {
                    let mut best = half;
                    for i in half..=end {
                        if polarity * samples[i] > polarity * samples[best] {
                            best = i;
                        }
                    }
                    let x = polarity * samples[best];
                    if x > 0.0 && x * x >= POWER_FLOOR {
                        return (best, polarity);
                    }
                }
                (half, 1.0)
            }
            GrainStrategy::ZeroCrossing => {
                let mark = (half.max(1)..=end)
                    .find(|&i| samples[i - 1] < 0.0 && samples[i] >= 0.0)
                    .unwrap_or(half);
                (mark, 1.0)
            }
        }
    }

    /// Best peak in `[lo, hi]`, or `None` if the segment is silent
    #[allow(clippy::too_many_arguments)]
    fn pick_peak(
        &self,
        samples: &[f32],
        lo: usize,
        hi: usize,
        polarity: f32,
        prev_mark: usize,
        prev_spacing: f32,
        period: f32,
    ) -> Option<usize> {
        let mut candidates = [Candidate {
            index: 0,
            amplitude: 0.0,
        }; MAX_CANDIDATES];
        let mut count = 0;
        let mut strongest = lo;

        for i in lo..=hi {
            let x = polarity * samples[i];
            if x > polarity * samples[strongest] {
                strongest = i;
            }
            let left = i.checked_sub(1).map_or(f32::MIN, |j| polarity * samples[j]);
            let right = samples.get(i + 1).map_or(f32::MIN, |&s| polarity * s);
            if x >= left && x >= right && x > 0.0 && x * x >= POWER_FLOOR {
                insert_candidate(&mut candidates, &mut count, Candidate { index: i, amplitude: x });
            }
        }

        // A monotonic window has no interior maximum; fall back to its edge
        if count == 0 {
            let x = polarity * samples[strongest];
            if x <= 0.0 || x * x < POWER_FLOOR {
                return None;
            }
            return Some(strongest);
        }

        let loudest = candidates[0].amplitude;
        let mut best: Option<(Candidate, f32)> = None;
        for candidate in &candidates[..count] {
            if candidate.amplitude < loudest * CANDIDATE_RATIO {
                continue;
            }
            let spacing = (candidate.index - prev_mark) as f32;
            let deviation = (spacing - prev_spacing).abs() + (spacing - period).abs();
            let better = match best {
                None => true,
                Some((current, current_dev)) => {
                    if (deviation - current_dev).abs() > 1e-6 {
                        deviation < current_dev
                    } else if candidate.amplitude != current.amplitude {
                        candidate.amplitude > current.amplitude
                    } else {
                        candidate.index < current.index
                    }
                }
            };
            if better {
                best = Some((*candidate, deviation));
            }
        }

        best.map(|(candidate, _)| candidate.index)
    }
}

/// Keep the loudest `MAX_CANDIDATES`, sorted loudest first
fn insert_candidate(
    candidates: &mut [Candidate; MAX_CANDIDATES],
    count: &mut usize,
    candidate: Candidate,
) {
    let mut pos = *count;
    while pos > 0 && candidates[pos - 1].amplitude < candidate.amplitude {
        pos -= 1;
    }
    if pos >= MAX_CANDIDATES {
        return;
    }
    let last = (*count).min(MAX_CANDIDATES - 1);
    for j in (pos..last).rev() {
        candidates[j + 1] = candidates[j];
    }
    candidates[pos] = candidate;
    *count = (*count + 1).min(MAX_CANDIDATES);
}

/// Rising zero crossing in `[lo, hi]` closest to `predicted`
fn nearest_rising_crossing(samples: &[f32], lo: usize, hi: usize, predicted: usize) -> Option<usize> {
    let is_crossing = |i: usize| i >= 1 && samples[i - 1] < 0.0 && samples[i] >= 0.0;
    let reach = (predicted - lo).max(hi - predicted);
    for d in 0..=reach {
        if predicted >= lo + d && is_crossing(predicted - d) {
            return Some(predicted - d);
        }
        if predicted + d <= hi && is_crossing(predicted + d) {
            return Some(predicted + d);
        }
    }
    None
}

impl Stage for GrainExtractor {
    type Error = Infallible;

    fn prepare(&mut self, _sample_rate: f64, max_block_size: usize) -> Result<(), Infallible> {
        self.release();
        let needed = max_block_size / 2 + 2;
        if needed > self.max_onsets {
            self.onsets.reserve(needed);
            self.max_onsets = needed;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.onsets.clear();
        self.half_grain = 0;
    }

    fn name(&self) -> &'static str {
        "GrainExtractor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(period: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * i as f32 / period).sin() * 0.7)
            .collect()
    }

    fn assert_valid(onsets: &[usize], len: usize, grain: usize) {
        assert!(!onsets.is_empty());
        for pair in onsets.windows(2) {
            assert!(pair[0] < pair[1], "onsets not increasing: {:?}", pair);
        }
        for &onset in onsets {
            assert!(onset < len);
            assert!(onset + grain <= len, "grain at {} overruns {}", onset, len);
        }
    }

    #[test]
    fn test_sine_onsets_follow_period() {
        let period = 109.09;
        let samples = sine(period, 2400);
        let mut extractor = GrainExtractor::new(2400, 48);

        let onsets = extractor.extract(&samples, period).to_vec();
        assert_valid(&onsets, samples.len(), extractor.grain_length());

        for pair in onsets.windows(2) {
            let spacing = (pair[1] - pair[0]) as f32;
            assert!((spacing - period).abs() <= 2.0, "spacing {}", spacing);
        }
        // Grain centres sit on positive peaks
        let half = extractor.half_grain();
        for &onset in &onsets {
            assert!(samples[onset + half] > 0.69);
        }
    }

    #[test]
    fn test_zero_crossing_strategy() {
        let period = 80.0;
        let samples = sine(period, 1600);
        let mut extractor = GrainExtractor::new(1600, 40);
        extractor.set_strategy(GrainStrategy::ZeroCrossing);

        let onsets = extractor.extract(&samples, period).to_vec();
        assert_valid(&onsets, samples.len(), extractor.grain_length());

        let half = extractor.half_grain();
        for &onset in &onsets {
            let centre = onset + half;
            assert!(samples[centre - 1] < 0.0 && samples[centre] >= 0.0);
        }
    }

    #[test]
    fn test_silence_uses_predicted_grid() {
        let samples = vec![0.0; 1000];
        let mut extractor = GrainExtractor::new(1000, 20);

        let onsets = extractor.extract(&samples, 100.0).to_vec();
        assert_valid(&onsets, samples.len(), extractor.grain_length());
        assert_eq!(onsets[0], 0);
        for pair in onsets.windows(2) {
            assert_eq!(pair[1] - pair[0], 100);
        }
    }

    #[test]
    fn test_onsets_in_bounds_for_many_periods() {
        let mut extractor = GrainExtractor::new(2000, 10);
        for &(period, len) in &[(10.0, 200), (33.3, 2000), (55.5, 901), (250.0, 1000), (499.0, 1000)]
        {
            let samples: Vec<f32> = sine(period, len)
                .iter()
                .enumerate()
                .map(|(i, s)| s * (1.0 + 0.3 * (i as f32 * 0.013).sin()))
                .collect();
            for strategy in [GrainStrategy::PeakPicking, GrainStrategy::ZeroCrossing] {
                extractor.set_strategy(strategy);
                let onsets = extractor.extract(&samples, period).to_vec();
                assert_valid(&onsets, len, extractor.grain_length());
            }
        }
    }

    #[test]
    fn test_buffer_too_short() {
        let mut extractor = GrainExtractor::new(100, 10);
        assert!(extractor.extract(&[0.1; 50], 30.0).is_empty());
        assert!(extractor.extract(&[0.1; 50], f32::NAN).is_empty());
    }

    #[test]
    fn test_nearest_onset() {
        let samples = vec![0.0; 1000];
        let mut extractor = GrainExtractor::new(1000, 20);
        extractor.extract(&samples, 100.0);

        assert_eq!(extractor.nearest_onset(0), Some(0));
        assert_eq!(extractor.nearest_onset(149), Some(100));
        assert_eq!(extractor.nearest_onset(151), Some(200));
        assert_eq!(extractor.nearest_onset(5000), extractor.onsets().last().copied());
    }

    #[test]
    fn test_candidate_insertion_keeps_loudest() {
        let mut candidates = [Candidate {
            index: 0,
            amplitude: 0.0,
        }; MAX_CANDIDATES];
        let mut count = 0;
        for i in 0..20 {
            let amplitude = ((i * 7) % 20) as f32;
            insert_candidate(&mut candidates, &mut count, Candidate { index: i, amplitude });
        }
        assert_eq!(count, MAX_CANDIDATES);
        assert_eq!(candidates[0].amplitude, 19.0);
        for pair in candidates.windows(2) {
            assert!(pair[0].amplitude >= pair[1].amplitude);
        }
    }
}
