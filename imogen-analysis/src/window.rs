//! Hann window generation for overlap-add grains

use std::f32::consts::PI;

/// Compute a symmetric Hann window of `length` coefficients.
///
/// `c[i] = 0.5 - 0.5 * cos(2πi / (length - 1))`, so both endpoints are zero.
/// A length of 1 yields `[1.0]`.
pub fn compute_window(length: usize) -> Vec<f32> {
    let mut window = vec![0.0; length];
    fill_window(&mut window);
    window
}

/// Fill `window` in place with Hann coefficients for its length
pub fn fill_window(window: &mut [f32]) {
    let length = window.len();
    match length {
        0 => return,
        1 => {
            window[0] = 1.0;
            return;
        }
        _ => {}
    }

    let denom = (length - 1) as f32;
    for (i, c) in window.iter_mut().enumerate() {
        *c = 0.5 - 0.5 * (2.0 * PI * i as f32 / denom).cos();
    }
}

/// Window coefficients cached by length.
///
/// Storage is reserved up front so switching lengths inside the audio callback
/// never reallocates as long as the length stays within `max_length`.
#[derive(Debug, Clone)]
pub struct WindowCache {
    coefficients: Vec<f32>,
    max_length: usize,
}

impl WindowCache {
    /// Create a cache able to hold windows up to `max_length` samples
    pub fn new(max_length: usize) -> Self {
        Self {
            coefficients: Vec::with_capacity(max_length),
            max_length,
        }
    }

    /// Largest length served without reallocating
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Length of the currently cached window
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Get the window for `length`, recomputing only if the length changed.
    ///
    /// Lengths above `max_length` are clamped.
    pub fn get(&mut self, length: usize) -> &[f32] {
        let length = length.min(self.max_length);
        if length != self.coefficients.len() {
            self.coefficients.resize(length, 0.0);
            fill_window(&mut self.coefficients);
        }
        &self.coefficients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_are_zero() {
        for length in [2, 3, 16, 101, 1024] {
            let w = compute_window(length);
            assert!(w[0].abs() < 1e-7, "start of {} not zero", length);
            assert!(w[length - 1].abs() < 1e-6, "end of {} not zero", length);
        }
    }

    #[test]
    fn test_symmetry() {
        for length in [5, 64, 255] {
            let w = compute_window(length);
            for i in 0..length {
                assert!(
                    (w[i] - w[length - 1 - i]).abs() < 1e-6,
                    "asymmetric at {} for length {}",
                    i,
                    length
                );
            }
        }
    }

    #[test]
    fn test_odd_length_peaks_at_one() {
        let w = compute_window(9);
        assert!((w[4] - 1.0).abs() < 1e-6);
        assert!(w.iter().all(|&c| (0.0..=1.0).contains(&c)));
    }

    #[test]
    fn test_degenerate_lengths() {
        assert!(compute_window(0).is_empty());
        assert_eq!(compute_window(1), vec![1.0]);
    }

    #[test]
    fn test_cache_recomputes_on_length_change() {
        let mut cache = WindowCache::new(512);
        let capacity = cache.coefficients.capacity();

        assert_eq!(cache.get(100).len(), 100);
        assert_eq!(cache.get(100), compute_window(100).as_slice());
        assert_eq!(cache.get(300), compute_window(300).as_slice());
        assert_eq!(cache.get(2000).len(), 512);

        // No reallocation while within max_length
        assert_eq!(cache.coefficients.capacity(), capacity);
    }
}
