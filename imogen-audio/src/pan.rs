//! Constant-power stereo panning driven by MIDI pan values

use std::f32::consts::FRAC_PI_2;

/// Centre position on the 0-127 scale
pub const PAN_CENTER: u8 = 64;
/// Hard right
pub const PAN_MAX: u8 = 127;

/// Constant-power gain pair for a MIDI pan value.
///
/// The pan angle runs from 0 (hard left) to 90 degrees (hard right), so
/// `left² + right² == 1` across the whole range.
pub fn pan_gains(value: u8) -> (f32, f32) {
    let angle = value.min(PAN_MAX) as f32 / PAN_MAX as f32 * FRAC_PI_2;
    (angle.cos().clamp(0.0, 1.0), angle.sin().clamp(0.0, 1.0))
}

/// Pan position of one voice.
///
/// Keeps the previous gain pair so a change is crossfaded over the next block
/// instead of stepping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanState {
    value: u8,
    left: f32,
    right: f32,
    prev_left: f32,
    prev_right: f32,
}

impl Default for PanState {
    fn default() -> Self {
        Self::new(PAN_CENTER)
    }
}

impl PanState {
    pub fn new(value: u8) -> Self {
        let value = value.min(PAN_MAX);
        let (left, right) = pan_gains(value);
        Self {
            value,
            left,
            right,
            prev_left: left,
            prev_right: right,
        }
    }

    /// Current pan value (0-127)
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Current `(left, right)` gains
    pub fn gains(&self) -> (f32, f32) {
        (self.left, self.right)
    }

    /// Gains in effect before the last change
    pub fn previous_gains(&self) -> (f32, f32) {
        (self.prev_left, self.prev_right)
    }

    /// Set the pan value, clamped to 0-127.
    ///
    /// Returns `false` and leaves both gain pairs untouched if the value is
    /// unchanged.
    pub fn set_pan(&mut self, value: u8) -> bool {
        let value = value.min(PAN_MAX);
        if value == self.value {
            return false;
        }
        self.prev_left = self.left;
        self.prev_right = self.right;
        let (left, right) = pan_gains(value);
        self.left = left;
        self.right = right;
        self.value = value;
        true
    }

    /// Jump straight to `value` without a crossfade
    pub fn reset(&mut self, value: u8) {
        *self = Self::new(value);
    }

    /// Whether a crossfade is still pending
    pub fn is_ramping(&self) -> bool {
        self.prev_left != self.left || self.prev_right != self.right
    }

    /// Add `mono` into interleaved stereo `output`, crossfading linearly from
    /// the previous gains to the current ones across the block.
    ///
    /// The crossfade completes within one call.
    pub fn mix_into(&mut self, mono: &[f32], output: &mut [f32]) {
        let frames = mono.len().min(output.len() / 2);
        if frames == 0 {
            return;
        }

        if !self.is_ramping() {
            for (frame, &x) in output.chunks_exact_mut(2).zip(&mono[..frames]) {
                frame[0] += x * self.left;
                frame[1] += x * self.right;
            }
            return;
        }

        let step = 1.0 / frames as f32;
        for (i, (frame, &x)) in output.chunks_exact_mut(2).zip(&mono[..frames]).enumerate() {
            let t = (i + 1) as f32 * step;
            let left = self.prev_left + (self.left - self.prev_left) * t;
            let right = self.prev_right + (self.right - self.prev_right) * t;
            frame[0] += x * left;
            frame[1] += x * right;
        }
        self.prev_left = self.left;
        self.prev_right = self.right;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extremes_and_centre() {
        let (l, r) = pan_gains(0);
        assert!((l - 1.0).abs() < 1e-6);
        assert!(r.abs() < 1e-6);

        let (l, r) = pan_gains(127);
        assert!(l.abs() < 1e-6);
        assert!((r - 1.0).abs() < 1e-6);

        let (l, r) = pan_gains(64);
        assert!((l - 0.707).abs() < 0.01);
        assert!((r - 0.707).abs() < 0.01);
    }

    #[test]
    fn test_constant_power() {
        for value in 0..=127u8 {
            let (l, r) = pan_gains(value);
            assert!((l * l + r * r - 1.0).abs() < 1e-5, "value {}", value);
        }
    }

    #[test]
    fn test_unchanged_value_is_noop() {
        let mut pan = PanState::new(64);
        assert!(pan.set_pan(30));
        let before = pan;
        assert!(!pan.set_pan(30));
        assert_eq!(pan, before);
        assert_eq!(pan.previous_gains(), pan_gains(64));
    }

    #[test]
    fn test_out_of_range_clamps() {
        let mut pan = PanState::new(200);
        assert_eq!(pan.value(), 127);
        assert!(!pan.set_pan(255));
    }

    #[test]
    fn test_mix_crossfades_then_settles() {
        let mut pan = PanState::new(0);
        pan.set_pan(127);
        let mono = [1.0f32; 4];
        let mut out = [0.0f32; 8];
        pan.mix_into(&mono, &mut out);

        // Left falls and right rises across the block
        assert!(out[0] > out[2] && out[2] > out[4]);
        assert!(out[1] < out[3] && out[3] < out[5]);
        assert!((out[7] - 1.0).abs() < 1e-6);
        assert!(!pan.is_ramping());

        let mut out = [0.0f32; 8];
        pan.mix_into(&mono, &mut out);
        assert!(out.chunks(2).all(|f| f[0].abs() < 1e-6 && (f[1] - 1.0).abs() < 1e-6));
    }
}
