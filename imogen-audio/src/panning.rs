//! Assigns pan positions to harmony voices across the stereo field

use crate::pan::PAN_CENTER;

/// Default stereo width in percent
pub const DEFAULT_STEREO_WIDTH: u8 = 100;

/// Hands out evenly spaced pan values, nearest the centre first.
///
/// The stereo width (0-100 %) sets how far the outermost values reach. With
/// `n` voices the range is split into `n` equal slots and each value sits in
/// the middle of its slot. Values are returned to the pool when voices stop
/// and handed out again in the same centre-out order.
#[derive(Debug, Clone)]
pub struct PanningManager {
    stereo_width: u8,
    /// Every value for the current width, ascending
    possible: Vec<u8>,
    /// Unassigned values, centre-out
    available: Vec<u8>,
}

impl PanningManager {
    pub fn new(num_voices: usize, stereo_width: u8) -> Self {
        let mut manager = Self {
            stereo_width: stereo_width.min(100),
            possible: Vec::with_capacity(num_voices),
            available: Vec::with_capacity(num_voices),
        };
        manager.set_voice_count(num_voices);
        manager
    }

    pub fn stereo_width(&self) -> u8 {
        self.stereo_width
    }

    pub fn voice_count(&self) -> usize {
        self.possible.len()
    }

    /// Every value for the current width, ascending
    pub fn possible_values(&self) -> &[u8] {
        &self.possible
    }

    /// Unassigned values in the order they will be handed out
    pub fn available_values(&self) -> &[u8] {
        &self.available
    }

    /// Resize for a new voice count and return every value to the pool.
    ///
    /// Allocates when growing, so only call this while preparing.
    pub fn set_voice_count(&mut self, num_voices: usize) {
        self.possible.clear();
        self.possible.resize(num_voices, PAN_CENTER);
        self.available.reserve(num_voices);
        self.compute_values();
        self.reset();
    }

    /// Change the stereo width.
    ///
    /// Returns `true` if the width changed. The pool is refilled with the new
    /// values, so the caller must re-take a value for every active voice with
    /// [`take_closest`](Self::take_closest).
    pub fn set_stereo_width(&mut self, width: u8) -> bool {
        let width = width.min(100);
        if width == self.stereo_width {
            return false;
        }
        self.stereo_width = width;
        self.compute_values();
        self.reset();
        true
    }

    /// Take the next value, centre-out. Falls back to centre when exhausted.
    pub fn next_pan(&mut self) -> u8 {
        if self.available.is_empty() {
            PAN_CENTER
        } else {
            self.available.remove(0)
        }
    }

    /// Take the available value closest to `previous`
    pub fn take_closest(&mut self, previous: u8) -> u8 {
        let closest = self
            .available
            .iter()
            .enumerate()
            .min_by_key(|&(_, &v)| ((v as i16 - previous as i16).abs(), v))
            .map(|(i, _)| i);
        match closest {
            Some(index) => self.available.remove(index),
            None => PAN_CENTER,
        }
    }

    /// Return a value to the pool, keeping the centre-out order.
    ///
    /// Values that do not belong to the current width are ignored.
    pub fn release(&mut self, value: u8) {
        let owned = self.possible.iter().filter(|&&v| v == value).count();
        let free = self.available.iter().filter(|&&v| v == value).count();
        if free >= owned {
            return;
        }
        let key = centre_order(value);
        let index = self.available.partition_point(|&v| centre_order(v) <= key);
        self.available.insert(index, value);
    }

    /// Return every value to the pool
    pub fn reset(&mut self) {
        self.available.clear();
        self.available.extend_from_slice(&self.possible);
        self.available.sort_unstable_by_key(|&v| centre_order(v));
    }

    fn compute_values(&mut self) {
        let n = self.possible.len();
        if n == 0 {
            return;
        }
        let spread = 63.5 * self.stereo_width as f32 / 100.0;
        let min = 63.5 - spread;
        let max = 63.5 + spread;
        let increment = (max - min) / n as f32;
        for (i, value) in self.possible.iter_mut().enumerate() {
            let v = min + i as f32 * increment + increment / 2.0;
            *value = v.round().clamp(0.0, 127.0) as u8;
        }
    }
}

/// Sort key: distance from the 63.5 midpoint (doubled to stay integral), then value
fn centre_order(value: u8) -> (u16, u8) {
    ((2 * value as i16 - 127).unsigned_abs(), value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_span_width() {
        let pm = PanningManager::new(4, 100);
        assert_eq!(pm.possible_values(), &[16, 48, 79, 111]);

        let pm = PanningManager::new(4, 50);
        assert_eq!(pm.possible_values(), &[40, 56, 71, 87]);

        let pm = PanningManager::new(3, 0);
        assert_eq!(pm.possible_values(), &[64, 64, 64]);
    }

    #[test]
    fn test_hands_out_centre_first() {
        let mut pm = PanningManager::new(4, 100);
        assert_eq!(pm.next_pan(), 48);
        assert_eq!(pm.next_pan(), 79);
        assert_eq!(pm.next_pan(), 16);
        assert_eq!(pm.next_pan(), 111);
        assert_eq!(pm.next_pan(), PAN_CENTER);
    }

    #[test]
    fn test_release_preserves_order() {
        let mut pm = PanningManager::new(4, 100);
        for _ in 0..4 {
            pm.next_pan();
        }
        pm.release(111);
        pm.release(48);
        pm.release(79);
        assert_eq!(pm.available_values(), &[48, 79, 111]);

        // Foreign and duplicate values are ignored
        pm.release(5);
        pm.release(48);
        assert_eq!(pm.available_values(), &[48, 79, 111]);
    }

    #[test]
    fn test_width_change_moves_to_closest() {
        let mut pm = PanningManager::new(4, 100);
        let a = pm.next_pan();
        let b = pm.next_pan();
        let c = pm.next_pan();
        assert_eq!((a, b, c), (48, 79, 16));

        assert!(pm.set_stereo_width(50));
        assert!(!pm.set_stereo_width(50));
        // Ties go to the lower value
        assert_eq!(pm.take_closest(a), 40);
        assert_eq!(pm.take_closest(b), 71);
        assert_eq!(pm.take_closest(c), 56);
        assert_eq!(pm.available_values(), &[87]);
    }

    #[test]
    fn test_zero_width_duplicates() {
        let mut pm = PanningManager::new(2, 0);
        assert_eq!(pm.next_pan(), 64);
        assert_eq!(pm.next_pan(), 64);
        pm.release(64);
        pm.release(64);
        pm.release(64);
        assert_eq!(pm.available_values(), &[64, 64]);
    }
}
