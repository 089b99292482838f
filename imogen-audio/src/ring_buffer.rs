//! Fixed-capacity circular store of recent input audio
//!
//! Feeds the detector and extractor with a rolling history. Writes never fail:
//! once full, the oldest samples are overwritten. Reads are non-destructive
//! lookbacks over the most recent samples.

use crate::error::RingBufferError;

/// Circular buffer storing the most recent `capacity` samples
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<f32>,
    write_pos: usize,
    /// Samples written since creation or the last clear
    written: u64,
}

impl RingBuffer {
    /// Create a ring buffer holding `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            write_pos: 0,
            written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid samples available for reading
    pub fn len(&self) -> usize {
        (self.written.min(self.data.len() as u64)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Total samples written since creation or the last clear
    pub fn total_written(&self) -> u64 {
        self.written
    }

    /// Append samples, discarding the oldest on overflow
    pub fn write(&mut self, samples: &[f32]) {
        let capacity = self.data.len();
        if capacity == 0 {
            return;
        }
        self.written += samples.len() as u64;

        // Only the last `capacity` samples can survive
        let samples = if samples.len() > capacity {
            &samples[samples.len() - capacity..]
        } else {
            samples
        };

        let first = samples.len().min(capacity - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        self.data[..rest].copy_from_slice(&samples[first..]);
        self.write_pos = (self.write_pos + samples.len()) % capacity;
    }

    /// The most recent `count` samples, oldest first, as two contiguous parts.
    ///
    /// The second slice is empty unless the range wraps around the end of the
    /// backing store.
    pub fn read(&self, count: usize) -> Result<(&[f32], &[f32]), RingBufferError> {
        let available = self.len();
        if count > available {
            return Err(RingBufferError::Underflow {
                requested: count,
                available,
            });
        }
        if count == 0 {
            return Ok((&[], &[]));
        }

        let capacity = self.data.len();
        let start = (self.write_pos + capacity - count) % capacity;
        if start + count <= capacity {
            Ok((&self.data[start..start + count], &[]))
        } else {
            Ok((&self.data[start..], &self.data[..count - (capacity - start)]))
        }
    }

    /// Copy the most recent `dest.len()` samples into `dest`
    pub fn copy_latest(&self, dest: &mut [f32]) -> Result<(), RingBufferError> {
        let (head, tail) = self.read(dest.len())?;
        dest[..head.len()].copy_from_slice(head);
        dest[head.len()..].copy_from_slice(tail);
        Ok(())
    }

    /// Like `copy_latest`, but zero-fills the front of `dest` when less history
    /// is available. Returns the number of valid samples copied.
    pub fn copy_latest_padded(&self, dest: &mut [f32]) -> usize {
        let valid = dest.len().min(self.len());
        let missing = dest.len() - valid;
        dest[..missing].fill(0.0);
        // `valid` never exceeds what is available
        if let Ok((head, tail)) = self.read(valid) {
            dest[missing..missing + head.len()].copy_from_slice(head);
            dest[missing + head.len()..].copy_from_slice(tail);
        }
        valid
    }

    /// Forget all history
    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.write_pos = 0;
        self.written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latest(rb: &RingBuffer, count: usize) -> Vec<f32> {
        let (head, tail) = rb.read(count).unwrap();
        head.iter().chain(tail).copied().collect()
    }

    #[test]
    fn test_basic_write_read() {
        let mut rb = RingBuffer::new(4);
        rb.write(&[1.0, 2.0, 3.0]);
        assert_eq!(rb.len(), 3);
        assert_eq!(latest(&rb, 3), vec![1.0, 2.0, 3.0]);
        assert_eq!(latest(&rb, 2), vec![2.0, 3.0]);
    }

    #[test]
    fn test_overflow_keeps_most_recent() {
        let mut rb = RingBuffer::new(4);
        for i in 0..6 {
            rb.write(&[i as f32]);
        }
        assert_eq!(rb.len(), 4);
        assert_eq!(rb.total_written(), 6);
        assert_eq!(latest(&rb, 4), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_write_larger_than_capacity() {
        let mut rb = RingBuffer::new(4);
        rb.write(&[9.0]);
        rb.write(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        assert_eq!(latest(&rb, 4), vec![30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_wrapped_read_returns_two_parts() {
        let mut rb = RingBuffer::new(5);
        rb.write(&[1.0, 2.0, 3.0, 4.0]);
        rb.write(&[5.0, 6.0, 7.0]);
        let (head, tail) = rb.read(5).unwrap();
        assert_eq!(head, &[3.0, 4.0, 5.0]);
        assert_eq!(tail, &[6.0, 7.0]);
    }

    #[test]
    fn test_reads_within_available_never_fail() {
        let mut rb = RingBuffer::new(7);
        for block in 0..20 {
            let samples: Vec<f32> = (0..(block % 5 + 1)).map(|i| i as f32).collect();
            rb.write(&samples);
            for count in 0..=rb.len() {
                assert!(rb.read(count).is_ok());
            }
        }
    }

    #[test]
    fn test_underflow() {
        let mut rb = RingBuffer::new(8);
        rb.write(&[1.0, 2.0]);
        assert_eq!(
            rb.read(3),
            Err(RingBufferError::Underflow {
                requested: 3,
                available: 2
            })
        );
        assert!(rb.read(9).is_err());
    }

    #[test]
    fn test_copy_latest_padded_zero_fills_missing_history() {
        let mut rb = RingBuffer::new(8);
        rb.write(&[1.0, 2.0, 3.0]);
        let mut dest = [9.0; 5];
        assert_eq!(rb.copy_latest_padded(&mut dest), 3);
        assert_eq!(dest, [0.0, 0.0, 1.0, 2.0, 3.0]);

        let mut exact = [0.0; 2];
        rb.copy_latest(&mut exact).unwrap();
        assert_eq!(exact, [2.0, 3.0]);
    }

    #[test]
    fn test_clear() {
        let mut rb = RingBuffer::new(4);
        rb.write(&[1.0, 2.0, 3.0]);
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.len(), 0);
        assert!(rb.read(1).is_err());
    }
}
