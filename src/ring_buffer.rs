//! Fixed-capacity circular sample buffer.
//!
//! One buffer exists per enabled output channel. The parser is the only
//! writer (it moves `write_idx`), the host drain is the only reader (it moves
//! `read_idx`). One slot is always kept empty so `write_idx == read_idx`
//! unambiguously means "empty".
//!
//! Buffers cross from the parser's worker context to the host through
//! [`SharedRingBuffer`], which puts an explicit lock at the index boundary.

use std::sync::{Arc, Mutex};

/// Smallest capacity a buffer is ever created with.
pub const MIN_CAPACITY: usize = 16;

/// Largest capacity a buffer is ever created with (16 Mi samples).
pub const MAX_CAPACITY: usize = 1 << 24;

/// A ring buffer shared between the parser (writer) and the host (reader).
pub type SharedRingBuffer<T> = Arc<Mutex<RingBuffer<T>>>;

/// Minimum buffer size for a channel: `max(seconds * rate, floor)`.
pub fn buffer_size_for(seconds: f64, sample_rate_hz: f64, floor: usize) -> usize {
    let wanted = seconds * sample_rate_hz;
    if wanted.is_finite() && wanted > floor as f64 {
        wanted.ceil() as usize
    } else {
        floor
    }
}

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<T>,
    mask: usize,
    write_idx: usize,
    read_idx: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a buffer holding at least `min_size` samples.
    ///
    /// The capacity is rounded up to a power of two and clamped to
    /// [`MIN_CAPACITY`]..=[`MAX_CAPACITY`]. Usable space is `capacity - 1`.
    pub fn with_min_size(min_size: usize) -> Self {
        let capacity = min_size
            .clamp(MIN_CAPACITY, MAX_CAPACITY)
            .next_power_of_two();
        Self {
            data: vec![T::default(); capacity],
            mask: capacity - 1,
            write_idx: 0,
            read_idx: 0,
        }
    }

    /// Wrap the buffer for handing to the host.
    pub fn shared(self) -> SharedRingBuffer<T> {
        Arc::new(Mutex::new(self))
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of samples waiting to be read.
    pub fn count(&self) -> usize {
        self.write_idx.wrapping_sub(self.read_idx) & self.mask
    }

    /// Number of samples that can still be written.
    pub fn free_space(&self) -> usize {
        self.capacity() - self.count() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Write one sample. Returns `false` (and drops the sample) when full.
    pub fn write(&mut self, value: T) -> bool {
        if self.free_space() == 0 {
            return false;
        }
        self.data[self.write_idx] = value;
        self.write_idx = (self.write_idx + 1) & self.mask;
        true
    }

    /// Write all of `values` or none of them.
    pub fn write_batch(&mut self, values: &[T]) -> bool {
        if values.len() > self.free_space() {
            return false;
        }
        let first = values.len().min(self.capacity() - self.write_idx);
        self.data[self.write_idx..self.write_idx + first].copy_from_slice(&values[..first]);
        let rest = values.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&values[first..]);
        }
        self.write_idx = (self.write_idx + values.len()) & self.mask;
        true
    }

    /// Oldest unread sample, without consuming it.
    pub fn peek(&self) -> Option<T> {
        if self.is_empty() {
            None
        } else {
            Some(self.data[self.read_idx])
        }
    }

    /// Consume the oldest unread sample.
    pub fn read(&mut self) -> Option<T> {
        let value = self.peek()?;
        self.read_idx = (self.read_idx + 1) & self.mask;
        Some(value)
    }

    /// Consume up to `out.len()` samples; returns how many were copied.
    pub fn read_into(&mut self, out: &mut [T]) -> usize {
        let n = out.len().min(self.count());
        let first = n.min(self.capacity() - self.read_idx);
        out[..first].copy_from_slice(&self.data[self.read_idx..self.read_idx + first]);
        if n > first {
            out[first..n].copy_from_slice(&self.data[..n - first]);
        }
        self.read_idx = (self.read_idx + n) & self.mask;
        n
    }

    /// Drain everything currently readable.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = vec![T::default(); self.count()];
        self.read_into(&mut out);
        out
    }

    /// Discard unread samples (consumer side: the read index catches up).
    pub fn clear(&mut self) {
        self.read_idx = self.write_idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_capacity_rounding_and_floor() {
        assert_eq!(RingBuffer::<i32>::with_min_size(0).capacity(), MIN_CAPACITY);
        assert_eq!(RingBuffer::<i32>::with_min_size(5).capacity(), MIN_CAPACITY);
        assert_eq!(RingBuffer::<i32>::with_min_size(16).capacity(), 16);
        assert_eq!(RingBuffer::<i32>::with_min_size(17).capacity(), 32);
        assert_eq!(RingBuffer::<i32>::with_min_size(1000).capacity(), 1024);
        assert_eq!(RingBuffer::<u8>::with_min_size(usize::MAX).capacity(), MAX_CAPACITY);
    }

    #[test]
    fn test_buffer_size_for() {
        assert_eq!(buffer_size_for(2.0, 1000.0, 64), 2000);
        assert_eq!(buffer_size_for(0.01, 100.0, 64), 64);
        assert_eq!(buffer_size_for(-1.0, 100.0, 64), 64);
        assert_eq!(buffer_size_for(f64::NAN, 100.0, 64), 64);
        assert_eq!(buffer_size_for(1e30, 1000.0, 64), usize::MAX);
    }

    #[test]
    fn test_fills_to_capacity_minus_one() {
        let mut rb = RingBuffer::<i32>::with_min_size(16);
        for i in 0..15 {
            assert!(rb.write(i));
        }
        assert_eq!(rb.free_space(), 0);
        assert_eq!(rb.count(), 15);
        assert!(!rb.write(99));
        assert_eq!(rb.read(), Some(0));
        assert!(rb.write(99));
        assert!(!rb.write(100));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut rb = RingBuffer::<i32>::with_min_size(16);
        assert!(rb.write_batch(&[1; 10]));
        assert!(!rb.write_batch(&[2; 6]));
        assert_eq!(rb.count(), 10);
        assert!(rb.write_batch(&[3; 5]));
        assert_eq!(rb.free_space(), 0);
    }

    #[test]
    fn test_batch_and_read_wrap_around() {
        let mut rb = RingBuffer::<i32>::with_min_size(16);
        assert!(rb.write_batch(&[0; 12]));
        let mut sink = [0; 12];
        assert_eq!(rb.read_into(&mut sink), 12);

        let values: Vec<i32> = (1..=10).collect();
        assert!(rb.write_batch(&values));
        assert_eq!(rb.drain_all(), values);
        assert!(rb.is_empty());
        assert_eq!(rb.peek(), None);
    }

    #[test]
    fn test_clear_discards_unread() {
        let mut rb = RingBuffer::<i32>::with_min_size(16);
        rb.write_batch(&[1, 2, 3]);
        rb.clear();
        assert_eq!(rb.count(), 0);
        assert_eq!(rb.free_space(), 15);
        assert!(rb.write(4));
        assert_eq!(rb.read(), Some(4));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(i32),
        Batch(Vec<i32>),
        Read(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<i32>().prop_map(Op::Write),
            prop::collection::vec(any::<i32>(), 0..40).prop_map(Op::Batch),
            (0usize..40).prop_map(Op::Read),
        ]
    }

    proptest! {
        #[test]
        fn prop_count_and_space_invariants(
            min_size in 1usize..100,
            ops in prop::collection::vec(arb_op(), 0..200)
        ) {
            let mut rb = RingBuffer::<i32>::with_min_size(min_size);
            let mut model = std::collections::VecDeque::new();
            let cap = rb.capacity();

            for op in ops {
                match op {
                    Op::Write(v) => {
                        let was_full = rb.free_space() == 0;
                        let ok = rb.write(v);
                        prop_assert_eq!(ok, !was_full);
                        if ok {
                            model.push_back(v);
                        }
                    }
                    Op::Batch(vs) => {
                        let fits = vs.len() <= rb.free_space();
                        prop_assert_eq!(rb.write_batch(&vs), fits);
                        if fits {
                            model.extend(vs);
                        }
                    }
                    Op::Read(n) => {
                        let mut out = vec![0; n];
                        let got = rb.read_into(&mut out);
                        let expected: Vec<i32> = (0..got).filter_map(|_| model.pop_front()).collect();
                        prop_assert_eq!(&out[..got], &expected[..]);
                    }
                }
                prop_assert_eq!(rb.count() + rb.free_space(), cap - 1);
                prop_assert_eq!(rb.count(), model.len());
            }
        }
    }
}
