//! Fixed-capacity FIFO used as the handoff between producer and consumer
//! threads.
//!
//! The buffer itself carries no lock: every user wraps one (or several, when
//! channel rings must stay in lockstep) in a single `Mutex`. Both operations
//! are all-or-nothing — a push that would overflow and a get that would
//! underflow leave the buffer untouched and report failure, so the caller
//! decides whether to drop, zero-fill, or log.

/// Fixed-capacity single-producer single-consumer sample queue.
///
/// Invariants, with `C = capacity()`:
///
/// - `size() <= C`
/// - write position `= (read position + size) % C`
/// - `push` of `k` elements succeeds iff `size + k <= C`
/// - `get` of `k` elements succeeds iff `size >= k`
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: Vec<T>,
    capacity: usize,
    read_pos: usize,
    size: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a ring buffer holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "ring buffer capacity must be >= 1");
        Self {
            buf: vec![T::default(); capacity],
            capacity,
            read_pos: 0,
            size: 0,
        }
    }

    /// Number of elements currently queued.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Maximum number of elements the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current read position (for diagnostics).
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    /// Current write position (for diagnostics).
    pub fn write_pos(&self) -> usize {
        (self.read_pos + self.size) % self.capacity
    }

    /// Append all of `input`, or nothing.
    ///
    /// Returns `false` (and leaves the buffer unchanged) when the input does
    /// not fit. An empty input always succeeds. The copy wraps at most once
    /// since `input.len() <= capacity` whenever the push is accepted.
    pub fn push(&mut self, input: &[T]) -> bool {
        let k = input.len();
        if self.size + k > self.capacity {
            return false;
        }

        let wp = self.write_pos();
        let until_end = self.capacity - wp;
        if k <= until_end {
            self.buf[wp..wp + k].copy_from_slice(input);
        } else {
            self.buf[wp..].copy_from_slice(&input[..until_end]);
            self.buf[..k - until_end].copy_from_slice(&input[until_end..]);
        }
        self.size += k;
        true
    }

    /// Remove `output.len()` elements into `output`, or nothing.
    ///
    /// Returns `false` (and leaves the buffer unchanged) when fewer than
    /// `output.len()` elements are queued.
    pub fn get(&mut self, output: &mut [T]) -> bool {
        let k = output.len();
        if self.size < k {
            return false;
        }

        let rp = self.read_pos;
        let until_end = self.capacity - rp;
        if k <= until_end {
            output.copy_from_slice(&self.buf[rp..rp + k]);
        } else {
            output[..until_end].copy_from_slice(&self.buf[rp..]);
            output[until_end..].copy_from_slice(&self.buf[..k - until_end]);
        }
        self.read_pos = (rp + k) % self.capacity;
        self.size -= k;
        true
    }
}
