//! Host-visible double buffer and callback plumbing.
//!
//! The host writes blocks into one of two planar buffers while the poll
//! loop drains the other; `bufferSwitch` flips the index. The poll loop does
//! not own the prepared state — it holds a [`HostLink`], a cloneable handle
//! to exactly the pieces it needs (the buffers and the callback table), so
//! ownership stays a tree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use trgkasio_core::clock;

/// Host-side callback table.
///
/// `buffer_switch` is invoked from the poll thread once per block, with
/// strictly alternating indices. The other callbacks are control-path
/// messages.
pub trait HostCallbacks: Send + Sync {
    /// The host may now fill buffer `index`.
    fn buffer_switch(&self, index: usize, direct_process: bool);

    /// The driver's sample rate changed (external to the host's control).
    fn sample_rate_changed(&self, _rate: u32) {}

    /// The driver asks the host to drive a reset cycle
    /// (dispose buffers, re-create, restart).
    fn reset_request(&self) {}
}

/// Frame-accurate position captured at the most recent buffer switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplePosition {
    /// Monotonic frame counter.
    pub samples: u64,
    /// System time in nanoseconds at the same moment.
    pub timestamp_nanos: u64,
}

/// The two host-visible planar blocks plus switch bookkeeping.
///
/// Each block is guarded by its own mutex with copy-length critical
/// sections; the index is atomic. This matches the double-buffer discipline:
/// the host writes the buffer it was last handed, the poll loop reads the
/// other one.
pub struct SharedBuffers {
    channels: usize,
    block_size: usize,
    blocks: [Mutex<Vec<Vec<i32>>>; 2],
    index: AtomicUsize,
    position: Mutex<SamplePosition>,
}

impl SharedBuffers {
    /// Allocate two zeroed `channels x block_size` blocks.
    pub fn new(channels: usize, block_size: usize) -> Self {
        let zeroed = || Mutex::new(vec![vec![0i32; block_size]; channels]);
        Self {
            channels,
            block_size,
            blocks: [zeroed(), zeroed()],
            index: AtomicUsize::new(0),
            position: Mutex::new(SamplePosition::default()),
        }
    }

    /// Channel count.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The buffer index the host should currently be writing.
    pub fn buffer_index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_buffer_index(&self, index: usize) {
        self.index.store(index & 1, Ordering::Release);
    }

    /// Host-side write of one channel of buffer `index`.
    ///
    /// Returns `false` when the channel is out of range or the slice length
    /// does not match the block size.
    pub fn write_channel(&self, index: usize, channel: usize, samples: &[i32]) -> bool {
        if channel >= self.channels || samples.len() != self.block_size {
            return false;
        }
        let mut block = self.blocks[index & 1].lock().expect("block lock poisoned");
        block[channel].copy_from_slice(samples);
        true
    }

    /// Read buffer `index` under its lock.
    pub fn with_block<R>(&self, index: usize, f: impl FnOnce(&[Vec<i32>]) -> R) -> R {
        let block = self.blocks[index & 1].lock().expect("block lock poisoned");
        f(&block)
    }

    /// Zero both blocks and rewind the position counter.
    pub fn reset(&self) {
        for block in &self.blocks {
            let mut block = block.lock().expect("block lock poisoned");
            for channel in block.iter_mut() {
                channel.fill(0);
            }
        }
        self.index.store(0, Ordering::Release);
        *self.position.lock().expect("position lock poisoned") = SamplePosition::default();
    }

    /// The `(samples, timestamp)` pair captured at the last buffer switch.
    pub fn sample_position(&self) -> SamplePosition {
        *self.position.lock().expect("position lock poisoned")
    }

    fn record_switch(&self) {
        let mut pos = self.position.lock().expect("position lock poisoned");
        pos.samples += self.block_size as u64;
        pos.timestamp_nanos = clock::nanos();
    }
}

impl std::fmt::Debug for SharedBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffers")
            .field("channels", &self.channels)
            .field("block_size", &self.block_size)
            .field("index", &self.buffer_index())
            .finish_non_exhaustive()
    }
}

/// Cloneable handle to the parts of the prepared state the poll loop needs.
#[derive(Clone)]
pub struct HostLink {
    /// The double buffer.
    pub shared: Arc<SharedBuffers>,
    /// The host callback table.
    pub callbacks: Arc<dyn HostCallbacks>,
}

impl HostLink {
    /// Capture the switch timestamp, advance the frame counter, and invoke
    /// the host's `bufferSwitch`.
    pub fn buffer_switch(&self, index: usize, direct_process: bool) {
        self.shared.record_switch();
        self.callbacks.buffer_switch(index, direct_process);
    }
}

impl std::fmt::Debug for HostLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingCallbacks {
        switches: AtomicU64,
    }

    impl HostCallbacks for CountingCallbacks {
        fn buffer_switch(&self, _index: usize, _direct: bool) {
            self.switches.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn write_and_read_round_trip() {
        let shared = SharedBuffers::new(2, 4);
        assert!(shared.write_channel(0, 1, &[1, 2, 3, 4]));
        shared.with_block(0, |block| {
            assert_eq!(block[0], vec![0, 0, 0, 0]);
            assert_eq!(block[1], vec![1, 2, 3, 4]);
        });
    }

    #[test]
    fn rejects_bad_writes() {
        let shared = SharedBuffers::new(2, 4);
        assert!(!shared.write_channel(0, 2, &[0; 4]));
        assert!(!shared.write_channel(0, 0, &[0; 3]));
    }

    #[test]
    fn switch_advances_position_and_calls_host() {
        let shared = Arc::new(SharedBuffers::new(2, 64));
        let callbacks = Arc::new(CountingCallbacks {
            switches: AtomicU64::new(0),
        });
        let link = HostLink {
            shared: Arc::clone(&shared),
            callbacks: callbacks.clone(),
        };

        let mut last_ts = 0u64;
        for i in 1..=5u64 {
            link.buffer_switch((i & 1) as usize, true);
            let pos = shared.sample_position();
            assert_eq!(pos.samples, i * 64);
            assert!(pos.timestamp_nanos >= last_ts);
            last_ts = pos.timestamp_nanos;
        }
        assert_eq!(callbacks.switches.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn reset_rewinds_everything() {
        let shared = SharedBuffers::new(1, 8);
        assert!(shared.write_channel(1, 0, &[5; 8]));
        shared.set_buffer_index(1);
        shared.reset();
        assert_eq!(shared.buffer_index(), 0);
        assert_eq!(shared.sample_position(), SamplePosition::default());
        shared.with_block(1, |block| assert!(block[0].iter().all(|&s| s == 0)));
    }
}
