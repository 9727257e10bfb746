//! Queue and DSP primitives for the trgkASIO audio driver shim.
//!
//! This crate holds the pieces of the real-time data path that have no
//! platform surface:
//!
//! - [`RingBuffer`] — fixed-capacity SPSC queue with all-or-nothing push/get
//! - [`Resampler`] — streaming rational polyphase resampler (f64)
//! - [`compress_block`] / [`compress_sample`] — the 24-bit soft-clip
//!   compressor applied to the mix before fan-out
//! - [`clock`] — the process-wide monotonic clock the poll loop runs on
//!
//! Everything here is allocation-free on the hot path once constructed
//! (the resampler reuses its internal scratch buffers across calls).

pub mod clock;
pub mod compress;
pub mod resample;
pub mod ring;

pub use compress::{COMPRESS_PADDING, COMPRESS_THRESHOLD, compress_block, compress_sample};
pub use resample::Resampler;
pub use ring::RingBuffer;
