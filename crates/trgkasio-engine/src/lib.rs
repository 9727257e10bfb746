//! Real-time audio data path for the trgkASIO driver shim.
//!
//! This crate routes host-submitted audio blocks to one or more system
//! audio endpoints in real time:
//!
//! - [`endpoint`] — the abstracted system audio layer ([`AudioSystem`] and
//!   friends), with a deterministic [`endpoint::sim`] implementation and an
//!   optional cpal adapter (feature `cpal-backend`)
//! - [`negotiate`] — stream format negotiation (32-bit → 24-in-32 → 16-bit,
//!   with the buffer-alignment retry)
//! - [`sink`] — per-endpoint ring buffers plus the render thread draining
//!   them into the endpoint
//! - [`clap`], [`keys`], [`loopback`] — the auxiliary mix sources
//! - [`prepared`] / [`running`] — the double-buffered host side and the
//!   real-time poll loop that drives `bufferSwitch`
//!
//! Data flow: host block → 24-bit-headroom mix → clap/loopback additions →
//! soft-clip compression → fan-out to every sink's rings → each sink's
//! render thread fills its endpoint on the endpoint's event.

pub mod clap;
pub mod endpoint;
pub mod error;
pub mod format;
pub mod keys;
pub mod loopback;
pub mod negotiate;
pub mod prepared;
pub mod running;
pub mod shared;
pub mod signal;
pub mod sink;

use std::collections::BTreeMap;

pub use clap::{ClapRenderer, INDEX_KEYDOWN, INDEX_KEYUP};
pub use endpoint::{
    AudioSystem, CaptureClient, EndpointDescriptor, EndpointId, RenderClient, VolumeControl,
};
pub use error::{EngineError, EngineResult};
pub use format::{ShareMode, WaveFormat};
pub use keys::{CountingKeySource, KeyEventCounts, KeyEventSource};
pub use loopback::LoopbackSource;
pub use prepared::{PreparedContext, PreparedState};
pub use running::RunningState;
pub use shared::{HostCallbacks, HostLink, SamplePosition, SharedBuffers};
pub use signal::BufferEvent;
pub use sink::{OutputSink, SinkStats};

/// The subset of driver settings the data path needs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Output channel count (1..=32).
    pub channel_count: u16,
    /// Gain applied to clap samples, `0.0..=1.0`.
    pub clap_gain: f64,
    /// When set, the poll loop's busy-waits become 1 ms sleeps (and sink
    /// rings grow from 2x to 4x).
    pub throttle: bool,
    /// Per-endpoint buffer duration overrides in 100 ns units, keyed by
    /// endpoint id or friendly name.
    pub duration_overrides: BTreeMap<String, i64>,
    /// Endpoint to capture via loopback, when any.
    pub loopback_source: Option<EndpointId>,
    /// Redirect the system default output to the loopback source while
    /// running.
    pub intercept_default_output: bool,
}
