//! The system audio layer, abstracted.
//!
//! The driver never talks to a platform audio API directly; everything it
//! needs from the OS is expressed by the object-safe traits in this module:
//!
//! - [`AudioSystem`] — enumerate endpoints, resolve the default output,
//!   activate render/capture clients, obtain volume controls
//! - [`RenderClient`] — one event-driven output stream on one endpoint
//! - [`CaptureClient`] — shared-mode loopback capture from one endpoint
//! - [`VolumeControl`] — master volume and mute of one endpoint
//!
//! Implementations provided in-tree: [`sim`] (deterministic, in-process,
//! used by the test suites) and, behind the `cpal-backend` feature,
//! [`cpal_backend`] for real hardware in shared mode. The traits use boxed
//! trait objects so backends can be selected at runtime.

pub mod sim;

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;

use crate::error::EngineResult;
use crate::format::{ShareMode, WaveFormat};
use crate::signal::BufferEvent;

use thiserror::Error;

/// Opaque endpoint identifier, unique within one [`AudioSystem`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub String);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId(s.to_string())
    }
}

/// An endpoint as presented by the audio system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Stable identifier.
    pub id: EndpointId,
    /// Human-readable name; configuration may match on either.
    pub friendly_name: String,
}

/// Buffer durations reported by an endpoint, in 100 ns units.
#[derive(Debug, Clone, Copy)]
pub struct DevicePeriod {
    /// The endpoint's preferred (shared-mode) period.
    pub default_hns: i64,
    /// The smallest period the endpoint supports in exclusive mode.
    pub min_hns: i64,
}

/// Why [`RenderClient::initialize`] failed.
#[derive(Debug, Error)]
pub enum ClientInitError {
    /// The requested duration does not align with the endpoint's frame
    /// granularity. Retry once with a duration derived from
    /// `aligned_frames`.
    #[error("buffer size not aligned; endpoint wants {aligned_frames} frames")]
    BufferSizeNotAligned {
        /// The next-highest aligned buffer size, in frames.
        aligned_frames: usize,
    },

    /// The endpoint rejected the format in this mode.
    #[error("format rejected")]
    FormatRejected,

    /// Any other endpoint failure.
    #[error("endpoint failure: {0}")]
    Endpoint(String),
}

/// One event-driven render stream on one endpoint.
///
/// Lifecycle: probe with [`is_format_supported`](Self::is_format_supported),
/// then [`initialize`](Self::initialize) exactly once, then
/// [`set_buffer_event`](Self::set_buffer_event), write the preload buffer,
/// and [`start`](Self::start). After every [`BufferEvent`] signal the owner
/// writes one buffer with [`write_frames`](Self::write_frames).
pub trait RenderClient: Send {
    /// Whether the endpoint would accept `format` in `mode`.
    fn is_format_supported(&self, mode: ShareMode, format: &WaveFormat) -> bool;

    /// The endpoint's default and minimum buffer durations.
    fn device_period(&self) -> EngineResult<DevicePeriod>;

    /// Open the stream. `duration_hns` of zero means "endpoint default"
    /// (shared mode only).
    fn initialize(
        &mut self,
        mode: ShareMode,
        format: &WaveFormat,
        duration_hns: i64,
    ) -> Result<(), ClientInitError>;

    /// The negotiated endpoint buffer size in frames. Valid after
    /// `initialize` (and after a `BufferSizeNotAligned` failure, where it
    /// reports the aligned size).
    fn buffer_frames(&self) -> EngineResult<usize>;

    /// Register the event the endpoint signals when a buffer is due.
    fn set_buffer_event(&mut self, event: BufferEvent) -> EngineResult<()>;

    /// Begin playback.
    fn start(&mut self) -> EngineResult<()>;

    /// Stop playback.
    fn stop(&mut self) -> EngineResult<()>;

    /// Frames already queued in the endpoint buffer (shared mode).
    fn current_padding(&self) -> EngineResult<usize>;

    /// Write `frames` interleaved frames laid out per the negotiated format.
    /// `data` must hold exactly `frames * format.frame_bytes()` bytes.
    fn write_frames(&mut self, frames: usize, data: &[u8]) -> EngineResult<()>;
}

/// One packet pulled from a loopback capture stream.
#[derive(Debug, Clone)]
pub struct CapturePacket {
    /// Frame count in this packet.
    pub frames: usize,
    /// Interleaved 32-bit samples, `frames * channels` long. Empty when
    /// `silent` is set.
    pub data: Vec<i32>,
    /// The system marked this interval as silence.
    pub silent: bool,
}

/// Shared-mode loopback capture from one endpoint, at the endpoint's native
/// mix rate.
pub trait CaptureClient: Send {
    /// The capture format (32-bit PCM at the endpoint's native rate).
    fn format(&self) -> WaveFormat;

    /// The capture buffer size in frames.
    fn buffer_frames(&self) -> usize;

    /// Begin capturing.
    fn start(&mut self) -> EngineResult<()>;

    /// Stop capturing.
    fn stop(&mut self) -> EngineResult<()>;

    /// Pull the next pending packet, or `None` when drained.
    fn read_packet(&mut self) -> EngineResult<Option<CapturePacket>>;
}

/// Master volume and mute of one endpoint.
pub trait VolumeControl: Send + Sync {
    /// Current `(volume, muted)` state; volume in `0.0..=1.0`.
    fn get(&self) -> EngineResult<(f32, bool)>;

    /// Set the master volume.
    fn set_volume(&self, volume: f32) -> EngineResult<()>;

    /// Set the mute state.
    fn set_mute(&self, mute: bool) -> EngineResult<()>;
}

/// The system audio layer: endpoint registry plus client factories.
pub trait AudioSystem: Send + Sync {
    /// All output endpoints, in system order.
    fn endpoints(&self) -> EngineResult<Vec<EndpointDescriptor>>;

    /// The current default output endpoint.
    fn default_output(&self) -> EngineResult<EndpointDescriptor>;

    /// Make `id` the default output endpoint.
    fn set_default_output(&self, id: &EndpointId) -> EngineResult<()>;

    /// Activate a fresh render client on `id`.
    fn activate_render(&self, id: &EndpointId) -> EngineResult<Box<dyn RenderClient>>;

    /// Activate loopback capture of `id`, delivering `channels` channels.
    fn activate_loopback(
        &self,
        id: &EndpointId,
        channels: u16,
    ) -> EngineResult<Box<dyn CaptureClient>>;

    /// Obtain the volume control of `id`.
    fn volume_control(&self, id: &EndpointId) -> EngineResult<Box<dyn VolumeControl>>;
}
