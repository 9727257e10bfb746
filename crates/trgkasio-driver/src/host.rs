//! Host-facing types: fixed driver identity, channel metadata, clock
//! sources, and the error taxonomy of the host API.

use thiserror::Error;

/// Driver name reported to hosts (at most 32 bytes including the NUL a C
/// shim appends).
pub const DRIVER_NAME: &str = "trgkASIO";

/// Driver version reported to hosts.
pub const DRIVER_VERSION: u32 = 1;

/// Host-visible error codes.
///
/// Successful operations return `Ok`; everything here maps 1:1 onto a host
/// API error return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Operation invalid for the current driver state.
    #[error("not present in the current driver state")]
    NotPresent,

    /// Out-of-range index, missing argument, unknown selector.
    #[error("invalid parameter")]
    InvalidParameter,

    /// Structurally wrong call (input buffer requested, mismatched sizes).
    #[error("invalid mode")]
    InvalidMode,

    /// No configured endpoint can negotiate the requested sample rate.
    #[error("no clock at this sample rate")]
    NoClock,

    /// Playback machinery could not be constructed.
    #[error("hardware malfunction: {0}")]
    HwMalfunction(String),

    /// Format negotiation exhausted all candidates.
    #[error("format unsupported: {0}")]
    FormatUnsupported(String),
}

/// Convenience result alias for host API operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Known speaker names, indexed by channel. Channels beyond the list are
/// "Unknown".
pub const CHANNEL_NAMES: [&str; 11] = [
    "Front left",
    "Front right",
    "Front center",
    "Low frequency",
    "Back left",
    "Back right",
    "Front left of center",
    "Front right of center",
    "Back center",
    "Side left",
    "Side right",
];

/// Sample type of every host-visible channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    /// Signed 32-bit little-endian PCM.
    Int32Lsb,
}

/// Host-visible description of one output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel index in `[0, channel count)`.
    pub channel: usize,
    /// Always `false`; the driver has no inputs.
    pub is_input: bool,
    /// Whether prepared buffers currently exist.
    pub is_active: bool,
    /// Always group 0.
    pub channel_group: u32,
    /// Sample format.
    pub sample_type: SampleType,
    /// Speaker name.
    pub name: String,
}

/// The single clock source this driver exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSource {
    /// Source index; only 0 exists.
    pub index: u32,
    /// No associated channel.
    pub associated_channel: i32,
    /// No associated group.
    pub associated_group: i32,
    /// The internal clock is always current.
    pub is_current_source: bool,
    /// Display name.
    pub name: &'static str,
}

/// The clock source list: exactly the internal clock.
pub fn clock_sources() -> Vec<ClockSource> {
    vec![ClockSource {
        index: 0,
        associated_channel: -1,
        associated_group: -1,
        is_current_source: true,
        name: "Internal clock",
    }]
}

/// Buffer size constraints advertised to hosts, in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeRange {
    /// Smallest block size.
    pub min: u32,
    /// Largest block size.
    pub max: u32,
    /// Preferred block size.
    pub preferred: u32,
    /// `-1` means powers of two between min and max.
    pub granularity: i32,
}

/// The advertised buffer size range.
pub const BUFFER_SIZE_RANGE: BufferSizeRange = BufferSizeRange {
    min: 64,
    max: 1024,
    preferred: 64,
    granularity: -1,
};

/// One host buffer registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    /// Channel index the host wants buffers for.
    pub channel: usize,
    /// Hosts may only request outputs; `true` is rejected.
    pub is_input: bool,
}

/// Split a 64-bit quantity into host-API `(hi, lo)` words.
pub fn split_words(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_identity_is_fixed() {
        assert_eq!(DRIVER_NAME, "trgkASIO");
        assert!(DRIVER_NAME.len() < 32);
        assert_eq!(DRIVER_VERSION, 1);
    }

    #[test]
    fn single_internal_clock() {
        let clocks = clock_sources();
        assert_eq!(clocks.len(), 1);
        assert_eq!(clocks[0].name, "Internal clock");
        assert!(clocks[0].is_current_source);
    }

    #[test]
    fn words_split_round_trips() {
        let v = 0x1234_5678_9abc_def0u64;
        let (hi, lo) = split_words(v);
        assert_eq!(u64::from(hi) << 32 | u64::from(lo), v);
    }
}
