//! Stream format negotiation against one endpoint.
//!
//! Candidates are tried in quality order: 32-bit, 24-in-32, 16-bit. For each
//! candidate the endpoint is activated fresh, probed, and initialized. An
//! "unaligned buffer size" rejection is retried exactly once with the
//! duration recomputed from the endpoint's reported aligned frame count; any
//! other failure moves on to the next candidate. When every candidate fails
//! the whole negotiation fails with
//! [`EngineError::FormatUnsupported`].

use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::endpoint::{AudioSystem, ClientInitError, EndpointDescriptor, RenderClient};
use crate::error::{EngineError, EngineResult};
use crate::format::{ShareMode, WaveFormat, format_candidates};

/// 100 ns units per second.
const HNS_PER_SEC: f64 = 10_000_000.0;

/// A successfully negotiated, initialized render stream.
pub struct NegotiatedStream {
    /// The initialized client, not yet started.
    pub client: Box<dyn RenderClient>,
    /// The accepted format.
    pub format: WaveFormat,
}

impl std::fmt::Debug for NegotiatedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedStream")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Resolve the buffer duration for an endpoint: a per-endpoint override (by
/// id, then by friendly name), else the endpoint minimum in exclusive mode,
/// else the endpoint default (0) in shared mode.
fn buffer_duration_hns(
    client: &dyn RenderClient,
    endpoint: &EndpointDescriptor,
    mode: ShareMode,
    overrides: &BTreeMap<String, i64>,
) -> EngineResult<i64> {
    if mode == ShareMode::Shared {
        return Ok(0);
    }
    if let Some(&hns) = overrides
        .get(&endpoint.id.0)
        .or_else(|| overrides.get(&endpoint.friendly_name))
    {
        debug!(endpoint = %endpoint.id, hns, "using duration override");
        return Ok(hns);
    }
    let period = client.device_period()?;
    debug!(
        endpoint = %endpoint.id,
        min = period.min_hns,
        default = period.default_hns,
        "using endpoint minimum duration"
    );
    Ok(period.min_hns)
}

fn try_candidate(
    system: &dyn AudioSystem,
    endpoint: &EndpointDescriptor,
    mode: ShareMode,
    format: &WaveFormat,
    overrides: &BTreeMap<String, i64>,
) -> EngineResult<Box<dyn RenderClient>> {
    let mut client = system.activate_render(&endpoint.id)?;

    if !client.is_format_supported(mode, format) {
        return Err(EngineError::endpoint(
            endpoint.id.0.clone(),
            format!(
                "format {}bit/{}valid not supported",
                format.bits_per_sample, format.valid_bits
            ),
        ));
    }

    let duration = buffer_duration_hns(client.as_ref(), endpoint, mode, overrides)?;

    match client.initialize(mode, format, duration) {
        Ok(()) => Ok(client),
        Err(ClientInitError::BufferSizeNotAligned { aligned_frames }) => {
            // Recompute the duration from the aligned frame count and retry
            // once on a fresh client.
            let aligned_hns =
                (HNS_PER_SEC / f64::from(format.sample_rate) * aligned_frames as f64).round() as i64;
            debug!(
                endpoint = %endpoint.id,
                aligned_frames,
                aligned_hns,
                "buffer size not aligned; re-initializing"
            );
            let mut retry = system.activate_render(&endpoint.id)?;
            retry
                .initialize(mode, format, aligned_hns)
                .map_err(|e| EngineError::endpoint(endpoint.id.0.clone(), e.to_string()))?;
            Ok(retry)
        }
        Err(e) => Err(EngineError::endpoint(endpoint.id.0.clone(), e.to_string())),
    }
}

/// Negotiate and initialize a render stream on `endpoint`.
pub fn find_stream_format(
    system: &dyn AudioSystem,
    endpoint: &EndpointDescriptor,
    channels: u16,
    sample_rate: u32,
    mode: ShareMode,
    overrides: &BTreeMap<String, i64>,
) -> EngineResult<NegotiatedStream> {
    debug!(
        endpoint = %endpoint.id,
        channels,
        sample_rate,
        %mode,
        "negotiating stream format"
    );

    for format in format_candidates(sample_rate, channels) {
        match try_candidate(system, endpoint, mode, &format, overrides) {
            Ok(client) => {
                debug!(
                    endpoint = %endpoint.id,
                    bits = format.bits_per_sample,
                    valid = format.valid_bits,
                    "format accepted"
                );
                return Ok(NegotiatedStream { client, format });
            }
            Err(e) => {
                debug!(endpoint = %endpoint.id, error = %e, "candidate rejected");
            }
        }
    }

    error!(endpoint = %endpoint.id, "no stream format candidate accepted");
    Err(EngineError::FormatUnsupported(endpoint.id.0.clone()))
}

/// Whether `endpoint` would accept any candidate format at `sample_rate` in
/// `mode`, without initializing a stream.
pub fn probe_stream_format(
    system: &dyn AudioSystem,
    endpoint: &EndpointDescriptor,
    channels: u16,
    sample_rate: u32,
    mode: ShareMode,
) -> bool {
    let Ok(client) = system.activate_render(&endpoint.id) else {
        return false;
    };
    format_candidates(sample_rate, channels)
        .iter()
        .any(|f| client.is_format_supported(mode, f))
}
