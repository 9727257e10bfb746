//! Deterministic in-process audio system.
//!
//! `SimAudioSystem` implements the full [`AudioSystem`] surface against
//! in-memory endpoints, so every layer above the endpoint traits — format
//! negotiation, sinks, the loopback source, the poll loop, the driver
//! facade — can be exercised without hardware. Endpoints are configured per
//! test: accepted rates, maximum bit depth, buffer alignment quirks, native
//! mix rate, and whether render events are paced by a timer thread or pumped
//! manually.
//!
//! Written frames, volume changes, and default-output switches are recorded
//! and can be inspected through the `Sim*` handle methods.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::endpoint::{
    AudioSystem, CaptureClient, CapturePacket, ClientInitError, DevicePeriod, EndpointDescriptor,
    EndpointId, RenderClient, VolumeControl,
};
use crate::error::{EngineError, EngineResult};
use crate::format::{ShareMode, WaveFormat};
use crate::signal::BufferEvent;

const DEFAULT_RATES: &[u32] = &[44100, 48000, 88200, 96000, 176400, 192000];

/// Per-endpoint behavior knobs.
#[derive(Debug, Clone)]
pub struct SimEndpointConfig {
    /// Stable identifier.
    pub id: String,
    /// Friendly name (config files may match on this).
    pub friendly_name: String,
    /// Sample rates the endpoint accepts.
    pub rates: Vec<u32>,
    /// Deepest container the endpoint accepts (16 or 32).
    pub max_bits: u16,
    /// Native mix rate used for loopback capture.
    pub mix_rate: u32,
    /// When set, exclusive-mode buffers must be a multiple of this many
    /// frames; unaligned requests fail once with the aligned size.
    pub alignment_frames: Option<usize>,
    /// When set, the render client never paces itself; tests drive events
    /// through [`SimAudioSystem::pump`].
    pub manual_pacing: bool,
}

impl SimEndpointConfig {
    /// An endpoint accepting the common rates at full 32-bit depth.
    pub fn new(id: &str, friendly_name: &str) -> Self {
        Self {
            id: id.to_string(),
            friendly_name: friendly_name.to_string(),
            rates: DEFAULT_RATES.to_vec(),
            max_bits: 32,
            mix_rate: 48000,
            alignment_frames: None,
            manual_pacing: false,
        }
    }

    /// Restrict the accepted sample rates.
    pub fn with_rates(mut self, rates: &[u32]) -> Self {
        self.rates = rates.to_vec();
        self
    }

    /// Restrict the accepted container depth (e.g. 16 for a 16-bit-only
    /// endpoint).
    pub fn with_max_bits(mut self, bits: u16) -> Self {
        self.max_bits = bits;
        self
    }

    /// Set the native mix rate reported to loopback capture.
    pub fn with_mix_rate(mut self, rate: u32) -> Self {
        self.mix_rate = rate;
        self
    }

    /// Require exclusive-mode buffer sizes to align to `frames`.
    pub fn with_alignment_frames(mut self, frames: usize) -> Self {
        self.alignment_frames = Some(frames);
        self
    }

    /// Disable the pacing thread; events come from [`SimAudioSystem::pump`].
    pub fn with_manual_pacing(mut self) -> Self {
        self.manual_pacing = true;
        self
    }
}

#[derive(Debug, Default)]
struct WrittenLog {
    /// Interleaved container samples as written (16-bit values sign-extended).
    samples: Vec<i32>,
    frames: u64,
}

#[derive(Debug)]
struct SimEndpointShared {
    config: SimEndpointConfig,
    wedged: AtomicBool,
    written: Mutex<WrittenLog>,
    event: Mutex<Option<BufferEvent>>,
    capture_queue: Mutex<VecDeque<CapturePacket>>,
    volume: Mutex<(f32, bool)>,
}

#[derive(Debug)]
struct SimState {
    endpoints: Vec<Arc<SimEndpointShared>>,
    default_output: Mutex<EndpointId>,
}

/// In-process [`AudioSystem`] implementation. Cheap to clone; clones share
/// all endpoint state.
#[derive(Debug, Clone)]
pub struct SimAudioSystem {
    state: Arc<SimState>,
}

impl SimAudioSystem {
    /// Build a system from endpoint configurations. The first endpoint
    /// starts as the default output.
    ///
    /// # Panics
    ///
    /// Panics when `configs` is empty.
    pub fn new(configs: Vec<SimEndpointConfig>) -> Self {
        assert!(!configs.is_empty(), "sim needs at least one endpoint");
        let default = EndpointId(configs[0].id.clone());
        let endpoints = configs
            .into_iter()
            .map(|config| {
                Arc::new(SimEndpointShared {
                    config,
                    wedged: AtomicBool::new(false),
                    written: Mutex::new(WrittenLog::default()),
                    event: Mutex::new(None),
                    capture_queue: Mutex::new(VecDeque::new()),
                    volume: Mutex::new((1.0, false)),
                })
            })
            .collect();
        Self {
            state: Arc::new(SimState {
                endpoints,
                default_output: Mutex::new(default),
            }),
        }
    }

    fn find(&self, id: &EndpointId) -> EngineResult<Arc<SimEndpointShared>> {
        self.state
            .endpoints
            .iter()
            .find(|e| e.config.id == id.0)
            .cloned()
            .ok_or_else(|| EngineError::EndpointNotFound(id.0.clone()))
    }

    /// Total frames written to `id` so far.
    pub fn written_frames(&self, id: &EndpointId) -> u64 {
        self.find(id)
            .map(|e| e.written.lock().expect("sim lock").frames)
            .unwrap_or(0)
    }

    /// Snapshot of the interleaved container samples written to `id`.
    pub fn written_samples(&self, id: &EndpointId) -> Vec<i32> {
        self.find(id)
            .map(|e| e.written.lock().expect("sim lock").samples.clone())
            .unwrap_or_default()
    }

    /// Suspend (or resume) event pacing for `id`, wedging its consumer.
    pub fn set_wedged(&self, id: &EndpointId, wedged: bool) {
        if let Ok(e) = self.find(id) {
            e.wedged.store(wedged, Ordering::SeqCst);
        }
    }

    /// Manually raise one buffer-due event on `id`.
    pub fn pump(&self, id: &EndpointId) {
        if let Ok(e) = self.find(id)
            && let Some(event) = e.event.lock().expect("sim lock").as_ref()
        {
            event.signal();
        }
    }

    /// Queue an interleaved 32-bit capture packet on `id` for loopback.
    pub fn push_capture(&self, id: &EndpointId, channels: u16, data: Vec<i32>) {
        if let Ok(e) = self.find(id) {
            let frames = data.len() / usize::from(channels);
            e.capture_queue
                .lock()
                .expect("sim lock")
                .push_back(CapturePacket {
                    frames,
                    data,
                    silent: false,
                });
        }
    }

    /// Current `(volume, muted)` of `id`.
    pub fn volume_state(&self, id: &EndpointId) -> (f32, bool) {
        self.find(id)
            .map(|e| *e.volume.lock().expect("sim lock"))
            .unwrap_or((0.0, false))
    }

    /// The endpoint currently configured as default output.
    pub fn default_output_id(&self) -> EndpointId {
        self.state
            .default_output
            .lock()
            .expect("sim lock")
            .clone()
    }
}

impl AudioSystem for SimAudioSystem {
    fn endpoints(&self) -> EngineResult<Vec<EndpointDescriptor>> {
        Ok(self
            .state
            .endpoints
            .iter()
            .map(|e| EndpointDescriptor {
                id: EndpointId(e.config.id.clone()),
                friendly_name: e.config.friendly_name.clone(),
            })
            .collect())
    }

    fn default_output(&self) -> EngineResult<EndpointDescriptor> {
        let id = self.default_output_id();
        let shared = self.find(&id)?;
        Ok(EndpointDescriptor {
            id,
            friendly_name: shared.config.friendly_name.clone(),
        })
    }

    fn set_default_output(&self, id: &EndpointId) -> EngineResult<()> {
        self.find(id)?;
        *self.state.default_output.lock().expect("sim lock") = id.clone();
        Ok(())
    }

    fn activate_render(&self, id: &EndpointId) -> EngineResult<Box<dyn RenderClient>> {
        let shared = self.find(id)?;
        Ok(Box::new(SimRenderClient {
            shared,
            negotiated: None,
            pacer: None,
            pacer_stop: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn activate_loopback(
        &self,
        id: &EndpointId,
        channels: u16,
    ) -> EngineResult<Box<dyn CaptureClient>> {
        let shared = self.find(id)?;
        let mix_rate = shared.config.mix_rate;
        Ok(Box::new(SimCaptureClient {
            shared,
            format: WaveFormat::pcm(mix_rate, channels, 32, 32),
        }))
    }

    fn volume_control(&self, id: &EndpointId) -> EngineResult<Box<dyn VolumeControl>> {
        Ok(Box::new(SimVolumeControl {
            shared: self.find(id)?,
        }))
    }
}

struct Negotiated {
    format: WaveFormat,
    frames: usize,
}

struct SimRenderClient {
    shared: Arc<SimEndpointShared>,
    negotiated: Option<Negotiated>,
    pacer: Option<thread::JoinHandle<()>>,
    pacer_stop: Arc<AtomicBool>,
}

impl SimRenderClient {
    fn accepts(&self, format: &WaveFormat) -> bool {
        self.shared.config.rates.contains(&format.sample_rate)
            && format.bits_per_sample <= self.shared.config.max_bits
            && format.channels >= 1
            && format.channels <= 32
    }
}

impl RenderClient for SimRenderClient {
    fn is_format_supported(&self, _mode: ShareMode, format: &WaveFormat) -> bool {
        self.accepts(format)
    }

    fn device_period(&self) -> EngineResult<DevicePeriod> {
        Ok(DevicePeriod {
            default_hns: 100_000, // 10 ms
            min_hns: 30_000,      // 3 ms
        })
    }

    fn initialize(
        &mut self,
        mode: ShareMode,
        format: &WaveFormat,
        duration_hns: i64,
    ) -> Result<(), ClientInitError> {
        if !self.accepts(format) {
            return Err(ClientInitError::FormatRejected);
        }

        let effective_hns = if duration_hns == 0 {
            if mode == ShareMode::Exclusive {
                return Err(ClientInitError::Endpoint(
                    "exclusive mode needs an explicit duration".to_string(),
                ));
            }
            100_000
        } else {
            duration_hns
        };

        let frames =
            (effective_hns as f64 / 10_000_000.0 * f64::from(format.sample_rate)).round() as usize;

        if mode == ShareMode::Exclusive
            && let Some(align) = self.shared.config.alignment_frames
            && frames % align != 0
        {
            let aligned_frames = frames.div_ceil(align) * align;
            return Err(ClientInitError::BufferSizeNotAligned { aligned_frames });
        }

        self.negotiated = Some(Negotiated {
            format: *format,
            frames: frames.max(1),
        });
        Ok(())
    }

    fn buffer_frames(&self) -> EngineResult<usize> {
        self.negotiated
            .as_ref()
            .map(|n| n.frames)
            .ok_or_else(|| EngineError::endpoint(&self.shared.config.id, "not initialized"))
    }

    fn set_buffer_event(&mut self, event: BufferEvent) -> EngineResult<()> {
        *self.shared.event.lock().expect("sim lock") = Some(event);
        Ok(())
    }

    fn start(&mut self) -> EngineResult<()> {
        let negotiated = self
            .negotiated
            .as_ref()
            .ok_or_else(|| EngineError::endpoint(&self.shared.config.id, "not initialized"))?;
        if self.shared.config.manual_pacing {
            return Ok(());
        }

        let period = Duration::from_secs_f64(
            negotiated.frames as f64 / f64::from(negotiated.format.sample_rate),
        );
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.pacer_stop);
        self.pacer = Some(thread::spawn(move || {
            // Deadline pacing so the long-run event rate matches the sample
            // rate exactly. The preloaded buffer plays for one period while
            // the endpoint still owns a second buffer of slack, so the
            // first buffer-due event lands after two periods.
            let mut next = std::time::Instant::now() + 2 * period;
            while !stop.load(Ordering::SeqCst) {
                let now = std::time::Instant::now();
                if now < next {
                    thread::sleep((next - now).min(period));
                    continue;
                }
                next += period;
                // A long wedge leaves a backlog; resync instead of bursting.
                if now > next + 4 * period {
                    next = now + period;
                }
                if !shared.wedged.load(Ordering::SeqCst)
                    && let Some(event) = shared.event.lock().expect("sim lock").as_ref()
                {
                    event.signal();
                }
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<()> {
        self.pacer_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pacer.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn current_padding(&self) -> EngineResult<usize> {
        Ok(0)
    }

    fn write_frames(&mut self, frames: usize, data: &[u8]) -> EngineResult<()> {
        let negotiated = self
            .negotiated
            .as_ref()
            .ok_or_else(|| EngineError::endpoint(&self.shared.config.id, "not initialized"))?;
        let format = negotiated.format;
        let expected = frames * format.frame_bytes();
        if data.len() != expected {
            return Err(EngineError::endpoint(
                &self.shared.config.id,
                format!("write of {} bytes, expected {}", data.len(), expected),
            ));
        }

        let mut log = self.shared.written.lock().expect("sim lock");
        match format.bits_per_sample {
            16 => {
                for pair in data.chunks_exact(2) {
                    log.samples.push(i32::from(i16::from_le_bytes([pair[0], pair[1]])));
                }
            }
            32 => {
                for quad in data.chunks_exact(4) {
                    log.samples
                        .push(i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]));
                }
            }
            other => {
                return Err(EngineError::endpoint(
                    &self.shared.config.id,
                    format!("unexpected container size {other}"),
                ));
            }
        }
        log.frames += frames as u64;
        Ok(())
    }
}

impl Drop for SimRenderClient {
    fn drop(&mut self) {
        let _ = RenderClient::stop(self);
    }
}

struct SimCaptureClient {
    shared: Arc<SimEndpointShared>,
    format: WaveFormat,
}

impl CaptureClient for SimCaptureClient {
    fn format(&self) -> WaveFormat {
        self.format
    }

    fn buffer_frames(&self) -> usize {
        480
    }

    fn start(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn read_packet(&mut self) -> EngineResult<Option<CapturePacket>> {
        Ok(self
            .shared
            .capture_queue
            .lock()
            .expect("sim lock")
            .pop_front())
    }
}

struct SimVolumeControl {
    shared: Arc<SimEndpointShared>,
}

impl VolumeControl for SimVolumeControl {
    fn get(&self) -> EngineResult<(f32, bool)> {
        Ok(*self.shared.volume.lock().expect("sim lock"))
    }

    fn set_volume(&self, volume: f32) -> EngineResult<()> {
        self.shared.volume.lock().expect("sim lock").0 = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn set_mute(&self, mute: bool) -> EngineResult<()> {
        self.shared.volume.lock().expect("sim lock").1 = mute;
        Ok(())
    }
}
