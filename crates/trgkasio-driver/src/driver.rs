//! The host-facing driver facade.
//!
//! State machine:
//!
//! ```text
//! Loaded ──init()──▶ Initialized
//! Initialized ──create_buffers──▶ Prepared
//! Prepared ──start──▶ Running
//! Running ──stop──▶ Prepared
//! Prepared ──dispose_buffers──▶ Initialized
//! any state ──drop──▶ Loaded
//! ```
//!
//! Calls invalid for the current state return
//! [`DriverError::NotPresent`] / [`DriverError::InvalidMode`]; failures
//! leave the driver in its previous well-defined state.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use trgkasio_engine::endpoint::{AudioSystem, EndpointDescriptor, EndpointId};
use trgkasio_engine::negotiate::probe_stream_format;
use trgkasio_engine::sink::SinkStats;
use trgkasio_engine::{
    CountingKeySource, EngineSettings, HostCallbacks, PreparedContext, PreparedState,
    SamplePosition, ShareMode, SharedBuffers,
};

use crate::assets;
use crate::host::{
    BUFFER_SIZE_RANGE, BufferRequest, BufferSizeRange, CHANNEL_NAMES, ChannelInfo, ClockSource,
    DriverError, DriverResult, SampleType, clock_sources,
};
use crate::settings::{DEFAULT_DEVICE, DriverSettings, SettingsError};

/// Everything that exists from `init` onward.
struct DriverCore {
    settings: DriverSettings,
    devices: Vec<EndpointDescriptor>,
    sample_rate: u32,
    pending_sample_rate: Option<u32>,
    key_source: Arc<CountingKeySource>,
    prepared: Option<PreparedState>,
}

/// The driver facade. Construct with an audio system, then `init`.
///
/// Only one thread (the host thread) may mutate the facade; everything
/// real-time happens on threads owned by the prepared/running states.
pub struct Driver {
    system: Arc<dyn AudioSystem>,
    settings_path: Option<PathBuf>,
    core: Option<DriverCore>,
    last_error: String,
}

impl Driver {
    /// A driver in the Loaded state, reading settings from the default
    /// location at `init`.
    pub fn new(system: Arc<dyn AudioSystem>) -> Self {
        Self {
            system,
            settings_path: DriverSettings::default_path(),
            core: None,
            last_error: String::new(),
        }
    }

    /// Like [`Driver::new`] with an explicit settings file location.
    pub fn with_settings_path(system: Arc<dyn AudioSystem>, path: PathBuf) -> Self {
        Self {
            system,
            settings_path: Some(path),
            core: None,
            last_error: String::new(),
        }
    }

    /// Driver name, NUL-free, under 32 bytes.
    pub fn driver_name(&self) -> &'static str {
        crate::host::DRIVER_NAME
    }

    /// Driver version.
    pub fn driver_version(&self) -> u32 {
        crate::host::DRIVER_VERSION
    }

    /// The most recent fatal failure reason, truncated for the host's
    /// fixed-size message buffer.
    pub fn error_message(&self) -> String {
        let mut message = self.last_error.clone();
        if message.len() > 124 {
            let mut cut = 124;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        message
    }

    fn fail<T>(&mut self, error: DriverError) -> DriverResult<T> {
        self.last_error = error.to_string();
        Err(error)
    }

    /// Initialize: set up logging, load settings, resolve target endpoints.
    ///
    /// Returns `false` on failure (reason logged and kept for
    /// [`Driver::error_message`]); repeated calls return `true` once
    /// initialized.
    pub fn init(&mut self) -> bool {
        if self.core.is_some() {
            return true;
        }

        let settings = match &self.settings_path {
            Some(path) => DriverSettings::load(path),
            None => Ok(DriverSettings::default()),
        };
        let settings = match settings {
            Ok(settings) => settings,
            Err(e) => {
                self.last_error = e.to_string();
                error!(error = %e, "settings load failed");
                return false;
            }
        };

        init_logging(&settings);
        info!(name = self.driver_name(), "starting driver");

        match self.build_core(settings) {
            Ok(core) => {
                self.core = Some(core);
                true
            }
            Err(e) => {
                self.last_error = e.clone();
                error!(error = %e, "driver initialization failed");
                false
            }
        }
    }

    /// Initialize with settings supplied directly (bypassing the file).
    pub fn init_with_settings(&mut self, settings: DriverSettings) -> bool {
        if self.core.is_some() {
            return true;
        }
        init_logging(&settings);
        match self.build_core(settings) {
            Ok(core) => {
                self.core = Some(core);
                true
            }
            Err(e) => {
                self.last_error = e.clone();
                error!(error = %e, "driver initialization failed");
                false
            }
        }
    }

    fn build_core(&self, settings: DriverSettings) -> Result<DriverCore, String> {
        let all = self
            .system
            .endpoints()
            .map_err(|e| format!("endpoint enumeration failed: {e}"))?;
        let default = self.system.default_output().ok();

        info!(total = all.len(), "enumerating endpoints");
        for (i, endpoint) in all.iter().enumerate() {
            info!(" - device #{i:02}: {} [{}]", endpoint.friendly_name, endpoint.id);
        }

        // Resolve the configured list, in order: the default-device alias,
        // then id match, then friendly-name match.
        let mut devices = Vec::new();
        for wanted in &settings.device_ids {
            let resolved = if wanted.is_empty() || wanted == DEFAULT_DEVICE {
                default.clone()
            } else {
                all.iter()
                    .find(|d| &d.id.0 == wanted || &d.friendly_name == wanted)
                    .cloned()
            };
            match resolved {
                Some(endpoint) => {
                    if !devices.contains(&endpoint) {
                        info!(device = %endpoint.id, "matched output endpoint");
                        devices.push(endpoint);
                    }
                }
                None => warn!(device = %wanted, "configured endpoint not found"),
            }
        }

        if devices.is_empty() {
            return Err("no target device(s) found".to_string());
        }

        Ok(DriverCore {
            sample_rate: settings.sample_rate,
            settings,
            devices,
            pending_sample_rate: None,
            key_source: Arc::new(CountingKeySource::new()),
            prepared: None,
        })
    }

    fn core(&self) -> DriverResult<&DriverCore> {
        self.core.as_ref().ok_or(DriverError::NotPresent)
    }

    fn core_mut(&mut self) -> DriverResult<&mut DriverCore> {
        self.core.as_mut().ok_or(DriverError::NotPresent)
    }

    /// `(inputs, outputs)` channel counts; inputs are always 0.
    pub fn channels(&self) -> DriverResult<(u32, u32)> {
        let core = self.core()?;
        Ok((0, u32::from(core.settings.channel_count)))
    }

    /// `(input, output)` latencies in frames.
    pub fn latencies(&self) -> DriverResult<(u32, u32)> {
        let core = self.core()?;
        let prepared = core.prepared.as_ref().ok_or(DriverError::NotPresent)?;
        let block = prepared.block_size() as u32;
        Ok((block, 2 * block))
    }

    /// Advertised block size constraints.
    pub fn buffer_size_range(&self) -> DriverResult<BufferSizeRange> {
        self.core()?;
        Ok(BUFFER_SIZE_RANGE)
    }

    /// Whether every configured endpoint accepts `rate`.
    pub fn can_sample_rate(&self, rate: u32) -> DriverResult<()> {
        let core = self.core()?;
        for (i, device) in core.devices.iter().enumerate() {
            let mode = if i == 0 {
                ShareMode::Exclusive
            } else {
                ShareMode::Shared
            };
            if !probe_stream_format(
                self.system.as_ref(),
                device,
                core.settings.channel_count,
                rate,
                mode,
            ) {
                debug!(rate, endpoint = %device.id, "sample rate refused");
                return Err(DriverError::NoClock);
            }
        }
        Ok(())
    }

    /// The current sample rate.
    pub fn sample_rate(&self) -> DriverResult<u32> {
        Ok(self.core()?.sample_rate)
    }

    /// Change the sample rate.
    ///
    /// With prepared buffers in place the change is parked and a
    /// `ResetRequest` is sent instead: the host is expected to dispose and
    /// re-create buffers, at which point the parked rate takes effect.
    pub fn set_sample_rate(&mut self, rate: u32) -> DriverResult<()> {
        if self.core.is_none() {
            return Err(DriverError::NotPresent);
        }
        if rate == 0 {
            // External sync request; this driver only has its internal clock.
            debug!("setSampleRate(0) refused, no external clock");
            return self.fail(DriverError::NoClock);
        }
        if self.core()?.sample_rate == rate {
            return Ok(());
        }
        if self.can_sample_rate(rate).is_err() {
            return self.fail(DriverError::NoClock);
        }

        let core = self.core_mut()?;
        if core.prepared.is_some() {
            info!(rate, "sample rate change deferred behind host reset");
            core.pending_sample_rate = Some(rate);
            if let Some(prepared) = &core.prepared {
                prepared.request_reset();
            }
        } else {
            info!(rate, "sample rate changed");
            core.sample_rate = rate;
        }
        Ok(())
    }

    /// The clock source list (always exactly the internal clock).
    pub fn clock_sources(&self) -> DriverResult<Vec<ClockSource>> {
        Ok(clock_sources())
    }

    /// Select a clock source; only index 0 exists.
    pub fn set_clock_source(&self, index: u32) -> DriverResult<()> {
        if index == 0 {
            Ok(())
        } else {
            Err(DriverError::NotPresent)
        }
    }

    /// The `(samples, timestamp)` pair captured at the latest buffer switch.
    pub fn sample_position(&self) -> DriverResult<SamplePosition> {
        let core = self.core()?;
        let prepared = core.prepared.as_ref().ok_or(DriverError::NotPresent)?;
        Ok(prepared.sample_position())
    }

    /// Host-visible description of one channel.
    pub fn channel_info(&self, channel: usize, is_input: bool) -> DriverResult<ChannelInfo> {
        let core = self.core()?;
        if is_input || channel >= usize::from(core.settings.channel_count) {
            return Err(DriverError::InvalidParameter);
        }
        Ok(ChannelInfo {
            channel,
            is_input: false,
            is_active: core.prepared.is_some(),
            channel_group: 0,
            sample_type: SampleType::Int32Lsb,
            name: CHANNEL_NAMES
                .get(channel)
                .copied()
                .unwrap_or("Unknown")
                .to_string(),
        })
    }

    /// Allocate host buffers and register the callback table.
    ///
    /// Returns the shared double buffer the host writes into; any existing
    /// prepared state is disposed first.
    pub fn create_buffers(
        &mut self,
        requests: &[BufferRequest],
        block_size: usize,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> DriverResult<Arc<SharedBuffers>> {
        let channel_count = {
            let core = self.core()?;
            usize::from(core.settings.channel_count)
        };

        if requests.is_empty() || requests.len() > channel_count {
            return self.fail(DriverError::InvalidParameter);
        }
        for request in requests {
            if request.is_input || request.channel >= channel_count {
                return self.fail(DriverError::InvalidMode);
            }
        }

        self.dispose_buffers()?;

        let system = Arc::clone(&self.system);
        let core = self.core_mut()?;
        let engine_settings = EngineSettings {
            channel_count: core.settings.channel_count,
            clap_gain: core.settings.clap_gain,
            throttle: core.settings.throttle,
            duration_overrides: core.settings.duration_overrides.clone(),
            loopback_source: if core.settings.loopback_input_device.is_empty() {
                None
            } else {
                Some(EndpointId(core.settings.loopback_input_device.clone()))
            },
            intercept_default_output: core.settings.auto_change_output_to_loopback,
        };

        let ctx = PreparedContext {
            system,
            devices: core.devices.clone(),
            settings: Arc::new(engine_settings),
            sample_rate: core.sample_rate,
            block_size,
            key_source: core.key_source.clone(),
            clap_sounds: Arc::new(assets::clap_sounds()),
        };

        let prepared = PreparedState::new(ctx, callbacks);
        let shared = prepared.shared_buffers();
        core.prepared = Some(prepared);
        debug!(block_size, "buffers created");
        Ok(shared)
    }

    /// Stop and release the prepared state; a parked sample-rate change
    /// takes effect here.
    pub fn dispose_buffers(&mut self) -> DriverResult<()> {
        let core = self.core_mut()?;
        if let Some(mut prepared) = core.prepared.take() {
            prepared.stop();
            debug!("buffers disposed");
        }
        if let Some(rate) = core.pending_sample_rate.take() {
            info!(rate, "deferred sample rate applied");
            core.sample_rate = rate;
        }
        Ok(())
    }

    /// Begin playback.
    pub fn start(&mut self) -> DriverResult<()> {
        let started = {
            let core = self.core_mut()?;
            let prepared = core.prepared.as_mut().ok_or(DriverError::NotPresent)?;
            prepared.start()
        };
        if started {
            Ok(())
        } else {
            self.fail(DriverError::HwMalfunction(
                "cannot create running state".to_string(),
            ))
        }
    }

    /// Stop playback; joins every engine thread before returning.
    pub fn stop(&mut self) -> DriverResult<()> {
        let core = self.core_mut()?;
        if let Some(prepared) = core.prepared.as_mut() {
            prepared.stop();
        }
        Ok(())
    }

    /// The host finished writing the current block.
    pub fn output_ready(&self) -> DriverResult<()> {
        if let Some(core) = &self.core
            && let Some(prepared) = &core.prepared
        {
            prepared.output_ready();
        }
        Ok(())
    }

    /// Optional host-API extensions; none are implemented.
    pub fn future(&self, _selector: u32) -> DriverResult<()> {
        Err(DriverError::NotPresent)
    }

    /// The configuration surface lives outside the driver; acknowledge.
    pub fn control_panel(&self) -> DriverResult<()> {
        info!("control panel requested; configuration is external");
        Ok(())
    }

    /// Whether prepared buffers currently exist.
    pub fn is_prepared(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|core| core.prepared.is_some())
    }

    /// Whether playback is live.
    pub fn is_running(&self) -> bool {
        self.core
            .as_ref()
            .and_then(|core| core.prepared.as_ref())
            .is_some_and(PreparedState::is_running)
    }

    /// The keystroke counter feeding the clap renderer; hosts wire their
    /// capture mechanism to this.
    pub fn key_source(&self) -> DriverResult<Arc<CountingKeySource>> {
        Ok(Arc::clone(&self.core()?.key_source))
    }

    /// Per-sink incident counters while running, primary first.
    pub fn sink_stats(&self) -> Vec<Arc<SinkStats>> {
        self.core
            .as_ref()
            .and_then(|core| core.prepared.as_ref())
            .map(PreparedState::sink_stats)
            .unwrap_or_default()
    }

    /// The endpoints resolved at `init`, primary first.
    pub fn target_devices(&self) -> DriverResult<Vec<EndpointDescriptor>> {
        Ok(self.core()?.devices.clone())
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.core.is_some() {
            info!("stopping driver");
            let _ = self.stop();
            let _ = self.dispose_buffers();
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("initialized", &self.core.is_some())
            .field("prepared", &self.is_prepared())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn init_logging(settings: &DriverSettings) {
    // Hosts may already carry a subscriber; losing this race is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(settings.log_level.filter_str()))
        .try_init();
}

/// Map a settings failure into the facade's error vocabulary.
impl From<SettingsError> for DriverError {
    fn from(e: SettingsError) -> Self {
        DriverError::HwMalfunction(e.to_string())
    }
}
