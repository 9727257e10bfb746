//! Prepared playback state: allocated host buffers, not necessarily running.
//!
//! `PreparedState` owns the double-buffered host blocks and, while started,
//! a [`RunningState`]. The running side never holds the prepared state
//! itself — it gets a [`HostLink`] with just the buffers and the callback
//! table, keeping ownership acyclic.

use std::sync::Arc;

use tracing::{debug, error};

use crate::EngineSettings;
use crate::endpoint::{AudioSystem, EndpointDescriptor};
use crate::keys::KeyEventSource;
use crate::running::RunningState;
use crate::shared::{HostCallbacks, HostLink, SamplePosition, SharedBuffers};

/// Everything a `PreparedState` needs to build playback machinery.
pub struct PreparedContext {
    /// The system audio layer.
    pub system: Arc<dyn AudioSystem>,
    /// Resolved target endpoints, primary first.
    pub devices: Vec<EndpointDescriptor>,
    /// Engine-relevant settings.
    pub settings: Arc<EngineSettings>,
    /// Engine sample rate in Hz.
    pub sample_rate: u32,
    /// Host block size in frames.
    pub block_size: usize,
    /// Keystroke event feed.
    pub key_source: Arc<dyn KeyEventSource>,
    /// Clap WAV blobs, decoded at start.
    pub clap_sounds: Arc<Vec<Vec<u8>>>,
}

impl std::fmt::Debug for PreparedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedContext")
            .field("devices", &self.devices.len())
            .field("sample_rate", &self.sample_rate)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

/// Host-side buffers plus the start/stop machinery around [`RunningState`].
pub struct PreparedState {
    ctx: PreparedContext,
    shared: Arc<SharedBuffers>,
    callbacks: Arc<dyn HostCallbacks>,
    running: Option<RunningState>,
}

impl PreparedState {
    /// Allocate the zeroed double buffer for `ctx.settings.channel_count`
    /// channels of `ctx.block_size` frames.
    pub fn new(ctx: PreparedContext, callbacks: Arc<dyn HostCallbacks>) -> Self {
        let shared = Arc::new(SharedBuffers::new(
            usize::from(ctx.settings.channel_count),
            ctx.block_size,
        ));
        Self {
            ctx,
            shared,
            callbacks,
            running: None,
        }
    }

    /// The double buffer the host writes into.
    pub fn shared_buffers(&self) -> Arc<SharedBuffers> {
        Arc::clone(&self.shared)
    }

    /// Host block size in frames.
    pub fn block_size(&self) -> usize {
        self.ctx.block_size
    }

    /// Engine sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.ctx.sample_rate
    }

    /// Whether playback is live.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Begin playback. Re-entrant: returns `true` when already running.
    ///
    /// Resets the sample position and buffer index, then constructs the
    /// [`RunningState`]; any construction failure is logged and reported as
    /// `false`, leaving the state prepared-but-stopped.
    pub fn start(&mut self) -> bool {
        if self.running.is_some() {
            return true;
        }
        debug!("starting playback");
        self.shared.reset();

        let link = HostLink {
            shared: Arc::clone(&self.shared),
            callbacks: Arc::clone(&self.callbacks),
        };
        match RunningState::new(&self.ctx, link) {
            Ok(running) => {
                self.running = Some(running);
                true
            }
            Err(e) => {
                error!(error = %e, "cannot create running state");
                false
            }
        }
    }

    /// Stop playback; the running state's drop joins the poll thread and
    /// every sink render thread before this returns.
    pub fn stop(&mut self) -> bool {
        debug!("stopping playback");
        self.running = None;
        true
    }

    /// The host finished writing the current block.
    pub fn output_ready(&self) {
        if let Some(running) = &self.running {
            running.signal_output_ready();
        }
    }

    /// Ask the host to drive a reset cycle.
    pub fn request_reset(&self) {
        self.callbacks.reset_request();
    }

    /// Capture the switch timestamp and invoke the host's `bufferSwitch`.
    pub fn buffer_switch(&self, index: usize, direct_process: bool) {
        HostLink {
            shared: Arc::clone(&self.shared),
            callbacks: Arc::clone(&self.callbacks),
        }
        .buffer_switch(index, direct_process);
    }

    /// The `(samples, timestamp)` pair captured at the most recent switch.
    pub fn sample_position(&self) -> SamplePosition {
        self.shared.sample_position()
    }

    /// Sink incident counters when running, primary first.
    pub fn sink_stats(&self) -> Vec<Arc<crate::sink::SinkStats>> {
        self.running
            .as_ref()
            .map(|r| r.sink_stats().to_vec())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for PreparedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedState")
            .field("block_size", &self.ctx.block_size)
            .field("sample_rate", &self.ctx.sample_rate)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::sim::{SimAudioSystem, SimEndpointConfig};
    use crate::keys::CountingKeySource;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct RecordingHost {
        switches: AtomicU64,
        resets: AtomicU64,
    }

    impl HostCallbacks for RecordingHost {
        fn buffer_switch(&self, _index: usize, _direct: bool) {
            self.switches.fetch_add(1, Ordering::SeqCst);
        }
        fn reset_request(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn prepared(sim: &SimAudioSystem) -> (PreparedState, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost {
            switches: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        });
        let system: Arc<dyn AudioSystem> = Arc::new(sim.clone());
        let devices = sim.endpoints().unwrap();
        let ctx = PreparedContext {
            system,
            devices,
            settings: Arc::new(EngineSettings {
                channel_count: 2,
                clap_gain: 0.0,
                throttle: true,
                duration_overrides: std::collections::BTreeMap::new(),
                loopback_source: None,
                intercept_default_output: false,
            }),
            sample_rate: 48000,
            block_size: 64,
            key_source: Arc::new(CountingKeySource::new()),
            clap_sounds: Arc::new(Vec::new()),
        };
        (PreparedState::new(ctx, host.clone()), host)
    }

    #[test]
    fn buffers_start_zeroed_with_index_zero() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let (state, _) = prepared(&sim);
        let shared = state.shared_buffers();
        assert_eq!(shared.buffer_index(), 0);
        shared.with_block(0, |b| assert!(b.iter().all(|ch| ch.iter().all(|&s| s == 0))));
        shared.with_block(1, |b| assert!(b.iter().all(|ch| ch.iter().all(|&s| s == 0))));
        assert_eq!(state.sample_position(), SamplePosition::default());
    }

    #[test]
    fn switch_sequence_alternates_with_monotonic_position() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let (state, host) = prepared(&sim);

        let mut last_ts = 0;
        for k in 1..=6u64 {
            let index = (k & 1) as usize;
            state.buffer_switch(index, true);
            let pos = state.sample_position();
            assert_eq!(pos.samples, k * 64);
            assert!(pos.timestamp_nanos >= last_ts);
            last_ts = pos.timestamp_nanos;
        }
        assert_eq!(host.switches.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn start_is_reentrant_and_stop_resets() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let (mut state, _) = prepared(&sim);

        assert!(state.start());
        assert!(state.is_running());
        assert!(state.start(), "second start is a no-op success");

        assert!(state.stop());
        assert!(!state.is_running());

        // A fresh start resets the frame counter.
        assert!(state.start());
        let pos = state.sample_position();
        assert!(pos.samples < 64 * 4, "position was not reset: {:?}", pos);
        state.stop();
    }

    #[test]
    fn start_failure_leaves_prepared_state_intact() {
        // One good endpoint, but the settings ask for a rate nothing accepts.
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("a", "Alpha").with_rates(&[44100]),
        ]);
        let (mut state, _) = prepared(&sim); // ctx sample rate is 48000
        assert!(!state.start());
        assert!(!state.is_running());
        // Still usable as a prepared state.
        assert!(state.shared_buffers().write_channel(0, 0, &[0; 64]));
    }

    #[test]
    fn request_reset_reaches_the_host() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let (state, host) = prepared(&sim);
        state.request_reset();
        assert_eq!(host.resets.load(Ordering::SeqCst), 1);
    }
}
