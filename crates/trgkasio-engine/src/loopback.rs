//! Loopback capture of another endpoint, resampled into the mix.
//!
//! A fetch thread pulls native-rate packets from the capture endpoint,
//! converts them to normalized doubles, resamples every channel to the
//! engine rate, and queues the result in per-channel rings. The poll loop
//! drains the rings once per block through [`LoopbackSource::render`].
//!
//! When the "intercept default output" flag is set, the source endpoint
//! becomes the system default for the lifetime of this object: applications
//! play into it, this driver captures what they play, and a small
//! volume-sync thread mirrors the source's volume onto the previously
//! default endpoint while keeping the source itself muted so nothing is
//! heard twice. Everything is restored on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use trgkasio_core::{Resampler, RingBuffer};

use crate::endpoint::{
    AudioSystem, CaptureClient, EndpointDescriptor, EndpointId, VolumeControl,
};
use crate::error::{EngineError, EngineResult};

/// Scale from normalized double to the 24-bit-headroom mix domain.
const MIX_SCALE: f64 = (1 << 23) as f64;

/// Scale from 32-bit capture samples to normalized doubles.
const I32_SCALE: f64 = 2147483648.0;

const VOLUME_SYNC_INTERVAL: Duration = Duration::from_millis(10);
const FETCH_IDLE_SLEEP: Duration = Duration::from_millis(1);

struct InterceptState {
    system: Arc<dyn AudioSystem>,
    prev_default: EndpointId,
    prev_ctl: Arc<dyn VolumeControl>,
    prev_state: (f32, bool),
    source_ctl: Arc<dyn VolumeControl>,
    source_state: (f32, bool),
}

/// Captured audio from another endpoint, ready to mix.
pub struct LoopbackSource {
    source_id: EndpointId,
    channels: usize,
    rings: Arc<Mutex<Vec<RingBuffer<f64>>>>,
    stop: Arc<AtomicBool>,
    fetch_thread: Option<thread::JoinHandle<()>>,
    volume_thread: Option<thread::JoinHandle<()>>,
    intercept: Option<InterceptState>,
    scratch: Vec<f64>,
}

impl LoopbackSource {
    /// Open loopback capture of `source` and start fetching.
    ///
    /// With `intercept_default_output`, the current default output is
    /// recorded and `source` installed in its place until drop.
    pub fn new(
        system: &Arc<dyn AudioSystem>,
        source: &EndpointDescriptor,
        channels: u16,
        core_sample_rate: u32,
        intercept_default_output: bool,
    ) -> EngineResult<Self> {
        let mut capture = system.activate_loopback(&source.id, channels)?;
        let native_rate = capture.format().sample_rate;
        let buffer_frames = capture.buffer_frames();

        info!(
            source = %source.id,
            native_rate,
            core_sample_rate,
            buffer_frames,
            "loopback capture opened"
        );

        let ring_capacity = (buffer_frames + 1024) * 2;
        let rings = Arc::new(Mutex::new(
            (0..channels)
                .map(|_| RingBuffer::new(ring_capacity))
                .collect::<Vec<_>>(),
        ));
        let resamplers: Vec<Resampler> = (0..channels)
            .map(|_| Resampler::new(native_rate, core_sample_rate))
            .collect();

        let stop = Arc::new(AtomicBool::new(false));

        let intercept = if intercept_default_output {
            Some(Self::install_intercept(system, source)?)
        } else {
            None
        };

        let volume_thread = intercept.as_ref().map(|state| {
            let prev_ctl = Arc::clone(&state.prev_ctl);
            let source_ctl = Arc::clone(&state.source_ctl);
            let stop = Arc::clone(&stop);
            thread::spawn(move || volume_sync_loop(&prev_ctl, &source_ctl, &stop))
        });

        capture.start()?;

        let spawn_result = {
            let rings = Arc::clone(&rings);
            let stop = Arc::clone(&stop);
            let source_id = source.id.clone();
            thread::Builder::new()
                .name(format!("loopback-{}", source.id))
                .spawn(move || {
                    fetch_loop(capture, resamplers, &rings, &stop, &source_id);
                })
        };
        let fetch_thread = match spawn_result {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                if let Some(handle) = volume_thread {
                    let _ = handle.join();
                }
                if let Some(state) = intercept {
                    restore_intercept(state);
                }
                return Err(EngineError::ThreadStart(e.to_string()));
            }
        };

        Ok(Self {
            source_id: source.id.clone(),
            channels: usize::from(channels),
            rings,
            stop,
            fetch_thread: Some(fetch_thread),
            volume_thread,
            intercept,
            scratch: Vec::new(),
        })
    }

    fn install_intercept(
        system: &Arc<dyn AudioSystem>,
        source: &EndpointDescriptor,
    ) -> EngineResult<InterceptState> {
        let prev_default = system.default_output()?.id;
        let prev_ctl: Arc<dyn VolumeControl> = Arc::from(system.volume_control(&prev_default)?);
        let source_ctl: Arc<dyn VolumeControl> = Arc::from(system.volume_control(&source.id)?);

        let prev_state = prev_ctl.get().unwrap_or((0.0, false));
        let source_state = source_ctl.get().unwrap_or((1.0, false));

        // Shadow the audible volume onto the capture endpoint so volume-key
        // presses land somewhere visible, but keep it muted: the audible
        // signal comes back out of our own sinks.
        let shadow = match prev_ctl.get() {
            Ok((volume, false)) => volume,
            Ok((_, true)) => 0.0,
            Err(_) => {
                warn!("cannot read intercepted output volume, silencing");
                0.0
            }
        };
        source_ctl.set_mute(true)?;
        source_ctl.set_volume(shadow)?;

        system.set_default_output(&source.id)?;
        info!(
            source = %source.id,
            previous = %prev_default,
            "default output redirected to loopback source"
        );

        Ok(InterceptState {
            system: Arc::clone(system),
            prev_default,
            prev_ctl,
            prev_state,
            source_ctl,
            source_state,
        })
    }

    /// The endpoint being captured.
    pub fn source_id(&self) -> &EndpointId {
        &self.source_id
    }

    /// Drain up to one block of captured audio into `mix`, additively.
    ///
    /// Channels for which less data than the block is queued contribute
    /// silence for the missing tail; that underrun is logged, not fatal.
    pub fn render(&mut self, current_frame: u64, mix: &mut [Vec<i32>]) {
        debug_assert_eq!(mix.len(), self.channels);
        let out_len = mix[0].len();
        if self.scratch.len() < out_len {
            self.scratch.resize(out_len, 0.0);
        }

        let mut starved = 0usize;
        {
            let mut rings = self.rings.lock().expect("loopback rings poisoned");
            let avail = rings[0].size().min(out_len);
            if avail < out_len {
                starved = out_len - avail;
            }
            for (ring, channel) in rings.iter_mut().zip(mix.iter_mut()) {
                let ok = ring.get(&mut self.scratch[..avail]);
                debug_assert!(ok, "loopback rings diverged");
                for (out, &sample) in channel.iter_mut().zip(&self.scratch[..avail]) {
                    *out += (sample * MIX_SCALE).round() as i32;
                }
            }
        }

        if starved > 0 {
            warn!(
                source = %self.source_id,
                current_frame,
                missing = starved,
                "loopback capture not yet filled, padding with silence"
            );
        }
    }
}

impl Drop for LoopbackSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.fetch_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.volume_thread.take() {
            let _ = handle.join();
        }

        if let Some(state) = self.intercept.take() {
            restore_intercept(state);
        }
    }
}

fn restore_intercept(state: InterceptState) {
    if let Err(e) = state.system.set_default_output(&state.prev_default) {
        warn!(error = %e, "failed to restore default output");
    }
    let _ = state.prev_ctl.set_volume(state.prev_state.0);
    let _ = state.prev_ctl.set_mute(state.prev_state.1);
    let _ = state.source_ctl.set_volume(state.source_state.0);
    let _ = state.source_ctl.set_mute(state.source_state.1);
    info!(restored = %state.prev_default, "default output restored");
}

impl std::fmt::Debug for LoopbackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSource")
            .field("source_id", &self.source_id)
            .field("channels", &self.channels)
            .field("intercepting", &self.intercept.is_some())
            .finish_non_exhaustive()
    }
}

fn fetch_loop(
    mut capture: Box<dyn CaptureClient>,
    mut resamplers: Vec<Resampler>,
    rings: &Arc<Mutex<Vec<RingBuffer<f64>>>>,
    stop: &AtomicBool,
    source_id: &EndpointId,
) {
    let channels = resamplers.len();
    let mut deinterleaved: Vec<Vec<f64>> = vec![Vec::new(); channels];
    let mut resampled: Vec<Vec<f64>> = vec![Vec::new(); channels];

    while !stop.load(Ordering::SeqCst) {
        loop {
            let packet = match capture.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    warn!(source = %source_id, error = %e, "loopback fetch failed");
                    break;
                }
            };

            for (ch, buf) in deinterleaved.iter_mut().enumerate() {
                buf.clear();
                if packet.silent {
                    buf.resize(packet.frames, 0.0);
                } else {
                    buf.extend(
                        (0..packet.frames)
                            .map(|i| f64::from(packet.data[i * channels + ch]) / I32_SCALE),
                    );
                }
            }

            for (ch, resampler) in resamplers.iter_mut().enumerate() {
                resampled[ch].clear();
                let out = resampler.process(&deinterleaved[ch]);
                resampled[ch].extend_from_slice(out);
            }

            let out_len = resampled[0].len();
            let mut dropped = false;
            {
                let mut rings = rings.lock().expect("loopback rings poisoned");
                if rings[0].size() + out_len > rings[0].capacity() {
                    dropped = true;
                } else {
                    for (ring, channel) in rings.iter_mut().zip(resampled.iter()) {
                        let ok = ring.push(channel);
                        debug_assert!(ok, "loopback rings diverged");
                    }
                }
            }
            if dropped {
                debug!(
                    source = %source_id,
                    frames = out_len,
                    "loopback ring overflow, dropping packet"
                );
            }
        }

        thread::sleep(FETCH_IDLE_SLEEP);
    }

    if let Err(e) = capture.stop() {
        warn!(source = %source_id, error = %e, "loopback capture stop failed");
    }
}

fn volume_sync_loop(
    prev_ctl: &Arc<dyn VolumeControl>,
    source_ctl: &Arc<dyn VolumeControl>,
    stop: &AtomicBool,
) {
    let mut last_volume = f32::MIN;
    while !stop.load(Ordering::SeqCst) {
        if let Ok((volume, _)) = source_ctl.get()
            && volume != last_volume
        {
            let _ = prev_ctl.set_volume(volume);
            let _ = source_ctl.set_mute(true);
            last_volume = volume;
        }
        thread::sleep(VOLUME_SYNC_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::sim::{SimAudioSystem, SimEndpointConfig};
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn two_endpoint_system() -> (Arc<dyn AudioSystem>, SimAudioSystem) {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("spk", "Speakers"),
            SimEndpointConfig::new("lb", "Capture Target"),
        ]);
        (Arc::new(sim.clone()), sim)
    }

    fn descriptor(sim: &SimAudioSystem, id: &str) -> EndpointDescriptor {
        sim.endpoints()
            .unwrap()
            .into_iter()
            .find(|d| d.id.0 == id)
            .unwrap()
    }

    #[test]
    fn captured_audio_lands_in_the_mix() {
        let (system, sim) = two_endpoint_system();
        let source = descriptor(&sim, "lb");
        let id = EndpointId::from("lb");

        // DC at quarter scale, stereo interleaved, native == core rate.
        let quarter = (I32_SCALE / 4.0) as i32;
        sim.push_capture(&id, 2, vec![quarter; 2 * 256]);

        let mut loopback = LoopbackSource::new(&system, &source, 2, 48000, false).unwrap();
        wait_for(|| loopback.rings.lock().unwrap()[0].size() >= 64);

        let mut mix = vec![vec![0i32; 64]; 2];
        loopback.render(0, &mut mix);

        let expected = (MIX_SCALE / 4.0).round() as i32;
        for channel in &mix {
            for &s in channel {
                assert!((s - expected).abs() <= 1, "sample {} vs {}", s, expected);
            }
        }
    }

    #[test]
    fn empty_capture_renders_silence() {
        let (system, sim) = two_endpoint_system();
        let source = descriptor(&sim, "lb");

        let mut loopback = LoopbackSource::new(&system, &source, 2, 48000, false).unwrap();
        let mut mix = vec![vec![0i32; 64]; 2];
        loopback.render(0, &mut mix);
        assert!(mix.iter().all(|ch| ch.iter().all(|&s| s == 0)));
    }

    #[test]
    fn intercept_redirects_and_restores_default_output() {
        let (system, sim) = two_endpoint_system();
        let source = descriptor(&sim, "lb");
        let lb = EndpointId::from("lb");
        let spk = EndpointId::from("spk");

        // Give the speakers a recognizable volume to shadow.
        sim.volume_control(&spk).unwrap().set_volume(0.75).unwrap();

        {
            let _loopback = LoopbackSource::new(&system, &source, 2, 48000, true).unwrap();
            assert_eq!(sim.default_output_id(), lb);

            let (volume, muted) = sim.volume_state(&lb);
            assert!(muted, "source endpoint must stay muted");
            assert!((volume - 0.75).abs() < 1e-6);
        }

        assert_eq!(sim.default_output_id(), spk);
        let (_, muted) = sim.volume_state(&lb);
        assert!(!muted, "source mute state must be restored");
    }

    #[test]
    fn volume_sync_mirrors_source_changes() {
        let (system, sim) = two_endpoint_system();
        let source = descriptor(&sim, "lb");
        let lb = EndpointId::from("lb");
        let spk = EndpointId::from("spk");

        let _loopback = LoopbackSource::new(&system, &source, 2, 48000, true).unwrap();

        // The user turns the (now default) capture endpoint's volume down.
        sim.volume_control(&lb).unwrap().set_volume(0.33).unwrap();
        wait_for(|| (sim.volume_state(&spk).0 - 0.33).abs() < 1e-6);
        assert!(sim.volume_state(&lb).1, "source stays muted");
    }

    #[test]
    fn resamples_native_rate_to_core_rate() {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("spk", "Speakers"),
            SimEndpointConfig::new("lb", "Capture Target").with_mix_rate(44100),
        ]);
        let system: Arc<dyn AudioSystem> = Arc::new(sim.clone());
        let source = descriptor(&sim, "lb");
        let id = EndpointId::from("lb");

        // Feed 441-frame packets; each resamples to ~480 frames at 48k.
        let quarter = (I32_SCALE / 4.0) as i32;
        for _ in 0..5 {
            sim.push_capture(&id, 2, vec![quarter; 2 * 441]);
        }

        let mut loopback = LoopbackSource::new(&system, &source, 2, 48000, false).unwrap();
        wait_for(|| loopback.rings.lock().unwrap()[0].size() >= 2048);

        let mut mix = vec![vec![0i32; 1024]; 2];
        loopback.render(0, &mut mix);
        // Settled region away from the filter warm-up should be near DC.
        let expected = (MIX_SCALE / 4.0).round() as i32;
        let settled = &mix[0][256..768];
        for &s in settled {
            assert!((s - expected).abs() <= 2, "sample {} vs {}", s, expected);
        }
    }
}
