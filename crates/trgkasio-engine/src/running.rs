//! The real-time poll loop.
//!
//! A `RunningState` owns one output sink per target endpoint (the first
//! exclusive, the rest shared), the clap renderer, the optional loopback
//! source, and the poll thread that paces host block delivery: wait for the
//! host's output-ready signal, copy the host block into the 24-bit-headroom
//! mix, flip the double buffer and fire `bufferSwitch`, mix auxiliary
//! sources, soft-clip, and fan the block out to every sink — then hold off
//! until the next block boundary on the monotonic clock.
//!
//! Dropping the `RunningState` signals stop and joins the poll thread; the
//! sinks and sources live on the poll thread, so their own teardown (which
//! joins the render and fetch threads) completes before the join returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{info, warn};

use trgkasio_core::clock::{self, MIN_TIMER_PERIOD};
use trgkasio_core::compress_block;

use crate::EngineSettings;
use crate::clap::{ClapRenderer, INDEX_KEYDOWN, INDEX_KEYUP};
use crate::endpoint::EndpointDescriptor;
use crate::error::{EngineError, EngineResult};
use crate::format::ShareMode;
use crate::keys::KeyEventCounts;
use crate::loopback::LoopbackSource;
use crate::prepared::PreparedContext;
use crate::shared::HostLink;
use crate::sink::{OutputSink, SinkStats};

const CLAP_QUEUE_SIZE: usize = 256;
const MAX_EVENTS_PER_SLOT: usize = 16;

#[derive(Debug, Clone, Copy)]
struct ClapSlot {
    start_frame: u64,
    start_time: f64,
    count: u8,
    events: [u8; MAX_EVENTS_PER_SLOT],
    active: bool,
}

impl ClapSlot {
    const EMPTY: Self = Self {
        start_frame: 0,
        start_time: 0.0,
        count: 0,
        events: [0; MAX_EVENTS_PER_SLOT],
        active: false,
    };
}

/// Fixed-size looping queue of pending clap events.
///
/// Intentionally overwrites after 256 slots rather than allocating: the slot
/// count caps how many clap effects can be in flight at once.
struct ClapQueue {
    slots: Vec<ClapSlot>,
    cursor: usize,
}

impl ClapQueue {
    fn new() -> Self {
        Self {
            slots: vec![ClapSlot::EMPTY; CLAP_QUEUE_SIZE],
            cursor: 0,
        }
    }

    /// File this tick's key events into the current slot. Key-downs are
    /// filed before key-ups; anything past the per-slot cap is dropped.
    fn record(&mut self, counts: KeyEventCounts, now: f64, current_frame: u64) {
        if counts.key_down == 0 && counts.key_up == 0 {
            return;
        }
        let slot = &mut self.slots[self.cursor];
        let mut filled = 0usize;
        for _ in 0..counts.key_down {
            if filled >= MAX_EVENTS_PER_SLOT {
                break;
            }
            slot.events[filled] = INDEX_KEYDOWN as u8;
            filled += 1;
        }
        for _ in 0..counts.key_up {
            if filled >= MAX_EVENTS_PER_SLOT {
                break;
            }
            slot.events[filled] = INDEX_KEYUP as u8;
            filled += 1;
        }
        slot.count = filled as u8;
        slot.start_time = now;
        slot.start_frame = current_frame;
        slot.active = true;
        self.cursor = (self.cursor + 1) % CLAP_QUEUE_SIZE;
    }

    /// Deactivate slots whose start time predates `cutoff_time`.
    fn gc(&mut self, cutoff_time: f64) {
        for slot in &mut self.slots {
            if slot.active && slot.start_time < cutoff_time {
                slot.active = false;
            }
        }
    }

    fn active_slots(&self) -> impl Iterator<Item = &ClapSlot> {
        self.slots.iter().filter(|s| s.active)
    }
}

#[derive(Debug, Default)]
struct PollFlags {
    stop: bool,
    output_ready: bool,
}

#[derive(Debug, Default)]
struct PollShared {
    state: Mutex<PollFlags>,
    cv: Condvar,
    // Mirror of `state.stop` readable without the lock from the busy-wait.
    stop_hint: AtomicBool,
}

struct PollContext {
    link: HostLink,
    sinks: Vec<OutputSink>,
    clap: ClapRenderer,
    loopback: Option<LoopbackSource>,
    key_source: Arc<dyn crate::keys::KeyEventSource>,
    flags: Arc<PollShared>,
    clap_gain: f64,
    throttle: bool,
    sample_rate: u32,
    block_size: usize,
}

/// The live playback machinery: sinks, auxiliary sources, and the poll
/// thread.
pub struct RunningState {
    flags: Arc<PollShared>,
    primary_output_buffer_size: usize,
    sink_stats: Vec<Arc<SinkStats>>,
    poll_thread: Option<thread::JoinHandle<()>>,
}

impl RunningState {
    /// Bring up one sink per device and start the poll thread.
    ///
    /// Sink construction failures tear down any sinks already built and
    /// propagate; the caller reports them as a hardware malfunction.
    pub fn new(ctx: &PreparedContext, link: HostLink) -> EngineResult<Self> {
        if ctx.devices.is_empty() {
            return Err(EngineError::EndpointNotFound("no target devices".to_string()));
        }
        let settings = &ctx.settings;
        let multiplier = if settings.throttle { 4 } else { 2 };

        let mut sinks = Vec::with_capacity(ctx.devices.len());
        for (i, device) in ctx.devices.iter().enumerate() {
            let mode = if i == 0 {
                ShareMode::Exclusive
            } else {
                ShareMode::Shared
            };
            let sink = OutputSink::new(
                ctx.system.as_ref(),
                device,
                settings.channel_count,
                ctx.sample_rate,
                ctx.block_size,
                mode,
                multiplier,
                &settings.duration_overrides,
            )?;
            sinks.push(sink);
        }

        let primary_output_buffer_size = sinks[0].output_buffer_size();
        info!(
            sample_rate = ctx.sample_rate,
            input_buffer = ctx.block_size,
            input_ms = 1000.0 * ctx.block_size as f64 / f64::from(ctx.sample_rate),
            output_buffer = primary_output_buffer_size,
            output_ms = 1000.0 * primary_output_buffer_size as f64 / f64::from(ctx.sample_rate),
            "playback running"
        );

        let clap = ClapRenderer::new(&ctx.clap_sounds, ctx.sample_rate);

        let loopback = match &settings.loopback_source {
            Some(id) => {
                let device = resolve_endpoint(ctx, id)?;
                Some(LoopbackSource::new(
                    &ctx.system,
                    &device,
                    settings.channel_count,
                    ctx.sample_rate,
                    settings.intercept_default_output,
                )?)
            }
            None => None,
        };

        let flags = Arc::new(PollShared::default());
        let sink_stats = sinks.iter().map(OutputSink::stats).collect();

        let poll_ctx = PollContext {
            link,
            sinks,
            clap,
            loopback,
            key_source: Arc::clone(&ctx.key_source),
            flags: Arc::clone(&flags),
            clap_gain: settings.clap_gain,
            throttle: settings.throttle,
            sample_rate: ctx.sample_rate,
            block_size: ctx.block_size,
        };

        let poll_thread = thread::Builder::new()
            .name("trgkasio-poll".to_string())
            .spawn(move || poll_loop(poll_ctx))
            .map_err(|e| EngineError::ThreadStart(e.to_string()))?;

        Ok(Self {
            flags,
            primary_output_buffer_size,
            sink_stats,
            poll_thread: Some(poll_thread),
        })
    }

    /// The host finished writing the current block.
    pub fn signal_output_ready(&self) {
        let mut state = self.flags.state.lock().expect("poll flags poisoned");
        state.output_ready = true;
        drop(state);
        self.flags.cv.notify_all();
    }

    /// Ask the poll thread to exit. Idempotent; `drop` also joins.
    pub fn signal_stop(&self) {
        let mut state = self.flags.state.lock().expect("poll flags poisoned");
        state.stop = true;
        drop(state);
        self.flags.stop_hint.store(true, Ordering::Release);
        self.flags.cv.notify_all();
    }

    /// The primary endpoint's negotiated buffer size in frames.
    pub fn primary_output_buffer_size(&self) -> usize {
        self.primary_output_buffer_size
    }

    /// Incident counters of every sink, primary first.
    pub fn sink_stats(&self) -> &[Arc<SinkStats>] {
        &self.sink_stats
    }
}

impl Drop for RunningState {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for RunningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningState").finish_non_exhaustive()
    }
}

fn resolve_endpoint(
    ctx: &PreparedContext,
    id: &crate::endpoint::EndpointId,
) -> EngineResult<EndpointDescriptor> {
    ctx.system
        .endpoints()?
        .into_iter()
        .find(|d| &d.id == id || d.friendly_name == id.0)
        .ok_or_else(|| EngineError::EndpointNotFound(id.0.clone()))
}

fn poll_loop(mut ctx: PollContext) {
    if let Err(err) = audio_thread_priority::promote_current_thread_to_real_time(
        ctx.block_size as u32,
        ctx.sample_rate,
    ) {
        warn!(error = ?err, "failed to promote poll thread");
    }

    let channels = ctx.link.shared.channels();
    let mut mix: Vec<Vec<i32>> = vec![vec![0i32; ctx.block_size]; channels];
    let mut clap_queue = ClapQueue::new();

    let poll_interval = ctx.block_size as f64 / f64::from(ctx.sample_rate);
    let mut last_poll_time = clock::seconds();
    let mut should_poll = true;
    let mut current_frame: u64 = 0;

    loop {
        let current_time = clock::seconds();

        clap_queue.record(
            ctx.key_source.poll_key_event_count(),
            current_time,
            current_frame,
        );
        clap_queue.gc(current_time - ctx.clap.max_clap_sound_length());

        let mut state = ctx.flags.state.lock().expect("poll flags poisoned");
        if state.stop {
            break;
        }

        if should_poll {
            while !state.output_ready && !state.stop {
                state = ctx
                    .flags
                    .cv
                    .wait(state)
                    .expect("poll flags poisoned");
            }
            if state.stop {
                break;
            }
            state.output_ready = false;
            should_poll = false;
            drop(state);

            process_one_block(&mut ctx, &mut mix, &clap_queue, current_frame);
            current_frame += ctx.block_size as u64;
        } else {
            drop(state);
            let target = last_poll_time + poll_interval;
            if current_time >= target {
                last_poll_time += poll_interval;
                should_poll = true;
            } else {
                wait_until(&ctx.flags, target, ctx.throttle);
            }
        }
    }
}

/// Hold off until `target` (seconds on the engine clock). The coarse part of
/// the gap is taken in minimum-timer-period chunks on the stop condvar so a
/// shutdown wakes the thread within one period; the sub-period remainder is
/// busy-waited (yield, or 1 ms sleeps when throttled).
fn wait_until(flags: &PollShared, target: f64, throttle: bool) {
    let min_period = MIN_TIMER_PERIOD.as_secs_f64();
    loop {
        if flags.stop_hint.load(Ordering::Acquire) {
            return;
        }
        let now = clock::seconds();
        if now >= target {
            return;
        }
        let remaining = target - now;
        if remaining > min_period {
            let state = flags.state.lock().expect("poll flags poisoned");
            if state.stop {
                return;
            }
            let _ = flags
                .cv
                .wait_timeout(state, MIN_TIMER_PERIOD)
                .expect("poll flags poisoned");
        } else if throttle {
            thread::sleep(MIN_TIMER_PERIOD);
        } else {
            thread::yield_now();
        }
    }
}

fn process_one_block(
    ctx: &mut PollContext,
    mix: &mut [Vec<i32>],
    clap_queue: &ClapQueue,
    current_frame: u64,
) {
    let shared = Arc::clone(&ctx.link.shared);

    // Pull the host's block, scaled to 24 bits with 15/16 pre-attenuation
    // so mixing and compression have headroom.
    let index = shared.buffer_index();
    shared.with_block(index, |block| {
        for (dst, src) in mix.iter_mut().zip(block.iter()) {
            for (d, &s) in dst.iter_mut().zip(src.iter()) {
                let mut sample = s >> 8;
                sample -= sample >> 4;
                *d = sample;
            }
        }
    });

    shared.set_buffer_index(1 - index);
    ctx.link.buffer_switch(1 - index, true);

    if !ctx.clap.is_empty() {
        for slot in clap_queue.active_slots() {
            let offset = (current_frame - slot.start_frame) as i64;
            for channel in mix.iter_mut() {
                for &event in &slot.events[..usize::from(slot.count)] {
                    ctx.clap
                        .render(channel, offset, usize::from(event), ctx.clap_gain);
                }
            }
        }
    }

    if let Some(loopback) = ctx.loopback.as_mut() {
        loopback.render(current_frame, mix);
    }

    compress_block(mix);

    for sink in &ctx.sinks {
        sink.push_samples(mix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::sim::{SimAudioSystem, SimEndpointConfig};
    use crate::endpoint::{AudioSystem, EndpointId};
    use crate::keys::CountingKeySource;
    use crate::shared::{HostCallbacks, SharedBuffers};
    use std::io::Cursor;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    struct TestHost {
        switches: AtomicU64,
        indices: Mutex<Vec<usize>>,
        on_switch: OnceLock<Box<dyn Fn(usize) + Send + Sync>>,
    }

    impl TestHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                switches: AtomicU64::new(0),
                indices: Mutex::new(Vec::new()),
                on_switch: OnceLock::new(),
            })
        }
    }

    impl HostCallbacks for TestHost {
        fn buffer_switch(&self, index: usize, _direct: bool) {
            self.switches.fetch_add(1, Ordering::SeqCst);
            self.indices.lock().unwrap().push(index);
            if let Some(f) = self.on_switch.get() {
                f(index);
            }
        }
    }

    fn clap_wav(rate: u32, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    fn context(
        sim: &SimAudioSystem,
        settings: EngineSettings,
        block_size: usize,
        key_source: Arc<CountingKeySource>,
        clap_sounds: Vec<Vec<u8>>,
    ) -> PreparedContext {
        let system: Arc<dyn AudioSystem> = Arc::new(sim.clone());
        let devices = sim.endpoints().unwrap();
        PreparedContext {
            system,
            devices,
            settings: Arc::new(settings),
            sample_rate: 48000,
            block_size,
            key_source,
            clap_sounds: Arc::new(clap_sounds),
        }
    }

    fn default_settings() -> EngineSettings {
        EngineSettings {
            channel_count: 2,
            clap_gain: 0.0,
            throttle: true,
            duration_overrides: std::collections::BTreeMap::new(),
            loopback_source: None,
            intercept_default_output: false,
        }
    }

    /// Wire the host to re-arm output-ready on every switch. The closure
    /// holds only the poll flags, never the running state itself, so
    /// dropping the returned `RunningState` really joins the poll thread.
    fn start_self_driving(
        ctx: &PreparedContext,
        host: &Arc<TestHost>,
    ) -> (RunningState, Arc<SharedBuffers>) {
        let shared = Arc::new(SharedBuffers::new(
            usize::from(ctx.settings.channel_count),
            ctx.block_size,
        ));
        let link = HostLink {
            shared: Arc::clone(&shared),
            callbacks: host.clone(),
        };
        let running = RunningState::new(ctx, link).unwrap();

        let flags = Arc::clone(&running.flags);
        host.on_switch
            .set(Box::new(move |_| {
                let mut state = flags.state.lock().unwrap();
                state.output_ready = true;
                drop(state);
                flags.cv.notify_all();
            }))
            .ok()
            .unwrap();
        // Kick the first block; afterwards every switch re-arms the loop.
        running.signal_output_ready();
        (running, shared)
    }

    #[test]
    fn block_cadence_tracks_the_clock() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let host = TestHost::new();
        let ctx = context(&sim, default_settings(), 480, Arc::new(CountingKeySource::new()), vec![]);

        let (running, _shared) = start_self_driving(&ctx, &host);
        thread::sleep(Duration::from_millis(500));
        drop(running);

        // 480 frames at 48 kHz is 10 ms per block: ~50 blocks in 500 ms.
        let switches = host.switches.load(Ordering::SeqCst);
        assert!(
            (45..=53).contains(&switches),
            "expected ~50 switches, got {}",
            switches
        );
    }

    #[test]
    fn indices_alternate_and_position_advances() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let host = TestHost::new();
        let ctx = context(&sim, default_settings(), 480, Arc::new(CountingKeySource::new()), vec![]);

        let (running, shared) = start_self_driving(&ctx, &host);
        thread::sleep(Duration::from_millis(120));
        drop(running);

        let switches = host.switches.load(Ordering::SeqCst);
        assert!(switches >= 5);
        let pos = shared.sample_position();
        assert_eq!(pos.samples, switches * 480);

        // Strict alternation, starting at buffer 1.
        let indices = host.indices.lock().unwrap();
        for (k, &index) in indices.iter().enumerate() {
            assert_eq!(index, (k + 1) & 1, "index sequence broken at call {}", k);
        }
    }

    #[test]
    fn stop_returns_promptly() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let host = TestHost::new();
        // A long block keeps the loop deep in its inter-poll wait.
        let ctx = context(&sim, default_settings(), 1024, Arc::new(CountingKeySource::new()), vec![]);

        let (running, _shared) = start_self_driving(&ctx, &host);
        thread::sleep(Duration::from_millis(50));

        let begin = Instant::now();
        drop(running);
        assert!(
            begin.elapsed() < Duration::from_millis(250),
            "stop took {:?}",
            begin.elapsed()
        );
    }

    #[test]
    fn host_data_reaches_the_sink_compressed() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let host = TestHost::new();
        let ctx = context(&sim, default_settings(), 64, Arc::new(CountingKeySource::new()), vec![]);

        let shared = Arc::new(SharedBuffers::new(2, 64));
        // Host data below the compression knee passes through the whole
        // pipeline as (s >> 8 scaled by 15/16) << 8.
        let value: i32 = 1 << 20;
        for index in 0..2 {
            for ch in 0..2 {
                assert!(shared.write_channel(index, ch, &[value; 64]));
            }
        }
        let link = HostLink {
            shared: Arc::clone(&shared),
            callbacks: host.clone(),
        };
        let running = RunningState::new(&ctx, link).unwrap();
        let flags = Arc::clone(&running.flags);
        host.on_switch
            .set(Box::new(move |_| {
                let mut state = flags.state.lock().unwrap();
                state.output_ready = true;
                drop(state);
                flags.cv.notify_all();
            }))
            .ok()
            .unwrap();
        running.signal_output_ready();

        let id = EndpointId::from("a");
        let deadline = Instant::now() + Duration::from_secs(2);
        while sim.written_frames(&id) < 1024 {
            assert!(Instant::now() < deadline, "sink never received data");
            thread::sleep(Duration::from_millis(5));
        }
        drop(running);

        let scaled = value >> 8;
        let expected = (scaled - (scaled >> 4)) << 8;
        let samples = sim.written_samples(&id);
        assert!(
            samples.iter().any(|&s| s == expected),
            "expected sample {} in sink output",
            expected
        );
    }

    #[test]
    fn key_events_render_claps_into_the_output() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let host = TestHost::new();
        let keys = Arc::new(CountingKeySource::new());
        let mut settings = default_settings();
        settings.clap_gain = 0.5;
        let clap_sounds = vec![
            clap_wav(48000, &vec![16000i16; large_enough_len()]),
            clap_wav(48000, &vec![-16000i16; 64]),
        ];
        let ctx = context(&sim, settings, 64, Arc::clone(&keys), clap_sounds);

        let (running, _shared) = start_self_driving(&ctx, &host);
        keys.note_key_down();
        keys.note_key_down();
        keys.note_key_down();
        thread::sleep(Duration::from_millis(150));
        drop(running);

        let id = EndpointId::from("a");
        let samples = sim.written_samples(&id);
        assert!(samples.iter().any(|&s| s != 0), "claps never reached sink");

        // Three claps at gain 0.5 of a 0.5-amplitude sample, compressed:
        // bounded by full scale.
        let peak = samples.iter().map(|&s| i64::from(s).abs()).max().unwrap();
        assert!(peak < i64::from(i32::MAX));
    }

    fn large_enough_len() -> usize {
        // A few blocks worth so the clap spans several process cycles.
        512
    }

    #[test]
    fn clap_queue_truncates_down_first() {
        let mut queue = ClapQueue::new();
        queue.record(
            KeyEventCounts {
                key_down: 12,
                key_up: 10,
            },
            1.0,
            0,
        );
        let slot = queue.active_slots().next().unwrap();
        assert_eq!(slot.count, MAX_EVENTS_PER_SLOT as u8);
        let downs = slot.events[..12]
            .iter()
            .filter(|&&e| usize::from(e) == INDEX_KEYDOWN)
            .count();
        assert_eq!(downs, 12, "key-downs fill the slot first");
    }

    #[test]
    fn clap_queue_gc_deactivates_old_slots() {
        let mut queue = ClapQueue::new();
        queue.record(KeyEventCounts { key_down: 1, key_up: 0 }, 1.0, 0);
        queue.record(KeyEventCounts { key_down: 1, key_up: 0 }, 5.0, 4800);
        queue.gc(2.0);
        let remaining: Vec<_> = queue.active_slots().collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].start_frame, 4800);
    }

    #[test]
    fn clap_queue_wraps_at_capacity() {
        let mut queue = ClapQueue::new();
        for i in 0..(CLAP_QUEUE_SIZE + 10) {
            queue.record(
                KeyEventCounts { key_down: 1, key_up: 0 },
                i as f64,
                i as u64,
            );
        }
        assert_eq!(queue.active_slots().count(), CLAP_QUEUE_SIZE);
    }
}
