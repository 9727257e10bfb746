//! Per-endpoint output sink.
//!
//! One [`OutputSink`] owns one endpoint: it negotiates the stream format,
//! keeps a ring buffer per channel, and runs a dedicated render thread that
//! drains the rings into the endpoint buffer whenever the endpoint signals
//! that a buffer is due. The channel rings move in lockstep — pushes and
//! drains are all-channels-or-none under one mutex.
//!
//! Real-time failures stay local: a starved ring produces one buffer of
//! silence, a full ring drops the incoming block, and both only surface via
//! the log and [`SinkStats`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use tracing::{error, info, trace, warn};

use trgkasio_core::RingBuffer;

use crate::endpoint::{AudioSystem, EndpointDescriptor, RenderClient};
use crate::error::{EngineError, EngineResult};
use crate::format::{ShareMode, WaveFormat};
use crate::negotiate::find_stream_format;
use crate::signal::{BufferEvent, SinkSignal, Wake};

/// Lock-free counters of real-time incidents on one sink.
#[derive(Debug, Default)]
pub struct SinkStats {
    underflows: AtomicU64,
    overflows: AtomicU64,
}

impl SinkStats {
    /// Blocks of silence emitted because the rings ran dry.
    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    /// Host blocks dropped because the rings were full.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

struct RenderContext {
    endpoint_id: String,
    format: WaveFormat,
    mode: ShareMode,
    channels: usize,
    sample_rate: u32,
    output_buffer_size: usize,
    rings: Arc<Mutex<Vec<RingBuffer<i32>>>>,
    signal: Arc<SinkSignal>,
    stats: Arc<SinkStats>,
}

/// One endpoint plus its render thread.
///
/// Construction returns only after the render thread has registered the
/// buffer event, preloaded the first buffer, and started the endpoint; any
/// failure along that path fails the constructor. Dropping the sink signals
/// stop and joins the thread.
pub struct OutputSink {
    endpoint: EndpointDescriptor,
    format: WaveFormat,
    mode: ShareMode,
    channels: usize,
    input_buffer_size: usize,
    output_buffer_size: usize,
    rings: Arc<Mutex<Vec<RingBuffer<i32>>>>,
    signal: Arc<SinkSignal>,
    stats: Arc<SinkStats>,
    render_thread: Option<thread::JoinHandle<()>>,
}

impl OutputSink {
    /// Negotiate, initialize, and start delivering to `endpoint`.
    ///
    /// Ring capacity is `(input_buffer_size + output_buffer_size) *
    /// ring_multiplier` per channel.
    pub fn new(
        system: &dyn AudioSystem,
        endpoint: &EndpointDescriptor,
        channels: u16,
        sample_rate: u32,
        input_buffer_size: usize,
        mode: ShareMode,
        ring_multiplier: usize,
        duration_overrides: &BTreeMap<String, i64>,
    ) -> EngineResult<Self> {
        let negotiated = find_stream_format(
            system,
            endpoint,
            channels,
            sample_rate,
            mode,
            duration_overrides,
        )?;
        let client = negotiated.client;
        let format = negotiated.format;

        let output_buffer_size = client.buffer_frames()?;
        info!(
            endpoint = %endpoint.id,
            input = input_buffer_size,
            output = output_buffer_size,
            bits = format.bits_per_sample,
            valid = format.valid_bits,
            %mode,
            "output sink ready"
        );

        let ring_capacity = (input_buffer_size + output_buffer_size) * ring_multiplier;
        let rings = Arc::new(Mutex::new(
            (0..channels)
                .map(|_| RingBuffer::new(ring_capacity))
                .collect::<Vec<_>>(),
        ));
        let signal = SinkSignal::new();
        let stats = Arc::new(SinkStats::default());

        let ctx = RenderContext {
            endpoint_id: endpoint.id.0.clone(),
            format,
            mode,
            channels: usize::from(channels),
            sample_rate,
            output_buffer_size,
            rings: Arc::clone(&rings),
            signal: Arc::clone(&signal),
            stats: Arc::clone(&stats),
        };

        let (ready_tx, ready_rx) = mpsc::channel();
        let render_thread = thread::Builder::new()
            .name(format!("sink-{}", endpoint.id))
            .spawn(move || render_thread_main(client, ctx, &ready_tx))
            .map_err(|e| EngineError::ThreadStart(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = render_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = render_thread.join();
                return Err(EngineError::ThreadStart(
                    "render thread died during initialization".to_string(),
                ));
            }
        }

        Ok(Self {
            endpoint: endpoint.clone(),
            format,
            mode,
            channels: usize::from(channels),
            input_buffer_size,
            output_buffer_size,
            rings,
            signal,
            stats,
            render_thread: Some(render_thread),
        })
    }

    /// The endpoint this sink delivers to.
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    /// The negotiated wave format.
    pub fn format(&self) -> WaveFormat {
        self.format
    }

    /// Exclusive or shared.
    pub fn mode(&self) -> ShareMode {
        self.mode
    }

    /// The endpoint's buffer size in frames.
    pub fn output_buffer_size(&self) -> usize {
        self.output_buffer_size
    }

    /// Incident counters, shareable with tests and telemetry.
    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    /// Enqueue one planar block of `input_buffer_size` frames per channel.
    ///
    /// All channel rings accept or none do; a block that does not fit is
    /// dropped and counted as an overflow.
    pub fn push_samples(&self, block: &[Vec<i32>]) {
        if block.len() != self.channels {
            error!(
                endpoint = %self.endpoint.id,
                expected = self.channels,
                got = block.len(),
                "push with wrong channel count"
            );
            return;
        }
        if block[0].len() != self.input_buffer_size {
            error!(
                endpoint = %self.endpoint.id,
                expected = self.input_buffer_size,
                got = block[0].len(),
                "push with wrong block length"
            );
            return;
        }

        let mut overflow = false;
        {
            let mut rings = self.rings.lock().expect("sink rings poisoned");
            if rings[0].size() + self.input_buffer_size > rings[0].capacity() {
                overflow = true;
            } else {
                for (ring, channel) in rings.iter_mut().zip(block.iter()) {
                    let ok = ring.push(channel);
                    debug_assert!(ok, "lockstep rings diverged");
                }
            }
        }

        // Logging happens outside the ring mutex.
        if overflow {
            self.stats.overflows.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %self.endpoint.id, "ring overflow, dropping block");
        }
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        self.signal.signal_stop();
        if let Some(handle) = self.render_thread.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink")
            .field("endpoint", &self.endpoint.id)
            .field("mode", &self.mode)
            .field("input_buffer_size", &self.input_buffer_size)
            .field("output_buffer_size", &self.output_buffer_size)
            .finish_non_exhaustive()
    }
}

fn render_thread_main(
    mut client: Box<dyn RenderClient>,
    ctx: RenderContext,
    ready_tx: &mpsc::Sender<EngineResult<()>>,
) {
    let mut scratch = vec![0i32; ctx.output_buffer_size];
    let mut staging = vec![0u8; ctx.output_buffer_size * ctx.format.frame_bytes()];

    let init = (|| -> EngineResult<()> {
        client.set_buffer_event(BufferEvent(Arc::clone(&ctx.signal)))?;

        if let Err(err) = audio_thread_priority::promote_current_thread_to_real_time(
            ctx.output_buffer_size as u32,
            ctx.sample_rate,
        ) {
            warn!(endpoint = %ctx.endpoint_id, error = ?err, "failed to promote render thread");
        }

        // Prime the endpoint with one buffer before starting; silence is
        // fine here and is not an underflow.
        load_data(client.as_mut(), &ctx, &mut scratch, &mut staging, true)?;
        client.start()
    })();

    if let Err(e) = init {
        let _ = ready_tx.send(Err(e));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    loop {
        match ctx.signal.wait() {
            Wake::Stop => break,
            Wake::Data => {
                if let Err(e) = load_data(client.as_mut(), &ctx, &mut scratch, &mut staging, false)
                {
                    // Transient endpoint trouble: keep the loop alive.
                    warn!(endpoint = %ctx.endpoint_id, error = %e, "endpoint write failed");
                }
            }
        }
    }

    if let Err(e) = client.stop() {
        warn!(endpoint = %ctx.endpoint_id, error = %e, "endpoint stop failed");
    }
}

/// Fill one endpoint buffer from the rings, converting to the negotiated
/// bit depth; silence (plus one underflow count unless preloading) when the
/// rings cannot cover a full write.
fn load_data(
    client: &mut dyn RenderClient,
    ctx: &RenderContext,
    scratch: &mut [i32],
    staging: &mut [u8],
    preload: bool,
) -> EngineResult<()> {
    let mut write_size = ctx.output_buffer_size;
    if ctx.mode == ShareMode::Shared {
        write_size = write_size.saturating_sub(client.current_padding()?);
    }
    if write_size == 0 {
        return Ok(());
    }

    let byte_len = write_size * ctx.format.frame_bytes();
    let bytes_per_sample = ctx.format.bytes_per_sample();

    let mut skipped = false;
    {
        let mut rings = ctx.rings.lock().expect("sink rings poisoned");
        trace!(
            endpoint = %ctx.endpoint_id,
            queued = rings[0].size(),
            write_size,
            "load data"
        );
        if rings[0].size() < write_size {
            staging[..byte_len].fill(0);
            skipped = true;
        } else {
            for (ch, ring) in rings.iter_mut().enumerate() {
                let ok = ring.get(&mut scratch[..write_size]);
                debug_assert!(ok, "lockstep rings diverged");
                match bytes_per_sample {
                    2 => {
                        for (i, &sample) in scratch[..write_size].iter().enumerate() {
                            let v = (sample >> 16) as i16;
                            let off = (i * ctx.channels + ch) * 2;
                            staging[off..off + 2].copy_from_slice(&v.to_le_bytes());
                        }
                    }
                    _ => {
                        for (i, &sample) in scratch[..write_size].iter().enumerate() {
                            let off = (i * ctx.channels + ch) * 4;
                            staging[off..off + 4].copy_from_slice(&sample.to_le_bytes());
                        }
                    }
                }
            }
        }
    }

    if skipped && !preload {
        ctx.stats.underflows.fetch_add(1, Ordering::Relaxed);
        warn!(endpoint = %ctx.endpoint_id, "ring underflow, writing silence");
    }

    client.write_frames(write_size, &staging[..byte_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::sim::{SimAudioSystem, SimEndpointConfig};
    use crate::endpoint::{AudioSystem, EndpointId};
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn block(channels: usize, frames: usize, value: i32) -> Vec<Vec<i32>> {
        vec![vec![value; frames]; channels]
    }

    fn make_sink(sim: &SimAudioSystem, id: &str, block_size: usize) -> OutputSink {
        let desc = sim
            .endpoints()
            .unwrap()
            .into_iter()
            .find(|d| d.id.0 == id)
            .unwrap();
        OutputSink::new(
            sim,
            &desc,
            2,
            48000,
            block_size,
            ShareMode::Exclusive,
            2,
            &BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn preload_writes_one_buffer_without_counting_underflow() {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("a", "Alpha").with_manual_pacing(),
        ]);
        let sink = make_sink(&sim, "a", 64);
        let id = EndpointId::from("a");

        assert_eq!(sim.written_frames(&id), sink.output_buffer_size() as u64);
        assert_eq!(sink.stats().underflows(), 0);
    }

    #[test]
    fn drains_pushed_blocks_on_event() {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("a", "Alpha").with_manual_pacing(),
        ]);
        let sink = make_sink(&sim, "a", 64);
        let id = EndpointId::from("a");
        let out = sink.output_buffer_size();

        // Enough data for one full endpoint buffer.
        for _ in 0..out.div_ceil(64) {
            sink.push_samples(&block(2, 64, 99 << 8));
        }
        sim.pump(&id);

        wait_for(|| sim.written_frames(&id) >= (2 * out) as u64);
        assert_eq!(sink.stats().underflows(), 0);

        let samples = sim.written_samples(&id);
        // Skip the preloaded silence, check the drained data.
        assert!(samples[2 * out..].iter().any(|&s| s == 99 << 8));
    }

    #[test]
    fn event_without_data_emits_silence_and_counts_underflow() {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("a", "Alpha").with_manual_pacing(),
        ]);
        let sink = make_sink(&sim, "a", 64);
        let id = EndpointId::from("a");
        let out = sink.output_buffer_size() as u64;

        sim.pump(&id);
        wait_for(|| sim.written_frames(&id) >= 2 * out);
        assert_eq!(sink.stats().underflows(), 1);

        let samples = sim.written_samples(&id);
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn full_rings_drop_the_block_once() {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("a", "Alpha").with_manual_pacing(),
        ]);
        let sink = make_sink(&sim, "a", 64);

        // Never pump: rings only fill. Capacity is (64 + out) * 2.
        let capacity = (64 + sink.output_buffer_size()) * 2;
        let fitting = capacity / 64;
        for _ in 0..fitting {
            sink.push_samples(&block(2, 64, 1));
        }
        assert_eq!(sink.stats().overflows(), 0);

        sink.push_samples(&block(2, 64, 1));
        assert_eq!(sink.stats().overflows(), 1);
    }

    #[test]
    fn wrong_shape_pushes_are_rejected() {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("a", "Alpha").with_manual_pacing(),
        ]);
        let sink = make_sink(&sim, "a", 64);

        sink.push_samples(&block(3, 64, 1)); // wrong channel count
        sink.push_samples(&block(2, 32, 1)); // wrong frame count
        assert_eq!(sink.stats().overflows(), 0);

        let queued = sink.rings.lock().unwrap()[0].size();
        assert_eq!(queued, 0);
    }

    #[test]
    fn sixteen_bit_sink_truncates_with_arithmetic_shift() {
        let sim = SimAudioSystem::new(vec![
            SimEndpointConfig::new("hdmi", "HDMI")
                .with_max_bits(16)
                .with_manual_pacing(),
        ]);
        let desc = sim.endpoints().unwrap()[0].clone();
        let sink = OutputSink::new(
            &sim,
            &desc,
            2,
            48000,
            64,
            ShareMode::Exclusive,
            2,
            &BTreeMap::new(),
        )
        .unwrap();
        let id = EndpointId::from("hdmi");
        let out = sink.output_buffer_size();

        let value: i32 = -(7 << 20);
        for _ in 0..out.div_ceil(64) {
            sink.push_samples(&block(2, 64, value));
        }
        sim.pump(&id);
        wait_for(|| sim.written_frames(&id) >= (2 * out) as u64);

        let samples = sim.written_samples(&id);
        let expected = value >> 16;
        assert!(samples[2 * out..].iter().any(|&s| s == expected));
    }

    #[test]
    fn drop_joins_the_render_thread() {
        let sim = SimAudioSystem::new(vec![SimEndpointConfig::new("a", "Alpha")]);
        let sink = make_sink(&sim, "a", 64);
        drop(sink);
        // Dropping again-constructed sinks on the same endpoint works too.
        let sink2 = make_sink(&sim, "a", 64);
        drop(sink2);
    }
}
