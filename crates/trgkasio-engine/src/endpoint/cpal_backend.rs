//! cpal-backed [`AudioSystem`] for real hardware.
//!
//! This adapter maps the endpoint traits onto cpal's callback model: the
//! render client keeps an internal frame queue, the cpal output callback
//! drains it and raises the buffer event, and `write_frames` refills it.
//! Limitations are inherent to cpal and reported honestly: exclusive mode is
//! approximated by a shared stream, and loopback capture, default-output
//! switching, and volume control are unsupported.
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! with an init handshake, and stopping joins that thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{info, warn};

use crate::endpoint::{
    AudioSystem, CaptureClient, ClientInitError, DevicePeriod, EndpointDescriptor, EndpointId,
    RenderClient, VolumeControl,
};
use crate::error::{EngineError, EngineResult};
use crate::format::{ShareMode, WaveFormat};
use crate::signal::BufferEvent;

/// [`AudioSystem`] over the platform's default cpal host.
#[derive(Debug, Default, Clone)]
pub struct CpalAudioSystem;

impl CpalAudioSystem {
    /// Create the adapter.
    pub fn new() -> Self {
        info!(host = cpal::default_host().id().name(), "cpal audio system");
        Self
    }

    fn find_device(&self, id: &EndpointId) -> EngineResult<cpal::Device> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| EngineError::endpoint(&id.0, e.to_string()))?;
        for device in devices {
            if let Ok(name) = device.name()
                && name == id.0
            {
                return Ok(device);
            }
        }
        Err(EngineError::EndpointNotFound(id.0.clone()))
    }
}

impl AudioSystem for CpalAudioSystem {
    fn endpoints(&self) -> EngineResult<Vec<EndpointDescriptor>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| EngineError::endpoint("host", e.to_string()))?;
        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| EndpointDescriptor {
                id: EndpointId(name.clone()),
                friendly_name: name,
            })
            .collect())
    }

    fn default_output(&self) -> EngineResult<EndpointDescriptor> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| EngineError::EndpointNotFound("(default)".to_string()))?;
        let name = device
            .name()
            .map_err(|e| EngineError::endpoint("(default)", e.to_string()))?;
        Ok(EndpointDescriptor {
            id: EndpointId(name.clone()),
            friendly_name: name,
        })
    }

    fn set_default_output(&self, _id: &EndpointId) -> EngineResult<()> {
        Err(EngineError::Unsupported("default-output switching via cpal"))
    }

    fn activate_render(&self, id: &EndpointId) -> EngineResult<Box<dyn RenderClient>> {
        let device = self.find_device(id)?;
        Ok(Box::new(CpalRenderClient {
            id: id.clone(),
            device: Some(device),
            negotiated: None,
            event: None,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            stream_stop: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
        }))
    }

    fn activate_loopback(
        &self,
        _id: &EndpointId,
        _channels: u16,
    ) -> EngineResult<Box<dyn CaptureClient>> {
        Err(EngineError::Unsupported("loopback capture via cpal"))
    }

    fn volume_control(&self, _id: &EndpointId) -> EngineResult<Box<dyn VolumeControl>> {
        Err(EngineError::Unsupported("endpoint volume via cpal"))
    }
}

struct CpalNegotiated {
    format: WaveFormat,
    frames: usize,
}

struct CpalRenderClient {
    id: EndpointId,
    device: Option<cpal::Device>,
    negotiated: Option<CpalNegotiated>,
    event: Option<BufferEvent>,
    /// Interleaved f32 frames waiting for the output callback.
    queue: Arc<Mutex<VecDeque<f32>>>,
    stream_stop: Arc<AtomicBool>,
    stream_thread: Option<thread::JoinHandle<()>>,
}

impl CpalRenderClient {
    fn negotiated(&self) -> EngineResult<&CpalNegotiated> {
        self.negotiated
            .as_ref()
            .ok_or_else(|| EngineError::endpoint(&self.id.0, "not initialized"))
    }
}

impl RenderClient for CpalRenderClient {
    fn is_format_supported(&self, _mode: ShareMode, format: &WaveFormat) -> bool {
        let Some(device) = &self.device else {
            return false;
        };
        let Ok(configs) = device.supported_output_configs() else {
            return false;
        };
        // The callback converts to f32, so only rate and channel count
        // matter here. Exclusive mode is served by the same shared stream.
        configs.into_iter().any(|range| {
            u16::from(range.channels()) >= format.channels
                && range.min_sample_rate().0 <= format.sample_rate
                && range.max_sample_rate().0 >= format.sample_rate
        })
    }

    fn device_period(&self) -> EngineResult<DevicePeriod> {
        Ok(DevicePeriod {
            default_hns: 100_000,
            min_hns: 100_000,
        })
    }

    fn initialize(
        &mut self,
        mode: ShareMode,
        format: &WaveFormat,
        duration_hns: i64,
    ) -> Result<(), ClientInitError> {
        if !self.is_format_supported(mode, format) {
            return Err(ClientInitError::FormatRejected);
        }
        let effective_hns = if duration_hns == 0 { 100_000 } else { duration_hns };
        let frames = (effective_hns as f64 / 10_000_000.0 * f64::from(format.sample_rate)).round()
            as usize;
        self.negotiated = Some(CpalNegotiated {
            format: *format,
            frames: frames.max(32),
        });
        Ok(())
    }

    fn buffer_frames(&self) -> EngineResult<usize> {
        Ok(self.negotiated()?.frames)
    }

    fn set_buffer_event(&mut self, event: BufferEvent) -> EngineResult<()> {
        self.event = Some(event);
        Ok(())
    }

    fn start(&mut self) -> EngineResult<()> {
        let negotiated = self.negotiated()?;
        let format = negotiated.format;
        let frames = negotiated.frames;
        let device = self
            .device
            .take()
            .ok_or_else(|| EngineError::endpoint(&self.id.0, "already started"))?;
        let event = self
            .event
            .clone()
            .ok_or_else(|| EngineError::endpoint(&self.id.0, "no buffer event registered"))?;

        let queue = Arc::clone(&self.queue);
        let stop = Arc::clone(&self.stream_stop);
        let id = self.id.clone();
        let (init_tx, init_rx) = mpsc::channel::<EngineResult<()>>();

        // The stream is !Send; it is built, driven, and dropped on this
        // thread.
        self.stream_thread = Some(
            thread::Builder::new()
                .name(format!("cpal-{}", self.id))
                .spawn(move || {
                    let config = cpal::StreamConfig {
                        channels: format.channels,
                        sample_rate: cpal::SampleRate(format.sample_rate),
                        buffer_size: cpal::BufferSize::Fixed(frames as u32),
                    };
                    let cb_queue = Arc::clone(&queue);
                    let cb_event = event.clone();
                    let stream = device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            let mut queue = cb_queue.lock().expect("cpal queue poisoned");
                            for sample in data.iter_mut() {
                                *sample = queue.pop_front().unwrap_or(0.0);
                            }
                            drop(queue);
                            cb_event.signal();
                        },
                        move |err| warn!(error = %err, "cpal stream error"),
                        None,
                    );
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = init_tx.send(Err(EngineError::endpoint(&id.0, e.to_string())));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = init_tx.send(Err(EngineError::endpoint(&id.0, e.to_string())));
                        return;
                    }
                    let _ = init_tx.send(Ok(()));
                    while !stop.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(10));
                    }
                    drop(stream);
                })
                .map_err(|e| EngineError::ThreadStart(e.to_string()))?,
        );

        init_rx
            .recv()
            .map_err(|_| EngineError::ThreadStart("cpal stream thread died".to_string()))?
    }

    fn stop(&mut self) -> EngineResult<()> {
        self.stream_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn current_padding(&self) -> EngineResult<usize> {
        let negotiated = self.negotiated()?;
        let queued = self.queue.lock().expect("cpal queue poisoned").len();
        Ok(queued / usize::from(negotiated.format.channels))
    }

    fn write_frames(&mut self, frames: usize, data: &[u8]) -> EngineResult<()> {
        let negotiated = self.negotiated()?;
        let format = negotiated.format;
        let expected = frames * format.frame_bytes();
        if data.len() != expected {
            return Err(EngineError::endpoint(
                &self.id.0,
                format!("write of {} bytes, expected {}", data.len(), expected),
            ));
        }

        let mut queue = self.queue.lock().expect("cpal queue poisoned");
        // Bound the queue to a handful of buffers; drop beyond it.
        let cap = negotiated.frames * usize::from(format.channels) * 8;
        let mut push = |sample: f32| {
            if queue.len() < cap {
                queue.push_back(sample);
            }
        };
        match format.bits_per_sample {
            16 => {
                for pair in data.chunks_exact(2) {
                    let v = i16::from_le_bytes([pair[0], pair[1]]);
                    push(f32::from(v) / 32768.0);
                }
            }
            _ => {
                for quad in data.chunks_exact(4) {
                    let v = i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                    push(v as f32 / 2147483648.0);
                }
            }
        }
        Ok(())
    }
}

impl Drop for CpalRenderClient {
    fn drop(&mut self) {
        let _ = RenderClient::stop(self);
    }
}
