//! Diagnostic CLI for the trgkASIO driver shim.
//!
//! Not a configuration UI — it exists to exercise the driver end to end
//! from a shell: list endpoints, dump the effective settings, and push a
//! test tone through the whole prepared/running pipeline on real hardware.

use std::f64::consts::PI;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use trgkasio_driver::{BufferRequest, Driver, DriverSettings, HostCallbacks, SharedBuffers};
use trgkasio_engine::endpoint::AudioSystem;
use trgkasio_engine::endpoint::cpal_backend::CpalAudioSystem;

#[derive(Parser)]
#[command(name = "trgkasio", about = "trgkASIO driver diagnostics", version)]
struct Cli {
    /// Settings file (defaults to ~/trgkASIO.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List output endpoints visible to the audio system.
    Devices,
    /// Print the effective settings document.
    Config,
    /// Run a 440 Hz test tone through the driver.
    Play {
        /// Seconds to play.
        #[arg(long, default_value_t = 3)]
        seconds: u64,
        /// Block size in frames.
        #[arg(long, default_value_t = 64)]
        block_size: usize,
    },
}

struct ToneHost {
    shared: OnceLock<Arc<SharedBuffers>>,
    position: AtomicU64,
    sample_rate: f64,
}

impl HostCallbacks for ToneHost {
    fn buffer_switch(&self, index: usize, _direct: bool) {
        let Some(shared) = self.shared.get() else {
            return;
        };
        let block = shared.block_size();
        let base = self.position.fetch_add(block as u64, Ordering::SeqCst);
        let amplitude = f64::from(1 << 26);
        let samples: Vec<i32> = (0..block)
            .map(|i| {
                let t = (base + i as u64) as f64 / self.sample_rate;
                (amplitude * (2.0 * PI * 440.0 * t).sin()) as i32
            })
            .collect();
        for ch in 0..shared.channels() {
            shared.write_channel(index, ch, &samples);
        }
    }
}

fn load_settings(cli: &Cli) -> Result<DriverSettings> {
    match &cli.config {
        Some(path) => DriverSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => match DriverSettings::default_path() {
            Some(path) => DriverSettings::load(&path)
                .with_context(|| format!("loading settings from {}", path.display())),
            None => Ok(DriverSettings::default()),
        },
    }
}

fn cmd_devices(system: &CpalAudioSystem) -> Result<()> {
    let default = system.default_output().ok();
    let endpoints = system.endpoints().context("enumerating endpoints")?;
    if endpoints.is_empty() {
        bail!("no output endpoints found");
    }
    for (i, endpoint) in endpoints.iter().enumerate() {
        let marker = match &default {
            Some(d) if d.id == endpoint.id => " (default)",
            _ => "",
        };
        println!("#{i:02} {}{}", endpoint.friendly_name, marker);
    }
    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    println!("{}", settings.to_json()?);
    Ok(())
}

fn cmd_play(cli: &Cli, seconds: u64, block_size: usize) -> Result<()> {
    let settings = load_settings(cli)?;
    let sample_rate = settings.sample_rate;

    let system = Arc::new(CpalAudioSystem::new());
    let mut driver = Driver::new(system);
    if !driver.init_with_settings(settings) {
        bail!("driver init failed: {}", driver.error_message());
    }

    let channels = driver.channels().map_err(|e| anyhow::anyhow!("{e}"))?.1;
    let requests: Vec<BufferRequest> = (0..channels as usize)
        .map(|channel| BufferRequest {
            channel,
            is_input: false,
        })
        .collect();

    let host = Arc::new(ToneHost {
        shared: OnceLock::new(),
        position: AtomicU64::new(0),
        sample_rate: f64::from(sample_rate),
    });
    let shared = driver
        .create_buffers(&requests, block_size, host.clone())
        .map_err(|e| anyhow::anyhow!("create buffers: {e}"))?;
    let _ = host.shared.set(shared);

    let driver = Arc::new(Mutex::new(driver));
    driver
        .lock()
        .expect("driver lock")
        .start()
        .map_err(|e| anyhow::anyhow!("start: {e}"))?;
    println!("playing 440 Hz for {seconds}s at {sample_rate} Hz, block {block_size}...");

    // Host-side pacing: keep output-ready raised so the poll loop runs.
    let stop = Arc::new(AtomicBool::new(false));
    let pump = {
        let driver = Arc::clone(&driver);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let _ = driver.lock().expect("driver lock").output_ready();
                thread::sleep(Duration::from_micros(500));
            }
        })
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(seconds);
    while std::time::Instant::now() < deadline && !interrupted.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(20));
    }

    stop.store(true, Ordering::SeqCst);
    let _ = pump.join();
    tracing::debug!("ready pump stopped");

    let mut driver = driver.lock().expect("driver lock");
    let position = driver.sample_position().map_err(|e| anyhow::anyhow!("{e}"))?;
    driver.stop().map_err(|e| anyhow::anyhow!("stop: {e}"))?;
    driver
        .dispose_buffers()
        .map_err(|e| anyhow::anyhow!("dispose: {e}"))?;

    println!(
        "done: {} frames delivered ({:.2}s of audio)",
        position.samples,
        position.samples as f64 / f64::from(sample_rate)
    );
    Ok(())
}

fn main() -> Result<()> {
    // The driver installs its own subscriber at init; for the read-only
    // commands RUST_LOG still applies.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Command::Devices => {
            let system = CpalAudioSystem::new();
            cmd_devices(&system)
        }
        Command::Config => cmd_config(&cli),
        Command::Play {
            seconds,
            block_size,
        } => cmd_play(&cli, seconds, block_size),
    }
}
