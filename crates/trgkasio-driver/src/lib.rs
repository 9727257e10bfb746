//! Host-facing driver facade for the trgkASIO audio shim.
//!
//! This crate ties the engine's real-time data path to the host API
//! surface: the [`Driver`] state machine (Loaded → Initialized → Prepared →
//! Running), the `trgkASIO.json` settings document, the host callback
//! table, and the fixed driver identity (name, version, channel names,
//! clock source).
//!
//! ```no_run
//! use std::sync::Arc;
//! use trgkasio_driver::{Driver, host::BufferRequest};
//! use trgkasio_engine::endpoint::sim::{SimAudioSystem, SimEndpointConfig};
//! # use trgkasio_engine::HostCallbacks;
//! # struct MyHost;
//! # impl HostCallbacks for MyHost {
//! #     fn buffer_switch(&self, _index: usize, _direct: bool) {}
//! # }
//!
//! let system = Arc::new(SimAudioSystem::new(vec![
//!     SimEndpointConfig::new("spk", "Speakers"),
//! ]));
//! let mut driver = Driver::new(system);
//! assert!(driver.init());
//!
//! let requests = [
//!     BufferRequest { channel: 0, is_input: false },
//!     BufferRequest { channel: 1, is_input: false },
//! ];
//! let buffers = driver
//!     .create_buffers(&requests, 64, Arc::new(MyHost))
//!     .unwrap();
//! driver.start().unwrap();
//! // ... host writes into `buffers` on each bufferSwitch ...
//! driver.stop().unwrap();
//! ```

pub mod assets;
mod driver;
pub mod host;
pub mod settings;

pub use driver::Driver;
pub use host::{
    BUFFER_SIZE_RANGE, BufferRequest, BufferSizeRange, CHANNEL_NAMES, ChannelInfo, ClockSource,
    DRIVER_NAME, DRIVER_VERSION, DriverError, DriverResult, SampleType, clock_sources,
    split_words,
};
pub use settings::{DEFAULT_DEVICE, DriverSettings, LogLevel, SettingsError};

// Hosts implement the callback table defined by the engine.
pub use trgkasio_engine::{HostCallbacks, SamplePosition, SharedBuffers};
