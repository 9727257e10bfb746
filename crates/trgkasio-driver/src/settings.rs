//! Driver settings: the `trgkASIO.json` document.
//!
//! A missing file means defaults; a malformed file is an error the caller
//! surfaces through `init`. The `deviceId` key accepts either a single
//! string or an ordered list; the reserved value `(default device)` (and the
//! legacy empty string) refers to the system default output at
//! initialization time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Reserved endpoint identifier meaning "the current default output".
pub const DEFAULT_DEVICE: &str = "(default device)";

/// Configuration file name, resolved against the user's home directory.
pub const SETTINGS_FILE_NAME: &str = "trgkASIO.json";

/// Errors from loading or saving the settings document.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Could not read or write the file.
    #[error("settings file '{path}': {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON (or has wrongly typed values).
    #[error("settings parse failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is outside its permitted range.
    #[error("invalid setting: {0}")]
    InvalidValue(String),
}

/// Log verbosity, the `logLevel` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Everything, including per-block tracing.
    Trace,
    /// Developer diagnostics.
    Debug,
    /// Default.
    #[default]
    Info,
    /// Only problems.
    Warn,
    /// Only failures.
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// The `tracing` filter directive for this level.
    pub fn filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Immutable driver configuration.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Output channel count, 1..=32.
    pub channel_count: u16,
    /// Engine sample rate in Hz. Not part of the JSON document; hosts set
    /// it through the sample-rate API.
    pub sample_rate: u32,
    /// Gain applied to clap samples, 0.0..=1.0.
    pub clap_gain: f64,
    /// Poll loop yields with 1 ms sleeps instead of busy-waiting.
    pub throttle: bool,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Ordered target endpoint identifiers (ids or friendly names).
    pub device_ids: Vec<String>,
    /// Per-endpoint buffer-duration overrides in 100 ns units.
    pub duration_overrides: BTreeMap<String, i64>,
    /// Endpoint to capture via loopback; empty disables.
    pub loopback_input_device: String,
    /// Redirect the default output to the loopback source while running.
    pub auto_change_output_to_loopback: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            channel_count: 2,
            sample_rate: 48000,
            clap_gain: 0.0,
            throttle: true,
            log_level: LogLevel::Info,
            device_ids: vec![DEFAULT_DEVICE.to_string()],
            duration_overrides: BTreeMap::new(),
            loopback_input_device: String::new(),
            auto_change_output_to_loopback: false,
        }
    }
}

/// `deviceId` accepts a bare string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeviceIdField {
    One(String),
    Many(Vec<String>),
}

impl Default for DeviceIdField {
    fn default() -> Self {
        Self::Many(vec![DEFAULT_DEVICE.to_string()])
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawSettings {
    channel_count: Option<u16>,
    clap_gain: Option<f64>,
    throttle: Option<bool>,
    log_level: Option<String>,
    device_id: DeviceIdField,
    duration_override: BTreeMap<String, i64>,
    loopback_input_device: Option<String>,
    auto_change_output_to_loopback: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawSettingsOut<'a> {
    channel_count: u16,
    clap_gain: f64,
    throttle: bool,
    log_level: &'a str,
    device_id: &'a [String],
    duration_override: &'a BTreeMap<String, i64>,
    loopback_input_device: &'a str,
    auto_change_output_to_loopback: bool,
}

impl DriverSettings {
    /// The conventional settings location: `~/trgkASIO.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(SETTINGS_FILE_NAME))
    }

    /// Load from `path`. A missing file yields defaults; malformed JSON and
    /// out-of-range values are errors.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "settings file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_json(&text)
    }

    /// Parse a settings document.
    pub fn from_json(text: &str) -> Result<Self, SettingsError> {
        let raw: RawSettings = serde_json::from_str(text)?;
        let defaults = Self::default();

        let channel_count = raw.channel_count.unwrap_or(defaults.channel_count);
        if !(1..=32).contains(&channel_count) {
            return Err(SettingsError::InvalidValue(format!(
                "channelCount {channel_count} outside 1..=32"
            )));
        }

        let clap_gain = raw.clap_gain.unwrap_or(defaults.clap_gain);
        if !(0.0..=1.0).contains(&clap_gain) {
            return Err(SettingsError::InvalidValue(format!(
                "clapGain {clap_gain} outside 0..=1"
            )));
        }

        let log_level = match raw.log_level.as_deref() {
            None | Some("") => defaults.log_level,
            Some(s) => LogLevel::parse(s).ok_or_else(|| {
                SettingsError::InvalidValue(format!("unknown logLevel '{s}'"))
            })?,
        };

        let device_ids = match raw.device_id {
            DeviceIdField::One(id) => vec![id],
            DeviceIdField::Many(ids) if ids.is_empty() => defaults.device_ids.clone(),
            DeviceIdField::Many(ids) => ids,
        };

        Ok(Self {
            channel_count,
            sample_rate: defaults.sample_rate,
            clap_gain,
            throttle: raw.throttle.unwrap_or(defaults.throttle),
            log_level,
            device_ids,
            duration_overrides: raw.duration_override,
            loopback_input_device: raw.loopback_input_device.unwrap_or_default(),
            auto_change_output_to_loopback: raw
                .auto_change_output_to_loopback
                .unwrap_or(defaults.auto_change_output_to_loopback),
        })
    }

    /// Serialize back to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, SettingsError> {
        let raw = RawSettingsOut {
            channel_count: self.channel_count,
            clap_gain: self.clap_gain,
            throttle: self.throttle,
            log_level: self.log_level.filter_str(),
            device_id: &self.device_ids,
            duration_override: &self.duration_overrides,
            loopback_input_device: &self.loopback_input_device,
            auto_change_output_to_loopback: self.auto_change_output_to_loopback,
        };
        Ok(serde_json::to_string_pretty(&raw)?)
    }

    /// Write the document to `path`.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let s = DriverSettings::default();
        assert_eq!(s.channel_count, 2);
        assert_eq!(s.clap_gain, 0.0);
        assert!(s.throttle);
        assert_eq!(s.log_level, LogLevel::Info);
        assert_eq!(s.device_ids, vec![DEFAULT_DEVICE.to_string()]);
        assert!(s.duration_overrides.is_empty());
        assert!(s.loopback_input_device.is_empty());
        assert!(!s.auto_change_output_to_loopback);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let s = DriverSettings::from_json("{}").unwrap();
        assert_eq!(s.channel_count, 2);
        assert_eq!(s.device_ids, vec![DEFAULT_DEVICE.to_string()]);
    }

    #[test]
    fn device_id_accepts_string_or_list() {
        let one = DriverSettings::from_json(r#"{"deviceId": "Speakers"}"#).unwrap();
        assert_eq!(one.device_ids, vec!["Speakers".to_string()]);

        let many =
            DriverSettings::from_json(r#"{"deviceId": ["Speakers", "HDMI Out"]}"#).unwrap();
        assert_eq!(many.device_ids.len(), 2);
        assert_eq!(many.device_ids[1], "HDMI Out");
    }

    #[test]
    fn full_document_round_trips() {
        let text = r#"{
            "channelCount": 4,
            "clapGain": 0.5,
            "throttle": false,
            "logLevel": "debug",
            "deviceId": ["Main", "Second"],
            "durationOverride": {"Main": 100000},
            "loopbackInputDevice": "Virtual",
            "autoChangeOutputToLoopback": true
        }"#;
        let s = DriverSettings::from_json(text).unwrap();
        assert_eq!(s.channel_count, 4);
        assert_eq!(s.clap_gain, 0.5);
        assert!(!s.throttle);
        assert_eq!(s.log_level, LogLevel::Debug);
        assert_eq!(s.duration_overrides["Main"], 100000);
        assert_eq!(s.loopback_input_device, "Virtual");
        assert!(s.auto_change_output_to_loopback);

        let reparsed = DriverSettings::from_json(&s.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.channel_count, 4);
        assert_eq!(reparsed.device_ids, s.device_ids);
        assert_eq!(reparsed.duration_overrides, s.duration_overrides);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(DriverSettings::from_json(r#"{"channelCount": 0}"#).is_err());
        assert!(DriverSettings::from_json(r#"{"channelCount": 33}"#).is_err());
        assert!(DriverSettings::from_json(r#"{"clapGain": 1.5}"#).is_err());
        assert!(DriverSettings::from_json(r#"{"logLevel": "verbose"}"#).is_err());
        assert!(DriverSettings::from_json("not json").is_err());
    }

    #[test]
    fn missing_file_loads_defaults_and_saves_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);

        let s = DriverSettings::load(&path).unwrap();
        assert_eq!(s.channel_count, 2);

        s.save(&path).unwrap();
        let reloaded = DriverSettings::load(&path).unwrap();
        assert_eq!(reloaded.channel_count, 2);
        assert_eq!(reloaded.device_ids, s.device_ids);
    }
}
