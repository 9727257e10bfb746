//! Keystroke clap sample cache and renderer.
//!
//! Each configured WAV blob is decoded once at construction, converted to
//! normalized doubles, and resampled to the engine rate; `render` then mixes
//! a cached waveform additively into a 24-bit-headroom channel buffer at a
//! frame offset. Decode or resample problems degrade to an empty renderer
//! rather than failing driver startup — keystroke feedback is a garnish, not
//! a dependency.

use std::io::Cursor;

use tracing::{debug, error, warn};

use trgkasio_core::Resampler;

/// Effect index for a key-down clap.
pub const INDEX_KEYDOWN: usize = 0;
/// Effect index for a key-up clap.
pub const INDEX_KEYUP: usize = 1;

/// Scale from normalized double to the 24-bit-headroom mix domain.
const MIX_SCALE: f64 = (1 << 23) as f64;

#[derive(Debug, thiserror::Error)]
enum ClapLoadError {
    #[error("WAV parse failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("only mono 16-bit PCM clap sounds are supported")]
    UnsupportedFormat,
}

fn load_one(bytes: &[u8], target_rate: u32) -> Result<Vec<f64>, ClapLoadError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels != 1
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(ClapLoadError::UnsupportedFormat);
    }

    let samples: Vec<f64> = reader
        .samples::<i16>()
        .map(|s| s.map(|v| f64::from(v) / 32768.0))
        .collect::<Result<_, _>>()?;

    let mut resampler = Resampler::new(spec.sample_rate, target_rate);
    let mut out = resampler.process(&samples).to_vec();
    out.extend_from_slice(resampler.flush());
    for s in &mut out {
        *s = s.clamp(-1.0, 1.0);
    }

    debug!(
        source_rate = spec.sample_rate,
        source_len = samples.len(),
        target_rate,
        target_len = out.len(),
        "clap sound loaded"
    );
    Ok(out)
}

/// Cache of resampled clap waveforms.
pub struct ClapRenderer {
    sounds: Vec<Vec<f64>>,
    sample_rate: u32,
    max_length_seconds: f64,
}

impl ClapRenderer {
    /// Decode and resample `blobs` to `target_rate`.
    ///
    /// Never fails: on any decode error the renderer comes up empty, logs
    /// the reason, and `render` becomes a no-op.
    pub fn new(blobs: &[Vec<u8>], target_rate: u32) -> Self {
        let mut sounds = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match load_one(blob, target_rate) {
                Ok(sound) => sounds.push(sound),
                Err(e) => {
                    error!(error = %e, "cannot load clap sound; keystroke feedback disabled");
                    return Self {
                        sounds: Vec::new(),
                        sample_rate: target_rate,
                        max_length_seconds: 0.0,
                    };
                }
            }
        }

        let max_length_seconds = sounds
            .iter()
            .map(|s| s.len() as f64 / f64::from(target_rate))
            .fold(0.0, f64::max);

        Self {
            sounds,
            sample_rate: target_rate,
            max_length_seconds,
        }
    }

    /// Whether any waveform was loaded.
    pub fn is_empty(&self) -> bool {
        self.sounds.is_empty()
    }

    /// Duration of the longest cached waveform, in seconds. Zero when empty.
    pub fn max_clap_sound_length(&self) -> f64 {
        self.max_length_seconds
    }

    /// The rate the waveforms were resampled to.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Additively mix waveform `index` into `mix` so that effect sample 0
    /// lands at output frame `-start_frame_offset`. Samples falling outside
    /// `mix` are skipped; the caller's compressor handles clipping.
    pub fn render(&self, mix: &mut [i32], start_frame_offset: i64, index: usize, gain: f64) {
        if self.sounds.is_empty() {
            return;
        }
        let Some(sound) = self.sounds.get(index) else {
            warn!(index, count = self.sounds.len(), "clap index out of range");
            return;
        };

        for (i, out) in mix.iter_mut().enumerate() {
            let in_pos = i as i64 + start_frame_offset;
            if in_pos < 0 {
                continue;
            }
            let Some(&sample) = sound.get(in_pos as usize) else {
                break;
            };
            *out += (sample * gain * MIX_SCALE).round() as i32;
        }
    }
}

impl std::fmt::Debug for ClapRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClapRenderer")
            .field("sounds", &self.sounds.len())
            .field("sample_rate", &self.sample_rate)
            .field("max_length_seconds", &self.max_length_seconds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mono 16-bit PCM WAV bytes from raw samples.
    fn wav_bytes(rate: u32, samples: &[i16]) -> Vec<u8> {
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

    #[test]
    fn loads_and_reports_longest_sound() {
        let short = wav_bytes(48000, &vec![1000; 480]);
        let long = wav_bytes(48000, &vec![1000; 4800]);
        let clap = ClapRenderer::new(&[short, long], 48000);
        assert!(!clap.is_empty());
        assert!((clap.max_clap_sound_length() - 0.1).abs() < 0.01);
    }

    #[test]
    fn rejects_stereo_and_degrades_to_empty() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(0i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let clap = ClapRenderer::new(&[cursor.into_inner()], 48000);
        assert!(clap.is_empty());
        assert_eq!(clap.max_clap_sound_length(), 0.0);

        let mut mix = vec![0i32; 64];
        clap.render(&mut mix, 0, INDEX_KEYDOWN, 1.0);
        assert!(mix.iter().all(|&s| s == 0));
    }

    #[test]
    fn garbage_bytes_degrade_to_empty() {
        let clap = ClapRenderer::new(&[vec![0xde, 0xad, 0xbe, 0xef]], 48000);
        assert!(clap.is_empty());
    }

    #[test]
    fn zero_gain_renders_silence() {
        let blob = wav_bytes(48000, &vec![16000; 256]);
        let clap = ClapRenderer::new(&[blob], 48000);
        let mut mix = vec![0i32; 128];
        clap.render(&mut mix, 0, 0, 0.0);
        assert!(mix.iter().all(|&s| s == 0));
    }

    #[test]
    fn peak_scales_with_gain() {
        // A same-rate load skips resampling artifacts entirely... it still
        // runs the polyphase at ratio 1/1 which is a passthrough.
        let peak_in: i16 = 16384; // 0.5 in normalized terms
        let blob = wav_bytes(48000, &vec![peak_in; 64]);
        let clap = ClapRenderer::new(&[blob], 48000);

        let mut mix = vec![0i32; 64];
        clap.render(&mut mix, 0, 0, 0.5);

        let expected = (0.5 * 0.5 * MIX_SCALE).round() as i32;
        let peak = mix.iter().copied().max().unwrap();
        assert!(
            (peak - expected).abs() <= 1,
            "peak {} vs expected {}",
            peak,
            expected
        );
    }

    #[test]
    fn offset_past_sound_leaves_mix_unchanged() {
        let blob = wav_bytes(48000, &vec![16000; 64]);
        let clap = ClapRenderer::new(&[blob], 48000);
        let mut mix = vec![7i32; 32];
        clap.render(&mut mix, 64, 0, 1.0);
        assert!(mix.iter().all(|&s| s == 7));
    }

    #[test]
    fn negative_offset_delays_the_effect() {
        let blob = wav_bytes(48000, &vec![16000; 8]);
        let clap = ClapRenderer::new(&[blob], 48000);
        let mut mix = vec![0i32; 16];
        clap.render(&mut mix, -4, 0, 1.0);
        assert!(mix[..4].iter().all(|&s| s == 0));
        assert!(mix[4..12].iter().all(|&s| s != 0));
        assert!(mix[12..].iter().all(|&s| s == 0));
    }

    #[test]
    fn render_adds_instead_of_overwriting() {
        let blob = wav_bytes(48000, &vec![16000; 16]);
        let clap = ClapRenderer::new(&[blob], 48000);
        let mut mix = vec![100i32; 16];
        clap.render(&mut mix, 0, 0, 0.0);
        assert!(mix.iter().all(|&s| s == 100));
        clap.render(&mut mix, 0, 0, 0.5);
        assert!(mix.iter().all(|&s| s > 100));
    }
}
