//! Embedded clap sound resources.
//!
//! Users may replace these by editing the files and rebuilding; the decode
//! path tolerates anything that is mono 16-bit PCM.

/// Key-down clap, mono 16-bit PCM WAV.
pub const CLAP_KEYDOWN_WAV: &[u8] = include_bytes!("../assets/clap_keydown.wav");

/// Key-up clap, mono 16-bit PCM WAV.
pub const CLAP_KEYUP_WAV: &[u8] = include_bytes!("../assets/clap_keyup.wav");

/// The clap blobs in renderer order (key-down first).
pub fn clap_sounds() -> Vec<Vec<u8>> {
    vec![CLAP_KEYDOWN_WAV.to_vec(), CLAP_KEYUP_WAV.to_vec()]
}
