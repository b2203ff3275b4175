//! Fixture helpers shared by unit tests in this crate.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Minimal 16-bit PCM WAV with interleaved `frames`.
pub(crate) fn wav_fixture(rate: u32, channels: u16, frames: &[i16]) -> Vec<u8> {
    let data_len = (frames.len() * 2) as u32;
    let byte_rate = rate * channels as u32 * 2;
    let block_align = channels * 2;

    let mut f = Vec::new();
    f.extend_from_slice(b"RIFF");
    f.extend_from_slice(&(36 + data_len).to_le_bytes());
    f.extend_from_slice(b"WAVE");
    f.extend_from_slice(b"fmt ");
    f.extend_from_slice(&16u32.to_le_bytes());
    f.extend_from_slice(&1u16.to_le_bytes()); // PCM
    f.extend_from_slice(&channels.to_le_bytes());
    f.extend_from_slice(&rate.to_le_bytes());
    f.extend_from_slice(&byte_rate.to_le_bytes());
    f.extend_from_slice(&block_align.to_le_bytes());
    f.extend_from_slice(&16u16.to_le_bytes());
    f.extend_from_slice(b"data");
    f.extend_from_slice(&data_len.to_le_bytes());
    for &s in frames {
        f.extend_from_slice(&s.to_le_bytes());
    }
    f
}

/// Write `bytes` to a uniquely named temp file and return its path.
pub(crate) fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "netsink-renderer-test-{}-{}",
        std::process::id(),
        name
    ));
    let mut file = File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}
