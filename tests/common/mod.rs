//! Shared helper for writing minimal 16-bit PCM WAV fixtures to a
//! temp directory. Used by both integration test binaries.

use std::io::Write;
use std::path::{Path, PathBuf};

pub fn write_wav(dir: &Path, name: &str, sample_rate: u32, channels: u16, interleaved: &[i16]) -> PathBuf {
    let path = dir.join(name);
    let bytes_per_sample = 2u16;
    let block_align = channels * bytes_per_sample;
    let data_bytes = interleaved.len() * 2;
    let byte_rate = sample_rate * block_align as u32;

    let mut buf = Vec::with_capacity(44 + data_bytes);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&((36 + data_bytes) as u32).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_bytes as u32).to_le_bytes());
    for sample in interleaved {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    let mut file = std::fs::File::create(&path).expect("create wav fixture");
    file.write_all(&buf).expect("write wav fixture");
    path
}

/// A stereo sine tone at `amplitude` (0..=32767), `freq_hz`, for
/// `seconds` seconds at `sample_rate`.
pub fn sine_stereo(sample_rate: u32, freq_hz: f64, seconds: f64, amplitude: i16) -> Vec<i16> {
    let frames = (sample_rate as f64 * seconds) as usize;
    let mut out = Vec::with_capacity(frames * 2);
    for n in 0..frames {
        let t = n as f64 / sample_rate as f64;
        let s = (amplitude as f64 * (2.0 * std::f64::consts::PI * freq_hz * t).sin()) as i16;
        out.push(s);
        out.push(s);
    }
    out
}

/// `frames` frames of constant-amplitude DC, replicated across
/// `channels` channels.
pub fn dc(frames: usize, channels: u16, amplitude: i16) -> Vec<i16> {
    let mut out = Vec::with_capacity(frames * channels as usize);
    for _ in 0..frames {
        for _ in 0..channels {
            out.push(amplitude);
        }
    }
    out
}
