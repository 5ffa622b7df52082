//! WAV source: chunked RIFF/WAVE parsing and seekable PCM frame reads.
//!
//! Mirrors the chunk-walking approach of a conventional WAV decoder: the
//! `fmt ` chunk may be followed by `LIST`/`fact`/vendor chunks before
//! `data`, so chunks are always skipped by their declared size rather
//! than assumed to sit at a fixed offset.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

const RIFF_ID: u32 = 0x4646_4952; // "RIFF"
const WAVE_ID: u32 = 0x4556_4157; // "WAVE"
const FMT_ID: u32 = 0x2074_6d66; // "fmt "
const DATA_ID: u32 = 0x6174_6164; // "data"
const WAVE_FORMAT_PCM: u16 = 1;

/// Read-ahead size `FsStorage` buffers in, matching a typical SD card
/// sector/erase-block granularity (see Design Notes: "prefer read-aligned
/// block sizes matching the storage sector").
const STORAGE_READ_AHEAD: usize = 4096;

/// Errors returned while opening or reading a WAV asset.
#[derive(Debug, Error)]
pub enum WavError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed WAV header: {0}")]
    MalformedHeader(String),
    #[error("unsupported WAV format: {0}")]
    UnsupportedFormat(String),
}

/// A random-access, seekable byte source identified by a UTF-8 path.
///
/// The mixer only ever calls `open`, `read_bytes`, and `seek` on this
/// trait; a default filesystem-backed implementation is provided as
/// [`FsStorage`].
pub trait Storage: Send {
    type Handle: Read + Seek + Send;

    fn open(&self, path: &str) -> std::io::Result<Self::Handle>;
}

/// Default filesystem-backed [`Storage`].
///
/// Wraps the raw `File` in a [`BufReader`] so sequential frame reads pull
/// `STORAGE_READ_AHEAD`-sized chunks from the card rather than one small
/// read per `read_frames` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

impl Storage for FsStorage {
    type Handle = BufReader<File>;

    fn open(&self, path: &str) -> std::io::Result<BufReader<File>> {
        let file = File::open(Path::new(path))?;
        Ok(BufReader::with_capacity(STORAGE_READ_AHEAD, file))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FmtChunk {
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
}

/// An opened PCM WAV asset with position state.
pub struct WavSource<H: Read + Seek> {
    handle: H,
    display_name: String,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    data_start: u64,
    total_frames: u64,
    frames_remaining: u64,
    bytes_per_frame: u32,
}

impl<H: Read + Seek> WavSource<H> {
    /// Parse and open a WAV asset from an already-opened handle.
    ///
    /// `display_name` is retained only for introspection (e.g. the
    /// mixer's `channel_filename` query); it need not match `path` used
    /// to open the handle.
    pub fn open(mut handle: H, display_name: impl Into<String>) -> Result<Self, WavError> {
        let display_name = display_name.into();

        let riff = read_u32(&mut handle, &display_name)?;
        if riff != RIFF_ID {
            return Err(WavError::MalformedHeader("missing RIFF magic".into()));
        }
        let _riff_size = read_u32(&mut handle, &display_name)?;
        let wave = read_u32(&mut handle, &display_name)?;
        if wave != WAVE_ID {
            return Err(WavError::MalformedHeader("missing WAVE magic".into()));
        }

        let mut fmt: Option<FmtChunk> = None;
        let mut data_start = None;
        let mut data_size = 0u32;

        loop {
            let id = match read_u32(&mut handle, &display_name) {
                Ok(v) => v,
                Err(_) => break,
            };
            let size = read_u32(&mut handle, &display_name)?;

            match id {
                FMT_ID => {
                    fmt = Some(read_fmt_chunk(&mut handle, size, &display_name)?);
                }
                DATA_ID => {
                    data_start = Some(seek_pos(&mut handle, &display_name)?);
                    data_size = size;
                    break;
                }
                _ => {
                    seek_relative(&mut handle, size as i64, &display_name)?;
                }
            }
        }

        let fmt = fmt.ok_or_else(|| WavError::MalformedHeader("no fmt chunk found".into()))?;
        let data_start =
            data_start.ok_or_else(|| WavError::MalformedHeader("no data chunk found".into()))?;

        let bytes_per_sample = fmt.bits_per_sample as u32 / 8;
        let bytes_per_frame = bytes_per_sample * fmt.channels as u32;
        if bytes_per_frame == 0 {
            return Err(WavError::MalformedHeader("zero-size frame".into()));
        }

        // Clamp a declared data-chunk size that overruns the remaining
        // stream length rather than trusting it blindly.
        let remaining_len = remaining_stream_len(&mut handle, &display_name)?;
        let clamped_size = (data_size as u64).min(remaining_len);
        let total_frames = clamped_size / bytes_per_frame as u64;

        // Position the stream at the start of frame data.
        handle
            .seek(SeekFrom::Start(data_start))
            .map_err(|e| io_err(&display_name, e))?;

        Ok(WavSource {
            handle,
            display_name,
            sample_rate: fmt.sample_rate,
            channels: fmt.channels,
            bits_per_sample: fmt.bits_per_sample,
            data_start,
            total_frames,
            frames_remaining: total_frames,
            bytes_per_frame,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn frames_remaining(&self) -> u64 {
        self.frames_remaining
    }

    pub fn bytes_per_frame(&self) -> u32 {
        self.bytes_per_frame
    }

    /// Read up to `n` frames into `into_buf`, which must be at least `n
    /// * bytes_per_frame()` bytes. Returns the number of frames actually
    /// read (may be less than `n` near end of stream).
    pub fn read_frames(&mut self, into_buf: &mut [u8], n: u64) -> Result<u64, WavError> {
        let want_frames = n.min(self.frames_remaining);
        let want_bytes = (want_frames * self.bytes_per_frame as u64) as usize;
        debug_assert!(into_buf.len() >= want_bytes);

        let mut read_total = 0usize;
        while read_total < want_bytes {
            let n = self
                .handle
                .read(&mut into_buf[read_total..want_bytes])
                .map_err(|e| io_err(&self.display_name, e))?;
            if n == 0 {
                break;
            }
            read_total += n;
        }

        let frames_read = read_total as u64 / self.bytes_per_frame as u64;
        self.frames_remaining -= frames_read;
        Ok(frames_read)
    }

    /// Seek to frame `n` measured from the start of the data chunk.
    pub fn seek_frames(&mut self, n: u64) -> Result<(), WavError> {
        let n = n.min(self.total_frames);
        let byte_off = self.data_start + n * self.bytes_per_frame as u64;
        self.handle
            .seek(SeekFrom::Start(byte_off))
            .map_err(|e| io_err(&self.display_name, e))?;
        self.frames_remaining = self.total_frames - n;
        Ok(())
    }

    /// Rewind to the start of the data chunk (used for looping).
    pub fn rewind(&mut self) -> Result<(), WavError> {
        self.seek_frames(0)
    }
}

fn read_u32<H: Read>(handle: &mut H, name: &str) -> Result<u32, WavError> {
    let mut buf = [0u8; 4];
    handle.read_exact(&mut buf).map_err(|e| io_err(name, e))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u16<H: Read>(handle: &mut H, name: &str) -> Result<u16, WavError> {
    let mut buf = [0u8; 2];
    handle.read_exact(&mut buf).map_err(|e| io_err(name, e))?;
    Ok(u16::from_le_bytes(buf))
}

fn read_fmt_chunk<H: Read + Seek>(handle: &mut H, size: u32, name: &str) -> Result<FmtChunk, WavError> {
    if size < 16 {
        return Err(WavError::MalformedHeader("fmt chunk too small".into()));
    }
    let format = read_u16(handle, name)?;
    let channels = read_u16(handle, name)?;
    let sample_rate = read_u32(handle, name)?;
    let _byte_rate = read_u32(handle, name)?;
    let _block_align = read_u16(handle, name)?;
    let bits_per_sample = read_u16(handle, name)?;

    if size > 16 {
        seek_relative(handle, (size - 16) as i64, name)?;
    }

    if format != WAVE_FORMAT_PCM {
        return Err(WavError::UnsupportedFormat(format!(
            "audio format code {format} is not PCM"
        )));
    }
    if channels != 1 && channels != 2 {
        return Err(WavError::UnsupportedFormat(format!(
            "unsupported channel count {channels}"
        )));
    }
    if bits_per_sample != 8 && bits_per_sample != 16 {
        return Err(WavError::UnsupportedFormat(format!(
            "unsupported bit depth {bits_per_sample}"
        )));
    }
    if !(8_000..=192_000).contains(&sample_rate) {
        return Err(WavError::UnsupportedFormat(format!(
            "sample rate {sample_rate} out of range"
        )));
    }

    Ok(FmtChunk {
        channels,
        sample_rate,
        bits_per_sample,
    })
}

fn seek_relative<H: Seek>(handle: &mut H, delta: i64, name: &str) -> Result<(), WavError> {
    handle
        .seek(SeekFrom::Current(delta))
        .map_err(|e| io_err(name, e))?;
    Ok(())
}

fn seek_pos<H: Seek>(handle: &mut H, name: &str) -> Result<u64, WavError> {
    handle.stream_position().map_err(|e| io_err(name, e))
}

fn remaining_stream_len<H: Read + Seek>(handle: &mut H, name: &str) -> Result<u64, WavError> {
    let here = handle.stream_position().map_err(|e| io_err(name, e))?;
    let end = handle.seek(SeekFrom::End(0)).map_err(|e| io_err(name, e))?;
    handle
        .seek(SeekFrom::Start(here))
        .map_err(|e| io_err(name, e))?;
    Ok(end.saturating_sub(here))
}

fn io_err(name: &str, source: std::io::Error) -> WavError {
    WavError::Io {
        path: name.to_string(),
        source,
    }
}

/// Open a WAV file from the filesystem; convenience wrapper used by the
/// mixer when resolving a `Play`/`Queue` command.
pub fn open_file(path: &str) -> Result<WavSource<BufReader<File>>, WavError> {
    let storage = FsStorage;
    let handle = storage
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WavError::NotFound(path.to_string()),
            _ => io_err(path, e),
        })?;
    WavSource::open(handle, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_wav(channels: u16, bits: u16, sample_rate: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        let data_len = data.len() as u32;
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        let block_align = channels * (bits / 8);
        let byte_rate = sample_rate * block_align as u32;
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn opens_minimal_mono8_wav() {
        let bytes = build_wav(1, 8, 22_050, &[0x80, 0x80, 0x80, 0x80]);
        let src = WavSource::open(Cursor::new(bytes), "test.wav").unwrap();
        assert_eq!(src.sample_rate(), 22_050);
        assert_eq!(src.channels(), 1);
        assert_eq!(src.bits_per_sample(), 8);
        assert_eq!(src.total_frames(), 4);
        assert_eq!(src.frames_remaining(), 4);
    }

    #[test]
    fn skips_unknown_chunk_before_data() {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&44_100u32.to_le_bytes());
        out.extend_from_slice(&(44_100u32 * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"LIST");
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&4u32.to_le_bytes());
        out.extend_from_slice(&[1, 2, 3, 4]);

        let src = WavSource::open(Cursor::new(out), "skip.wav").unwrap();
        assert_eq!(src.total_frames(), 1);
    }

    #[test]
    fn clamps_data_chunk_overrunning_stream() {
        let mut bytes = build_wav(1, 16, 44_100, &[0, 0, 1, 0]);
        // Lie about the data chunk size: claim 1000 bytes but only 4 are present.
        let len = bytes.len();
        bytes[len - 4 - 4..len - 4].copy_from_slice(&1000u32.to_le_bytes());
        let src = WavSource::open(Cursor::new(bytes), "clamp.wav").unwrap();
        assert_eq!(src.total_frames(), 2);
    }

    #[test]
    fn rejects_non_pcm_format() {
        let mut bytes = build_wav(1, 16, 44_100, &[0, 0]);
        // format code sits right after the fmt chunk size field (offset 20).
        bytes[20] = 3; // IEEE float
        bytes[21] = 0;
        let err = WavSource::open(Cursor::new(bytes), "bad.wav").unwrap_err();
        assert!(matches!(err, WavError::UnsupportedFormat(_)));
    }

    #[test]
    fn read_and_rewind_round_trip() {
        let bytes = build_wav(1, 16, 44_100, &[1, 0, 2, 0, 3, 0, 4, 0]);
        let mut src = WavSource::open(Cursor::new(bytes), "rw.wav").unwrap();
        let mut buf = [0u8; 16];
        let read = src.read_frames(&mut buf, 2).unwrap();
        assert_eq!(read, 2);
        assert_eq!(src.frames_remaining(), 2);

        src.rewind().unwrap();
        assert_eq!(src.frames_remaining(), 4);
        let read = src.read_frames(&mut buf, 4).unwrap();
        assert_eq!(read, 4);
        assert_eq!(&buf[..2], &[1, 0]);
    }

    #[test]
    fn seek_frames_clamps_to_total() {
        let bytes = build_wav(1, 16, 44_100, &[1, 0, 2, 0]);
        let mut src = WavSource::open(Cursor::new(bytes), "seek.wav").unwrap();
        src.seek_frames(100).unwrap();
        assert_eq!(src.frames_remaining(), 0);
    }

    #[test]
    fn not_found_maps_to_not_found_variant() {
        let err = open_file("/nonexistent/path/does_not_exist.wav").unwrap_err();
        assert!(matches!(err, WavError::NotFound(_)));
    }
}
