//! The destination for the final 16-bit stereo stream: a narrow,
//! blocking push-per-frame contract, with a real `cpal`-backed transport
//! and an in-memory mock that collects statistics for tests.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no output device available")]
    NoDevice,
    #[error("unsupported stream configuration: {0}")]
    UnsupportedConfig(String),
    #[error("failed to build output stream: {0}")]
    BuildStream(String),
    #[error("failed to start output stream: {0}")]
    PlayStream(String),
    #[error("sink write failed: transport disconnected")]
    Disconnected,
}

/// The capability both concrete sinks implement.
///
/// `write_stereo_frame` is the pacing mechanism for the whole mixer: a
/// correct implementation must block (directly or via back-pressure)
/// such that one `tick()` call yields roughly one block's worth of real
/// playback time.
pub trait I2sSink {
    fn begin(&mut self, sample_rate: u32) -> Result<(), SinkError>;
    fn write_stereo_frame(&mut self, left: i16, right: i16) -> Result<(), SinkError>;
    fn end(&mut self) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------
// Mock sink
// ---------------------------------------------------------------------

/// Statistics accumulated by [`MockSink`] on every write.
#[derive(Debug, Clone)]
pub struct I2sStats {
    pub write_calls: u64,
    pub total_pairs: u64,
    pub peak_l: u16,
    pub peak_r: u16,
    pub clipping_events_l: u64,
    pub clipping_events_r: u64,
    pub rms_l: f32,
    pub rms_r: f32,
    pub zero_crossings_l: u64,
    pub zero_crossings_r: u64,
    pub silent_samples: u64,
    pub first_write_at: Option<Instant>,
    pub last_write_at: Option<Instant>,

    last_sample_l: i16,
    last_sample_r: i16,
    rms_window_l: f32,
    rms_window_r: f32,
    rms_window_count: u32,
}

impl Default for I2sStats {
    fn default() -> Self {
        I2sStats {
            write_calls: 0,
            total_pairs: 0,
            peak_l: 0,
            peak_r: 0,
            clipping_events_l: 0,
            clipping_events_r: 0,
            rms_l: 0.0,
            rms_r: 0.0,
            zero_crossings_l: 0,
            zero_crossings_r: 0,
            silent_samples: 0,
            first_write_at: None,
            last_write_at: None,
            last_sample_l: 0,
            last_sample_r: 0,
            rms_window_l: 0.0,
            rms_window_r: 0.0,
            rms_window_count: 0,
        }
    }
}

const RMS_WINDOW: u32 = 512;
const RMS_EMA_ALPHA: f32 = 0.2;

impl I2sStats {
    fn record(&mut self, left: i16, right: i16) {
        let now = Instant::now();
        if self.first_write_at.is_none() {
            self.first_write_at = Some(now);
        }
        self.last_write_at = Some(now);

        self.write_calls += 1;
        self.total_pairs += 1;

        self.peak_l = self.peak_l.max(left.unsigned_abs());
        self.peak_r = self.peak_r.max(right.unsigned_abs());

        if left == i16::MAX || left == i16::MIN {
            self.clipping_events_l += 1;
        }
        if right == i16::MAX || right == i16::MIN {
            self.clipping_events_r += 1;
        }

        if left == 0 && right == 0 {
            self.silent_samples += 1;
        }

        if sign_changed(self.last_sample_l, left) {
            self.zero_crossings_l += 1;
        }
        if sign_changed(self.last_sample_r, right) {
            self.zero_crossings_r += 1;
        }
        self.last_sample_l = left;
        self.last_sample_r = right;

        self.rms_window_l += (left as f32) * (left as f32);
        self.rms_window_r += (right as f32) * (right as f32);
        self.rms_window_count += 1;
        if self.rms_window_count >= RMS_WINDOW {
            let rms_l = (self.rms_window_l / self.rms_window_count as f32).sqrt();
            let rms_r = (self.rms_window_r / self.rms_window_count as f32).sqrt();
            self.rms_l = self.rms_l * (1.0 - RMS_EMA_ALPHA) + rms_l * RMS_EMA_ALPHA;
            self.rms_r = self.rms_r * (1.0 - RMS_EMA_ALPHA) + rms_r * RMS_EMA_ALPHA;
            self.rms_window_l = 0.0;
            self.rms_window_r = 0.0;
            self.rms_window_count = 0;
        }
    }

    fn reset(&mut self) {
        *self = I2sStats::default();
    }
}

fn sign_changed(prev: i16, cur: i16) -> bool {
    (prev > 0 && cur < 0) || (prev < 0 && cur > 0)
}

/// An in-memory sink for tests: collects [`I2sStats`] and, optionally, a
/// bounded capture of the raw interleaved stream for offline inspection.
pub struct MockSink {
    sample_rate: u32,
    stats: I2sStats,
    capture: Option<Vec<i16>>,
    capture_capacity: usize,
    running: bool,
}

impl MockSink {
    pub fn new() -> Self {
        MockSink {
            sample_rate: 0,
            stats: I2sStats::default(),
            capture: None,
            capture_capacity: 0,
            running: false,
        }
    }

    /// Capture up to `capacity` interleaved (L, R) samples for offline
    /// inspection.
    pub fn with_capture(capacity: usize) -> Self {
        let mut sink = Self::new();
        sink.capture = Some(Vec::with_capacity(capacity * 2));
        sink.capture_capacity = capacity * 2;
        sink
    }

    pub fn stats(&self) -> &I2sStats {
        &self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    pub fn captured(&self) -> &[i16] {
        self.capture.as_deref().unwrap_or(&[])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl I2sSink for MockSink {
    fn begin(&mut self, sample_rate: u32) -> Result<(), SinkError> {
        self.sample_rate = sample_rate;
        self.running = true;
        Ok(())
    }

    fn write_stereo_frame(&mut self, left: i16, right: i16) -> Result<(), SinkError> {
        self.stats.record(left, right);
        if let Some(buf) = self.capture.as_mut() {
            if buf.len() < self.capture_capacity {
                buf.push(left);
                buf.push(right);
            }
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), SinkError> {
        self.running = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// cpal-backed real sink
// ---------------------------------------------------------------------

/// Real output transport backed by `cpal`.
///
/// Bridges this crate's blocking, per-frame push contract to `cpal`'s
/// pull-based output callback through a bounded `sync_channel`. The
/// channel's bound is the back-pressure mechanism: `write_stereo_frame`
/// blocks until the callback thread has room, pacing one `tick()` to one
/// block of real output time.
pub struct CpalSink {
    stream: Option<cpal::Stream>,
    tx: Option<SyncSender<(i16, i16)>>,
    block_size: usize,
}

impl CpalSink {
    pub fn new(block_size: usize) -> Self {
        CpalSink {
            stream: None,
            tx: None,
            block_size,
        }
    }
}

impl I2sSink for CpalSink {
    fn begin(&mut self, sample_rate: u32) -> Result<(), SinkError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(SinkError::NoDevice)?;

        let config = cpal::StreamConfig {
            channels: 2,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx): (SyncSender<(i16, i16)>, Receiver<(i16, i16)>) =
            sync_channel(self.block_size * 4);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    fill_from_channel(data, &rx);
                },
                move |err| {
                    tracing::warn!(%err, "cpal output stream error");
                },
                None,
            )
            .map_err(|e| SinkError::BuildStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| SinkError::PlayStream(e.to_string()))?;

        self.stream = Some(stream);
        self.tx = Some(tx);
        Ok(())
    }

    fn write_stereo_frame(&mut self, left: i16, right: i16) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Disconnected)?;
        // Blocking push; back-pressures the mixing context against the
        // callback thread's consumption rate.
        loop {
            match tx.try_send((left, right)) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(pair)) => {
                    std::thread::sleep(Duration::from_micros(50));
                    if tx.try_send(pair).is_ok() {
                        return Ok(());
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(SinkError::Disconnected),
            }
        }
    }

    fn end(&mut self) -> Result<(), SinkError> {
        self.tx = None;
        self.stream = None;
        Ok(())
    }
}

fn fill_from_channel(data: &mut [i16], rx: &Receiver<(i16, i16)>) {
    for frame in data.chunks_mut(2) {
        match rx.try_recv() {
            Ok((l, r)) => {
                frame[0] = l;
                if frame.len() > 1 {
                    frame[1] = r;
                }
            }
            Err(_) => {
                frame.fill(0);
            }
        }
    }
}
