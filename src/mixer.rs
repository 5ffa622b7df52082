//! The mixer core: owns the channel array, mix buffers, command ring,
//! and sink; produces one stereo block per `tick()`.

use std::sync::Arc;

use parking_lot::Mutex;
use portable_atomic::AtomicF32;
use thiserror::Error;
use tracing::warn;

use crate::channel::{
    BlockOutcome, Channel, LoopBehavior, PlayOptions, QueuedItem, Routing, StopMode,
    DEFAULT_NUM_CHANNELS,
};
use crate::codec::{CodecControl, CodecError};
use crate::command::{Command, CommandQueue, Target, DEFAULT_RING_CAPACITY};
use crate::sink::{I2sSink, SinkError};
use crate::wav::WavError;

/// Default block size `B`: 512 stereo pairs at 44.1 kHz is 11.6 ms per
/// block, per spec §5.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("sink fault: {0}")]
    SinkFault(#[from] SinkError),
    #[error("codec fault: {0}")]
    CodecFault(#[from] CodecError),
}

/// Tunables the mixer owns; an embedding application's own configuration
/// layer decides these values and hands them in (configuration *loading*
/// itself is out of scope for this crate).
#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub num_channels: usize,
    pub command_ring_capacity: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        MixerConfig {
            sample_rate: 44_100,
            block_size: DEFAULT_BLOCK_SIZE,
            num_channels: DEFAULT_NUM_CHANNELS,
            command_ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

/// A point-in-time, `Copy`-friendly view of one channel's state, safe to
/// read from the control context without touching live `Channel` data.
#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    pub is_playing: bool,
    /// `-1` if looping infinitely, otherwise milliseconds remaining in
    /// the current iteration.
    pub remaining_ms: i64,
    pub filename: String,
    pub gain: f32,
    pub routing: Routing,
    pub loop_remaining: i32,
    pub loop_initial: i32,
    pub sample_rate: u32,
    pub num_channels: u16,
    pub bits_per_sample: u16,
    pub total_frames: u64,
    pub has_queued: bool,
}

impl ChannelStatus {
    fn capture(channel: &Channel) -> Self {
        let remaining_ms = match channel.frames_remaining() {
            Some(remaining) if channel.is_looping() && channel.loop_remaining() == -1 => {
                let _ = remaining;
                -1
            }
            Some(remaining) => {
                let rate = channel.sample_rate().unwrap_or(44_100).max(1) as u64;
                (remaining * 1000 / rate) as i64
            }
            None => 0,
        };

        ChannelStatus {
            is_playing: channel.is_active(),
            remaining_ms,
            filename: channel.filename().to_string(),
            gain: channel.gain(),
            routing: channel.routing(),
            loop_remaining: channel.loop_remaining(),
            loop_initial: channel.loop_initial(),
            sample_rate: channel.sample_rate().unwrap_or(0),
            num_channels: channel.num_channels().unwrap_or(0),
            bits_per_sample: channel.bits_per_sample().unwrap_or(0),
            total_frames: channel.total_frames().unwrap_or(0),
            has_queued: channel.has_queued(),
        }
    }
}

/// State shared between the mixing-context-owned [`MixerCore`] and any
/// number of control-context [`MixerHandle`]s: the lock-free command
/// ring, per-channel status snapshots, and the master volume atomic.
struct MixerShared {
    queue: CommandQueue,
    snapshots: Vec<Mutex<ChannelStatus>>,
    master_gain: AtomicF32,
}

/// A cheap, `Clone`-able handle the control context uses to enqueue
/// commands and read introspection snapshots without touching channel
/// data directly.
#[derive(Clone)]
pub struct MixerHandle {
    shared: Arc<MixerShared>,
}

impl MixerHandle {
    fn channel_count(&self) -> usize {
        self.shared.snapshots.len()
    }

    fn push(&self, command: Command) -> bool {
        self.shared.queue.push(command).is_ok()
    }

    pub fn play_async(&self, channel: usize, filename: impl Into<String>, options: PlayOptions) -> bool {
        if channel >= self.channel_count() {
            return false;
        }
        self.push(Command::Play {
            channel,
            filename: filename.into(),
            options,
        })
    }

    pub fn stop_async(&self, channel: usize, mode: StopMode) -> bool {
        if channel >= self.channel_count() {
            return false;
        }
        self.push(Command::Stop { channel, mode })
    }

    pub fn stop_all_async(&self, mode: StopMode) -> bool {
        self.push(Command::StopAll { mode })
    }

    pub fn set_volume_async(&self, channel: usize, gain: f32) -> bool {
        if channel >= self.channel_count() {
            return false;
        }
        self.push(Command::SetVolume {
            channel,
            gain: gain.clamp(0.0, 1.0),
        })
    }

    pub fn set_master_volume_async(&self, gain: f32) -> bool {
        self.push(Command::SetMasterVolume {
            gain: gain.clamp(0.0, 1.0),
        })
    }

    pub fn queue_async(
        &self,
        channel: usize,
        filename: impl Into<String>,
        options: PlayOptions,
        behavior: LoopBehavior,
    ) -> bool {
        if channel >= self.channel_count() || options.loop_count < 0 {
            return false;
        }
        self.push(Command::Queue {
            channel,
            filename: filename.into(),
            options,
            behavior,
        })
    }

    pub fn clear_queue_async(&self, channel: usize) -> bool {
        if channel >= self.channel_count() {
            return false;
        }
        self.push(Command::ClearQueue {
            target: Target::Channel(channel),
        })
    }

    pub fn clear_queue_all_async(&self) -> bool {
        self.push(Command::ClearQueue { target: Target::All })
    }

    pub fn is_playing(&self, channel: usize) -> bool {
        self.snapshot(channel).map(|s| s.is_playing).unwrap_or(false)
    }

    pub fn is_any_playing(&self) -> bool {
        self.shared.snapshots.iter().any(|s| s.lock().is_playing)
    }

    pub fn remaining_ms(&self, channel: usize) -> i64 {
        self.snapshot(channel).map(|s| s.remaining_ms).unwrap_or(0)
    }

    pub fn channel_filename(&self, channel: usize) -> String {
        self.snapshot(channel).map(|s| s.filename).unwrap_or_default()
    }

    pub fn channel_gain(&self, channel: usize) -> f32 {
        self.snapshot(channel).map(|s| s.gain).unwrap_or(0.0)
    }

    pub fn channel_is_looping(&self, channel: usize) -> bool {
        self.snapshot(channel).map(|s| s.loop_remaining != 0).unwrap_or(false)
    }

    pub fn channel_loop_remaining(&self, channel: usize) -> i32 {
        self.snapshot(channel).map(|s| s.loop_remaining).unwrap_or(0)
    }

    pub fn channel_loop_initial(&self, channel: usize) -> i32 {
        self.snapshot(channel).map(|s| s.loop_initial).unwrap_or(0)
    }

    pub fn channel_routing(&self, channel: usize) -> Routing {
        self.snapshot(channel).map(|s| s.routing).unwrap_or_default()
    }

    pub fn channel_sample_rate(&self, channel: usize) -> u32 {
        self.snapshot(channel).map(|s| s.sample_rate).unwrap_or(0)
    }

    pub fn channel_num_channels(&self, channel: usize) -> u16 {
        self.snapshot(channel).map(|s| s.num_channels).unwrap_or(0)
    }

    pub fn channel_bits_per_sample(&self, channel: usize) -> u16 {
        self.snapshot(channel).map(|s| s.bits_per_sample).unwrap_or(0)
    }

    pub fn channel_total_frames(&self, channel: usize) -> u64 {
        self.snapshot(channel).map(|s| s.total_frames).unwrap_or(0)
    }

    pub fn has_queued(&self, channel: usize) -> bool {
        self.snapshot(channel).map(|s| s.has_queued).unwrap_or(false)
    }

    pub fn master_volume(&self) -> f32 {
        self.shared.master_gain.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn snapshot(&self, channel: usize) -> Option<ChannelStatus> {
        self.shared.snapshots.get(channel).map(|s| s.lock().clone())
    }
}

/// Owns the channel array, mix buffers, and sink. Runs on the mixing
/// context: `tick()` should be called once per block, in a tight loop or
/// from a DMA-complete callback.
pub struct MixerCore<S: I2sSink> {
    config: MixerConfig,
    channels: Vec<Channel>,
    mix_l: Vec<i32>,
    mix_r: Vec<i32>,
    read_buf: Vec<u8>,
    sink: S,
    codec: Arc<Mutex<dyn CodecControl>>,
    shared: Arc<MixerShared>,
    running: bool,
}

impl<S: I2sSink> MixerCore<S> {
    /// Initialize the codec (clock tree, power rails, default volumes),
    /// then the sink, then zero all channel and status state — codec
    /// before sink, per the startup-ordering design note, so the first
    /// block is never emitted while the DAC is unlocked or muted.
    pub fn begin(
        config: MixerConfig,
        mut sink: S,
        codec: Arc<Mutex<dyn CodecControl>>,
    ) -> Result<Self, MixerError> {
        codec.lock().begin(config.sample_rate)?;
        sink.begin(config.sample_rate)?;

        let num_channels = config.num_channels;
        let channels = (0..num_channels).map(|_| Channel::new()).collect();
        let snapshots = (0..num_channels)
            .map(|_| Mutex::new(ChannelStatus::default()))
            .collect();

        Ok(MixerCore {
            mix_l: vec![0; config.block_size],
            mix_r: vec![0; config.block_size],
            read_buf: vec![0u8; config.block_size * 4], // worst case: stereo16
            channels,
            sink,
            codec,
            shared: Arc::new(MixerShared {
                queue: CommandQueue::new(config.command_ring_capacity),
                snapshots,
                master_gain: AtomicF32::new(1.0),
            }),
            running: true,
            config,
        })
    }

    /// A cheap handle for the control context: async commands plus
    /// lock-free-ish introspection.
    pub fn handle(&self) -> MixerHandle {
        MixerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Stop all channels, close storage handles, stop the sink.
    pub fn shutdown(&mut self) -> Result<(), MixerError> {
        for channel in &mut self.channels {
            channel.close();
        }
        self.sink.end()?;
        self.running = false;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Synchronous API (mixing-context only, or single-threaded caller)
    // -----------------------------------------------------------------

    pub fn play(&mut self, channel: usize, filename: &str, options: PlayOptions) -> bool {
        let Some(_) = self.channels.get(channel) else {
            return false;
        };
        self.open_and_start(channel, filename, options)
    }

    pub fn stop(&mut self, channel: usize, mode: StopMode) -> bool {
        let block_size = self.config.block_size as u32;
        let Some(ch) = self.channels.get_mut(channel) else {
            return false;
        };
        ch.stop(mode, block_size);
        true
    }

    pub fn stop_all(&mut self, mode: StopMode) {
        let block_size = self.config.block_size as u32;
        for ch in &mut self.channels {
            ch.stop(mode, block_size);
        }
    }

    pub fn stop_looping(&mut self, channel: usize) -> bool {
        let Some(ch) = self.channels.get_mut(channel) else {
            return false;
        };
        ch.stop_looping();
        true
    }

    pub fn stop_looping_all(&mut self) {
        for ch in &mut self.channels {
            ch.stop_looping();
        }
    }

    pub fn queue(
        &mut self,
        channel: usize,
        filename: &str,
        options: PlayOptions,
        behavior: LoopBehavior,
    ) -> bool {
        if options.loop_count < 0 {
            return false;
        }
        self.apply_queue(channel, filename, options, behavior)
    }

    pub fn clear_queue(&mut self, channel: usize) -> bool {
        let Some(ch) = self.channels.get_mut(channel) else {
            return false;
        };
        ch.clear_queue();
        true
    }

    pub fn clear_queue_all(&mut self) {
        for ch in &mut self.channels {
            ch.clear_queue();
        }
    }

    pub fn set_volume(&mut self, channel: usize, gain: f32) -> bool {
        let Some(ch) = self.channels.get_mut(channel) else {
            return false;
        };
        ch.set_gain(gain);
        true
    }

    pub fn set_master_volume(&mut self, gain: f32) {
        self.shared
            .master_gain
            .store(gain.clamp(0.0, 1.0), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn set_routing(&mut self, channel: usize, routing: Routing) -> bool {
        let Some(ch) = self.channels.get_mut(channel) else {
            return false;
        };
        ch.set_routing(routing);
        true
    }

    // -----------------------------------------------------------------
    // Introspection (valid to call from the mixing context directly;
    // use `handle()` from other contexts)
    // -----------------------------------------------------------------

    pub fn is_playing(&self, channel: usize) -> bool {
        self.channels.get(channel).map(|c| c.is_active()).unwrap_or(false)
    }

    pub fn is_any_playing(&self) -> bool {
        self.channels.iter().any(|c| c.is_active())
    }

    /// Live read of a channel's FIFO, straight from `Channel` rather than
    /// the status snapshot (which only refreshes once per `tick()`).
    pub fn has_queued(&self, channel: usize) -> bool {
        self.channels.get(channel).map(|c| c.has_queued()).unwrap_or(false)
    }

    pub fn master_volume(&self) -> f32 {
        self.shared.master_gain.load(std::sync::atomic::Ordering::Relaxed)
    }

    // -----------------------------------------------------------------
    // The mix tick
    // -----------------------------------------------------------------

    /// Produce and push one stereo block. Must complete in strictly less
    /// than `block_size / sample_rate` seconds to avoid underrun.
    pub fn tick(&mut self) -> Result<(), MixerError> {
        debug_assert!(self.running, "tick() called before begin() or after shutdown()");

        for command in self.shared.queue.drain() {
            self.apply_command(command);
        }

        self.mix_l.fill(0);
        self.mix_r.fill(0);

        let block_size = self.config.block_size;
        let master_gain = self.master_volume();
        let bytes_per_frame = self.read_buf.len() / block_size;

        for idx in 0..self.channels.len() {
            if !self.channels[idx].is_active() {
                continue;
            }
            let outcome = {
                let buf = &mut self.read_buf[..block_size * bytes_per_frame];
                self.channels[idx].mix_block(
                    &mut self.mix_l,
                    &mut self.mix_r,
                    block_size,
                    master_gain,
                    buf,
                )
            };
            if let BlockOutcome::SourceEnded = outcome {
                if let Some(item) = self.channels[idx].on_source_ended() {
                    self.start_queued_item(idx, item);
                }
            }
        }

        self.refresh_snapshots();

        for i in 0..block_size {
            let l = soft_clip(self.mix_l[i]);
            let r = soft_clip(self.mix_r[i]);
            self.sink.write_stereo_frame(l, r)?;
        }

        Ok(())
    }

    fn refresh_snapshots(&self) {
        for (ch, slot) in self.channels.iter().zip(self.shared.snapshots.iter()) {
            *slot.lock() = ChannelStatus::capture(ch);
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Play {
                channel,
                filename,
                options,
            } => {
                self.open_and_start(channel, &filename, options);
            }
            Command::Stop { channel, mode } => {
                self.stop(channel, mode);
            }
            Command::StopAll { mode } => self.stop_all(mode),
            Command::SetVolume { channel, gain } => {
                self.set_volume(channel, gain);
            }
            Command::SetMasterVolume { gain } => self.set_master_volume(gain),
            Command::SetRouting { channel, routing } => {
                self.set_routing(channel, routing);
            }
            Command::StopLooping { target } => match target {
                Target::Channel(ch) => {
                    self.stop_looping(ch);
                }
                Target::All => self.stop_looping_all(),
            },
            Command::Queue {
                channel,
                filename,
                options,
                behavior,
            } => {
                self.apply_queue(channel, &filename, options, behavior);
            }
            Command::ClearQueue { target } => match target {
                Target::Channel(ch) => {
                    self.clear_queue(ch);
                }
                Target::All => self.clear_queue_all(),
            },
        }
    }

    fn open_and_start(&mut self, channel: usize, filename: &str, options: PlayOptions) -> bool {
        let Some(ch) = self.channels.get_mut(channel) else {
            return false;
        };
        match Channel::open_source(filename) {
            Ok(source) => {
                ch.start(filename, source, options);
                true
            }
            Err(err) => {
                log_open_failure(filename, &err);
                false
            }
        }
    }

    fn apply_queue(
        &mut self,
        channel: usize,
        filename: &str,
        options: PlayOptions,
        behavior: LoopBehavior,
    ) -> bool {
        let Some(ch) = self.channels.get_mut(channel) else {
            return false;
        };

        if !ch.is_active() {
            // "processed ... at the next tick if the channel was already
            // idle" (spec §5): start it directly rather than leaving it
            // queued behind nothing.
            return self.open_and_start(channel, filename, options);
        }

        if behavior == LoopBehavior::StopImmediate && self.channels[channel].take_for_immediate_preempt() {
            return self.open_and_start(channel, filename, options);
        }

        let item = QueuedItem {
            filename: filename.to_string(),
            options,
            behavior,
        };
        self.channels[channel].enqueue(item)
    }

    fn start_queued_item(&mut self, channel: usize, item: QueuedItem) {
        self.open_and_start(channel, &item.filename, item.options);
        let _ = item.behavior; // consumed above via play semantics
    }
}

fn log_open_failure(filename: &str, err: &WavError) {
    warn!(filename, %err, "play/queue command consumed: asset could not be opened");
}

/// Piecewise-linear soft-knee saturation at the 16-bit boundary, per
/// spec §4.3 step 6, with a final hard clamp so invariant #2 (`-32768 <=
/// s <= 32767` for every output sample) holds unconditionally even for
/// accumulator values far beyond the documented knee points.
pub fn soft_clip(s: i32) -> i16 {
    let shaped = if s > 32767 {
        32767 - (32767 - s) / 8
    } else if s < -32768 {
        -32768 - (-32768 - s) / 8
    } else {
        s
    };
    shaped.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}
