//! One mix slot: the currently-playing source plus its fade/loop/queue
//! state and a bounded FIFO of follow-up items.

use std::fs::File;
use std::io::BufReader;

use crossbeam::queue::ArrayQueue;
use tracing::warn;

use crate::wav::{self, WavSource};

/// Fixed fade-out duration applied by `stop(.., StopMode::Fade)`.
///
/// The spec gives no evidence that callers need to vary this per
/// command, so it stays a crate constant rather than a command field
/// (see DESIGN.md, Open Question 1).
pub const FADE_DURATION_MS: u32 = 50;

/// Default number of channels a `MixerCore` statically allocates.
pub const DEFAULT_NUM_CHANNELS: usize = 8;

/// Default per-channel queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// Per-channel output routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Routing {
    #[default]
    Stereo,
    LeftOnly,
    RightOnly,
}

/// How a playing channel should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Terminate unconditionally, mid-block.
    Immediate,
    /// Fade to silence over [`FADE_DURATION_MS`], then terminate.
    Fade,
    /// Clear loop flags so the channel terminates at the current loop's
    /// end rather than looping again.
    LoopEnd,
}

/// How a queued item should preempt an infinitely-looping channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBehavior {
    /// Stop the current iteration immediately and start the queued item.
    StopImmediate,
    /// Let the current iteration finish, then start the queued item.
    FinishLoop,
}

/// Playback parameters accepted by `play`/`queue`.
#[derive(Debug, Clone)]
pub struct PlayOptions {
    pub gain: f32,
    pub routing: Routing,
    /// `-1` = infinite, `0` = no looping, `N > 0` = `N` additional loops.
    pub loop_count: i32,
    pub start_offset_ms: u32,
}

impl Default for PlayOptions {
    fn default() -> Self {
        PlayOptions {
            gain: 1.0,
            routing: Routing::Stereo,
            loop_count: 0,
            start_offset_ms: 0,
        }
    }
}

impl PlayOptions {
    pub(crate) fn clamped(mut self) -> Self {
        self.gain = self.gain.clamp(0.0, 1.0);
        self
    }
}

/// A deferred play request queued on a specific channel.
///
/// Invariant: `loop_count` is always finite; an infinite loop can never
/// be queued (it must be stopped, then played directly).
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub filename: String,
    pub options: PlayOptions,
    pub behavior: LoopBehavior,
}

/// Outcome of feeding one mix block's worth of frames through a channel.
pub(crate) enum BlockOutcome {
    /// Channel is still playing after this block.
    Continue,
    /// Channel's source ended (or fade completed) this block; the
    /// channel should now apply its loop/queue decision.
    SourceEnded,
}

/// One mix slot.
pub struct Channel {
    source: Option<WavSource<BufReader<File>>>,
    filename: String,
    gain: f32,
    routing: Routing,
    loop_remaining: i32,
    loop_initial: i32,
    fading: bool,
    fade_mult: f32,
    fade_step: f32,
    queue: ArrayQueue<QueuedItem>,
    /// Set by `stop(.., LoopEnd)`: clears the loop so the channel
    /// terminates once the in-flight iteration finishes.
    loop_end_requested: bool,
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            source: None,
            filename: String::new(),
            gain: 1.0,
            routing: Routing::Stereo,
            loop_remaining: 0,
            loop_initial: 0,
            fading: false,
            fade_mult: 1.0,
            fade_step: 0.0,
            queue: ArrayQueue::new(DEFAULT_QUEUE_DEPTH),
            loop_end_requested: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.source.is_some()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn set_routing(&mut self, routing: Routing) {
        // Instantaneous switch, not a crossfade (DESIGN.md Open Question 3).
        self.routing = routing;
    }

    pub fn is_looping(&self) -> bool {
        self.loop_remaining != 0
    }

    pub fn loop_remaining(&self) -> i32 {
        self.loop_remaining
    }

    pub fn loop_initial(&self) -> i32 {
        self.loop_initial
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.source.as_ref().map(|s| s.sample_rate())
    }

    pub fn num_channels(&self) -> Option<u16> {
        self.source.as_ref().map(|s| s.channels())
    }

    pub fn bits_per_sample(&self) -> Option<u16> {
        self.source.as_ref().map(|s| s.bits_per_sample())
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.source.as_ref().map(|s| s.total_frames())
    }

    pub fn frames_remaining(&self) -> Option<u64> {
        self.source.as_ref().map(|s| s.frames_remaining())
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Start playing `path` immediately, discarding any current source
    /// and any queued items (a fresh `play` always wins).
    pub(crate) fn start(
        &mut self,
        filename: &str,
        mut source: WavSource<BufReader<File>>,
        options: PlayOptions,
    ) {
        let options = options.clamped();
        if options.start_offset_ms > 0 {
            let frames_per_ms = source.sample_rate() as u64 / 1000;
            let mut offset_frames = options.start_offset_ms as u64 * frames_per_ms;
            offset_frames = offset_frames.min(source.total_frames());
            if let Err(err) = source.seek_frames(offset_frames) {
                warn!(filename, %err, "failed to seek to start offset, starting from 0");
            }
        }

        while self.queue.pop().is_some() {}
        self.source = Some(source);
        self.filename = filename.to_string();
        self.gain = options.gain;
        self.routing = options.routing;
        self.loop_remaining = options.loop_count;
        self.loop_initial = options.loop_count;
        self.fading = false;
        self.fade_mult = 1.0;
        self.fade_step = 0.0;
        self.loop_end_requested = false;
    }

    pub(crate) fn stop(&mut self, mode: StopMode, block_size: u32) {
        match mode {
            StopMode::Immediate => {
                self.source = None;
                self.fading = false;
            }
            StopMode::Fade => {
                if self.source.is_some() {
                    self.fading = true;
                    self.fade_mult = 1.0;
                    let fade_steps = fade_steps_for(self.sample_rate().unwrap_or(44_100), block_size);
                    self.fade_step = 1.0 / fade_steps as f32;
                }
            }
            StopMode::LoopEnd => {
                self.loop_end_requested = true;
            }
        }
    }

    pub(crate) fn stop_looping(&mut self) {
        self.loop_end_requested = true;
    }

    /// Enqueue a follow-up item. Rejects infinite-loop items (DESIGN.md
    /// Open Question 2) and returns `false` if the per-channel FIFO is
    /// full.
    pub(crate) fn enqueue(&mut self, item: QueuedItem) -> bool {
        if item.options.loop_count < 0 {
            warn!("rejected queue request with infinite loop_count");
            return false;
        }
        self.queue.push(item).is_ok()
    }

    pub(crate) fn clear_queue(&mut self) {
        while self.queue.pop().is_some() {}
    }

    /// Mix up to `n` frames of this channel's source into the `i32`
    /// accumulators, applying gain, routing, and fade. Returns whether
    /// the source ended (or the fade completed) during this block.
    pub(crate) fn mix_block(
        &mut self,
        out_l: &mut [i32],
        out_r: &mut [i32],
        n: usize,
        master_gain: f32,
        read_buf: &mut [u8],
    ) -> BlockOutcome {
        let Some(source) = self.source.as_mut() else {
            return BlockOutcome::SourceEnded;
        };

        let bytes_per_frame = source.bytes_per_frame() as usize;
        debug_assert!(read_buf.len() >= n * bytes_per_frame);

        let want = (n as u64).min(source.frames_remaining());
        let read = match source.read_frames(read_buf, want) {
            Ok(r) => r as usize,
            Err(err) => {
                warn!(filename = %self.filename, %err, "read error during mix, terminating channel");
                self.source = None;
                return BlockOutcome::SourceEnded;
            }
        };

        let bits = source.bits_per_sample();
        let channels = source.channels();
        let scale = self.gain * master_gain * self.fade_mult;

        for i in 0..read {
            let base = i * bytes_per_frame;
            let (l_raw, r_raw) = decode_frame(&read_buf[base..base + bytes_per_frame], bits, channels);
            let l = (l_raw as f32 * scale) as i32;
            let r = (r_raw as f32 * scale) as i32;
            match self.routing {
                Routing::Stereo => {
                    out_l[i] += l;
                    out_r[i] += r;
                }
                Routing::LeftOnly => out_l[i] += l,
                Routing::RightOnly => out_r[i] += r,
            }
        }

        if self.fading {
            self.fade_mult -= self.fade_step;
            if self.fade_mult <= 0.0 {
                self.fade_mult = 0.0;
            }
            if self.fade_mult <= 0.0 || read < n || source.frames_remaining() == 0 {
                // A fading channel never loops (§4.2): whether the fade
                // decayed to zero or the source simply hit EOF first, the
                // channel terminates here rather than surviving into
                // `on_source_ended`'s loop/rewind path.
                self.source = None;
                return BlockOutcome::SourceEnded;
            }
            return BlockOutcome::Continue;
        }

        if read < n || source.frames_remaining() == 0 {
            BlockOutcome::SourceEnded
        } else {
            BlockOutcome::Continue
        }
    }

    /// Apply the §4.2 loop/queue decision once a block reports
    /// `SourceEnded`. Returns the next item to open, if any, so the
    /// caller (the mixer, which owns the storage backend) can perform
    /// the actual file open outside of this module.
    pub(crate) fn on_source_ended(&mut self) -> Option<QueuedItem> {
        if self.fading {
            // Fade already cleared `source` in `mix_block`.
            self.fading = false;
            return self.queue.pop();
        }

        let Some(source) = self.source.as_mut() else {
            // Already terminated (e.g. a read error above).
            return self.queue.pop();
        };

        if self.loop_end_requested {
            self.source = None;
            self.loop_end_requested = false;
            return self.queue.pop();
        }

        if self.loop_remaining > 0 {
            self.loop_remaining -= 1;
            if let Err(err) = source.rewind() {
                warn!(filename = %self.filename, %err, "rewind failed, terminating channel");
                self.source = None;
                return self.queue.pop();
            }
            return None;
        }

        if self.loop_remaining == -1 {
            if let Some(item) = self.queue.pop() {
                match item.behavior {
                    LoopBehavior::FinishLoop => {
                        self.source = None;
                        return Some(item);
                    }
                    LoopBehavior::StopImmediate => {
                        // Should already have preempted when queued; treat
                        // the same as finish-loop here as a fallback.
                        self.source = None;
                        return Some(item);
                    }
                }
            }
            if let Err(err) = source.rewind() {
                warn!(filename = %self.filename, %err, "rewind failed, terminating channel");
                self.source = None;
            }
            return None;
        }

        // loop_remaining == 0: terminate, then consult the queue.
        self.source = None;
        self.queue.pop()
    }

    /// Immediately preempt an infinitely-looping channel for a
    /// `StopImmediate`-behavior queued item (spec §8 property 6). Called
    /// by the mixer when such an item is enqueued on a channel that is
    /// currently in an infinite loop.
    pub(crate) fn take_for_immediate_preempt(&mut self) -> bool {
        if self.loop_remaining == -1 && self.source.is_some() {
            self.source = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn close(&mut self) {
        self.source = None;
        self.clear_queue();
    }

    pub(crate) fn open_source(filename: &str) -> Result<WavSource<BufReader<File>>, wav::WavError> {
        wav::open_file(filename)
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn fade_steps_for(sample_rate: u32, block_size: u32) -> u32 {
    ((FADE_DURATION_MS as u64 * sample_rate as u64) / (1000 * block_size as u64)).max(1) as u32
}

/// Decode one frame's worth of bytes into signed, center-zero (left,
/// right) samples, replicating mono to both channels.
fn decode_frame(bytes: &[u8], bits: u16, channels: u16) -> (i32, i32) {
    let sample_at = |idx: usize| -> i32 {
        if bits == 8 {
            (bytes[idx] as i32 - 128) << 8
        } else {
            let lo = bytes[idx * 2] as i32;
            let hi = bytes[idx * 2 + 1] as i8 as i32;
            (hi << 8) | lo
        }
    };

    if channels == 2 {
        (sample_at(0), sample_at(1))
    } else {
        let mono = sample_at(0);
        (mono, mono)
    }
}
