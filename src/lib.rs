//! Real-time multi-channel WAV mixing engine.
//!
//! A fixed-size array of mix channels (`channel`) is fed wall
//! clock-paced 16-bit stereo blocks through a codec-controlled
//! (`codec`) output transport (`sink`), driven by a `tick()` loop in
//! `mixer` and steered either synchronously or from another thread
//! through a lock-free command ring (`command`).

pub mod channel;
pub mod codec;
pub mod command;
pub mod error;
pub mod mixer;
pub mod sink;
pub mod wav;

pub use channel::{LoopBehavior, PlayOptions, Routing, StopMode};
pub use codec::{CodecControl, CodecError, ControlBus, SimpleDacCodec, TiClassDCodec, WolfsonCodec};
pub use command::{Command, CommandQueue, Target};
pub use error::*;
pub use mixer::{soft_clip, ChannelStatus, MixerConfig, MixerCore, MixerError, MixerHandle};
pub use sink::{CpalSink, I2sSink, I2sStats, MockSink, SinkError};
pub use wav::{FsStorage, Storage, WavError, WavSource};
