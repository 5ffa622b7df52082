//! Crate-level error types.
//!
//! Each component boundary gets its own `thiserror`-derived enum rather
//! than a single catch-all, mirroring `graphics::pixmap::PixmapError` in
//! the project this crate grew out of.

pub use crate::codec::CodecError;
pub use crate::mixer::MixerError;
pub use crate::sink::SinkError;
pub use crate::wav::WavError;
