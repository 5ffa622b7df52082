//! Audio codec control: a narrow capability trait plus register-poke
//! drivers for three codec families, each maintaining a bounded
//! write-through register cache for write-only control interfaces.
//!
//! The register-cache-as-fixed-array idiom is grounded on the AC'97
//! driver pattern (`mixer_regs: [u16; 64]`) found elsewhere in the
//! retrieval pack; the three-family split (Wolfson / TI Class-D / Simple
//! DAC) follows spec §4.6.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("control bus transport error: {0}")]
    BusFault(String),
    #[error("codec not initialized")]
    NotInitialized,
}

/// A register-addressed control bus (I2C-like) that codec drivers poke.
pub trait ControlBus: Send {
    fn write_register(&mut self, reg: u8, value: u16) -> Result<(), CodecError>;
    /// Some buses support a genuine read-back; ones that don't may
    /// return `NotInitialized` and rely on the driver's write-through
    /// cache instead.
    fn read_register(&mut self, reg: u8) -> Result<u16, CodecError>;
}

/// Capability every concrete codec driver implements.
///
/// `begin`/`reset`/`set_volume`/`set_mute` form the cold-path
/// control-plane surface; callers hold this behind `Arc<Mutex<dyn
/// CodecControl>>` since either execution context may invoke it.
pub trait CodecControl: Send {
    fn begin(&mut self, sample_rate: u32) -> Result<(), CodecError>;
    fn reset(&mut self) -> Result<(), CodecError>;
    fn set_volume(&mut self, gain: f32) -> Result<(), CodecError>;
    fn set_mute(&mut self, mute: bool) -> Result<(), CodecError>;

    fn enable_speakers(&mut self, _enable: bool) -> Result<(), CodecError> {
        Ok(())
    }
    fn enable_headphones(&mut self, _enable: bool) -> Result<(), CodecError> {
        Ok(())
    }
    fn set_headphone_volume(&mut self, _level: u8) -> Result<(), CodecError> {
        Ok(())
    }
    fn set_speaker_volume(&mut self, _level: u8) -> Result<(), CodecError> {
        Ok(())
    }

    fn model_name(&self) -> &'static str;
    fn is_initialized(&self) -> bool;

    /// Read back the driver's write-through register cache for
    /// diagnostics (§4.6, §7 `CodecFault`). Devices whose control
    /// interface is write-only can't be queried over the bus itself, so
    /// this is the only way a caller can observe what was last written to
    /// `reg`; registers never written return `0`.
    fn cached_register(&self, reg: u8) -> u16;
}

const REGISTER_CACHE_SIZE: usize = 64;

/// A bounded, write-through register cache shared by all three driver
/// implementations. Opaque to callers: only the drivers below read or
/// write it directly.
struct RegisterCache {
    values: [u16; REGISTER_CACHE_SIZE],
}

impl RegisterCache {
    fn new() -> Self {
        RegisterCache {
            values: [0; REGISTER_CACHE_SIZE],
        }
    }

    fn write(&mut self, bus: &mut dyn ControlBus, reg: u8, value: u16) -> Result<(), CodecError> {
        bus.write_register(reg, value)?;
        if (reg as usize) < REGISTER_CACHE_SIZE {
            self.values[reg as usize] = value;
        }
        Ok(())
    }

    fn cached(&self, reg: u8) -> u16 {
        self.values.get(reg as usize).copied().unwrap_or(0)
    }
}

fn gain_to_attenuation_steps(gain: f32, max_steps: u16) -> u16 {
    let gain = gain.clamp(0.0, 1.0);
    (gain * max_steps as f32).round() as u16
}

// ---------------------------------------------------------------------
// Wolfson-family driver (e.g. WM8978-style codecs)
// ---------------------------------------------------------------------

mod wolfson_regs {
    pub const POWER_MGMT_1: u8 = 0x01;
    pub const POWER_MGMT_2: u8 = 0x02;
    pub const HEADPHONE_VOL: u8 = 0x34;
    pub const SPEAKER_VOL: u8 = 0x36;
    pub const DAC_VOLUME: u8 = 0x0A;
    pub const RESET: u8 = 0x00;
}

pub struct WolfsonCodec<B> {
    bus: B,
    cache: RegisterCache,
    initialized: bool,
    muted: bool,
    last_gain: f32,
}

impl<B: ControlBus> WolfsonCodec<B> {
    pub fn new(bus: B) -> Self {
        WolfsonCodec {
            bus,
            cache: RegisterCache::new(),
            initialized: false,
            muted: false,
            last_gain: 1.0,
        }
    }
}

impl<B: ControlBus> CodecControl for WolfsonCodec<B> {
    fn begin(&mut self, _sample_rate: u32) -> Result<(), CodecError> {
        self.cache.write(&mut self.bus, wolfson_regs::RESET, 0)?;
        self.cache
            .write(&mut self.bus, wolfson_regs::POWER_MGMT_1, 0x01)?;
        self.cache
            .write(&mut self.bus, wolfson_regs::POWER_MGMT_2, 0x01)?;
        self.cache
            .write(&mut self.bus, wolfson_regs::DAC_VOLUME, 0xFF)?;
        self.initialized = true;
        self.set_volume(1.0)?;
        self.set_mute(false)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.cache.write(&mut self.bus, wolfson_regs::RESET, 0)?;
        self.initialized = false;
        Ok(())
    }

    fn set_volume(&mut self, gain: f32) -> Result<(), CodecError> {
        self.last_gain = gain.clamp(0.0, 1.0);
        let hp_steps = gain_to_attenuation_steps(self.last_gain, 0x7F);
        self.cache
            .write(&mut self.bus, wolfson_regs::HEADPHONE_VOL, hp_steps)?;
        self.cache
            .write(&mut self.bus, wolfson_regs::SPEAKER_VOL, hp_steps)?;
        if !self.muted {
            let dac_steps = gain_to_attenuation_steps(self.last_gain, 0xFF);
            self.cache
                .write(&mut self.bus, wolfson_regs::DAC_VOLUME, dac_steps)?;
        }
        Ok(())
    }

    fn set_mute(&mut self, mute: bool) -> Result<(), CodecError> {
        if mute {
            self.cache.write(&mut self.bus, wolfson_regs::DAC_VOLUME, 0)?;
        } else {
            let steps = gain_to_attenuation_steps(self.last_gain, 0xFF);
            self.cache
                .write(&mut self.bus, wolfson_regs::DAC_VOLUME, steps)?;
        }
        self.muted = mute;
        Ok(())
    }

    fn enable_speakers(&mut self, enable: bool) -> Result<(), CodecError> {
        self.cache.write(
            &mut self.bus,
            wolfson_regs::SPEAKER_VOL,
            if enable { 0xFF } else { 0 },
        )
    }

    fn enable_headphones(&mut self, enable: bool) -> Result<(), CodecError> {
        self.cache.write(
            &mut self.bus,
            wolfson_regs::HEADPHONE_VOL,
            if enable { 0xFF } else { 0 },
        )
    }

    fn set_headphone_volume(&mut self, level: u8) -> Result<(), CodecError> {
        self.cache
            .write(&mut self.bus, wolfson_regs::HEADPHONE_VOL, level as u16)
    }

    fn set_speaker_volume(&mut self, level: u8) -> Result<(), CodecError> {
        self.cache
            .write(&mut self.bus, wolfson_regs::SPEAKER_VOL, level as u16)
    }

    fn model_name(&self) -> &'static str {
        "Wolfson-family"
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn cached_register(&self, reg: u8) -> u16 {
        self.cache.cached(reg)
    }
}

// ---------------------------------------------------------------------
// TI Class-D-family driver (e.g. TAS5754-style codecs)
// ---------------------------------------------------------------------

mod ti_regs {
    pub const RESET: u8 = 0x01;
    pub const DIGITAL_VOLUME_LEFT: u8 = 0x3D;
    pub const DIGITAL_VOLUME_RIGHT: u8 = 0x3E;
    pub const MUTE: u8 = 0x03;
    pub const POWER: u8 = 0x02;
}

pub struct TiClassDCodec<B> {
    bus: B,
    cache: RegisterCache,
    initialized: bool,
    last_gain: f32,
}

impl<B: ControlBus> TiClassDCodec<B> {
    pub fn new(bus: B) -> Self {
        TiClassDCodec {
            bus,
            cache: RegisterCache::new(),
            initialized: false,
            last_gain: 1.0,
        }
    }
}

impl<B: ControlBus> CodecControl for TiClassDCodec<B> {
    fn begin(&mut self, _sample_rate: u32) -> Result<(), CodecError> {
        self.cache.write(&mut self.bus, ti_regs::RESET, 1)?;
        self.cache.write(&mut self.bus, ti_regs::POWER, 1)?;
        self.initialized = true;
        self.set_volume(1.0)?;
        self.set_mute(false)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.cache.write(&mut self.bus, ti_regs::RESET, 1)?;
        self.initialized = false;
        Ok(())
    }

    fn set_volume(&mut self, gain: f32) -> Result<(), CodecError> {
        // TI class-D volume registers are attenuation-coded: 0 = 0dB (max).
        let steps = 255 - gain_to_attenuation_steps(gain, 255);
        self.cache
            .write(&mut self.bus, ti_regs::DIGITAL_VOLUME_LEFT, steps)?;
        self.cache
            .write(&mut self.bus, ti_regs::DIGITAL_VOLUME_RIGHT, steps)?;
        self.last_gain = gain.clamp(0.0, 1.0);
        Ok(())
    }

    fn set_mute(&mut self, mute: bool) -> Result<(), CodecError> {
        self.cache
            .write(&mut self.bus, ti_regs::MUTE, if mute { 1 } else { 0 })
    }

    fn model_name(&self) -> &'static str {
        "TI-Class-D-family"
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn cached_register(&self, reg: u8) -> u16 {
        self.cache.cached(reg)
    }
}

// ---------------------------------------------------------------------
// Simple DAC driver (single volume register, no speaker/headphone split)
// ---------------------------------------------------------------------

mod simple_regs {
    pub const VOLUME: u8 = 0x10;
    pub const MUTE: u8 = 0x11;
    pub const POWER: u8 = 0x00;
}

pub struct SimpleDacCodec<B> {
    bus: B,
    cache: RegisterCache,
    initialized: bool,
    last_gain: f32,
}

impl<B: ControlBus> SimpleDacCodec<B> {
    pub fn new(bus: B) -> Self {
        SimpleDacCodec {
            bus,
            cache: RegisterCache::new(),
            initialized: false,
            last_gain: 1.0,
        }
    }
}

impl<B: ControlBus> CodecControl for SimpleDacCodec<B> {
    fn begin(&mut self, _sample_rate: u32) -> Result<(), CodecError> {
        self.cache.write(&mut self.bus, simple_regs::POWER, 1)?;
        self.initialized = true;
        self.set_volume(1.0)?;
        self.set_mute(false)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.cache.write(&mut self.bus, simple_regs::POWER, 0)?;
        self.initialized = false;
        Ok(())
    }

    fn set_volume(&mut self, gain: f32) -> Result<(), CodecError> {
        let steps = gain_to_attenuation_steps(gain, 0xFF);
        self.cache.write(&mut self.bus, simple_regs::VOLUME, steps)?;
        self.last_gain = gain.clamp(0.0, 1.0);
        Ok(())
    }

    fn set_mute(&mut self, mute: bool) -> Result<(), CodecError> {
        self.cache
            .write(&mut self.bus, simple_regs::MUTE, if mute { 1 } else { 0 })
    }

    fn model_name(&self) -> &'static str {
        "Simple-DAC"
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn cached_register(&self, reg: u8) -> u16 {
        self.cache.cached(reg)
    }
}
