//! End-to-end mixer scenarios against a `MockSink`, per the scenario
//! table this crate's tick/channel algorithm is built against.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;
use rstest::rstest;
use tempfile::tempdir;

use scalesound::{
    CodecControl, CodecError, LoopBehavior, MixerConfig, MixerCore, MockSink, PlayOptions,
    Routing, StopMode,
};

/// A codec that requires no real bus: every call trivially succeeds.
struct NullCodec {
    initialized: bool,
}

impl NullCodec {
    fn new() -> Self {
        NullCodec { initialized: false }
    }
}

impl CodecControl for NullCodec {
    fn begin(&mut self, _sample_rate: u32) -> Result<(), CodecError> {
        self.initialized = true;
        Ok(())
    }
    fn reset(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
    fn set_volume(&mut self, _gain: f32) -> Result<(), CodecError> {
        Ok(())
    }
    fn set_mute(&mut self, _mute: bool) -> Result<(), CodecError> {
        Ok(())
    }
    fn model_name(&self) -> &'static str {
        "null"
    }
    fn is_initialized(&self) -> bool {
        self.initialized
    }
    fn cached_register(&self, _reg: u8) -> u16 {
        0
    }
}

const SAMPLE_RATE: u32 = 44_100;
const BLOCK_SIZE: usize = 441; // divides 44,100 and the 2,205-frame fade window evenly

fn build_mixer(num_channels: usize) -> MixerCore<MockSink> {
    let config = MixerConfig {
        sample_rate: SAMPLE_RATE,
        block_size: BLOCK_SIZE,
        num_channels,
        command_ring_capacity: 16,
    };
    MixerCore::begin(
        config,
        MockSink::with_capture(SAMPLE_RATE as usize * 4),
        Arc::new(Mutex::new(NullCodec::new())),
    )
    .expect("mixer begin")
}

fn run_until_idle(core: &mut MixerCore<MockSink>, channel: usize, max_ticks: usize) {
    for _ in 0..max_ticks {
        core.tick().expect("tick");
        if !core.is_playing(channel) {
            return;
        }
    }
    panic!("channel {channel} never went idle within {max_ticks} ticks");
}

#[rstest]
#[case(1.0, 32767.0)]
#[case(0.5, 16383.0)]
fn scenario_1_and_2_gain_scales_peak_amplitude(#[case] gain: f32, #[case] expected_peak: f64) {
    let dir = tempdir().unwrap();
    let tone = common::sine_stereo(SAMPLE_RATE, 1000.0, 1.0, i16::MAX);
    let path = common::write_wav(dir.path(), "tone.wav", SAMPLE_RATE, 2, &tone);

    let mut core = build_mixer(1);
    core.play(
        0,
        path.to_str().unwrap(),
        PlayOptions {
            gain,
            ..Default::default()
        },
    );
    run_until_idle(&mut core, 0, 200);

    let stats = core.sink().stats();
    assert!(
        (stats.peak_l as f64 - expected_peak).abs() / expected_peak < 0.02,
        "peak_l={} expected~{}",
        stats.peak_l,
        expected_peak
    );
    assert!((stats.rms_l - stats.rms_r).abs() < 50.0);
    assert!(stats.total_pairs >= SAMPLE_RATE as u64);
}

#[test]
fn scenario_3_left_only_routing_silences_right_channel() {
    let dir = tempdir().unwrap();
    let tone = common::dc(SAMPLE_RATE as usize / 10, 2, 20_000);
    let path = common::write_wav(dir.path(), "tone.wav", SAMPLE_RATE, 2, &tone);

    let mut core = build_mixer(1);
    core.play(
        0,
        path.to_str().unwrap(),
        PlayOptions {
            routing: Routing::LeftOnly,
            ..Default::default()
        },
    );
    run_until_idle(&mut core, 0, 200);

    let stats = core.sink().stats();
    assert_eq!(stats.peak_r, 0);
    assert_eq!(stats.rms_r, 0.0);
    assert!(stats.peak_l > 0);
}

#[test]
fn scenario_4_finite_loop_plays_k_plus_one_times() {
    let dir = tempdir().unwrap();
    let one_second = common::dc(SAMPLE_RATE as usize, 2, 10_000);
    let total_frames = (one_second.len() / 2) as u64;
    let path = common::write_wav(dir.path(), "tone.wav", SAMPLE_RATE, 2, &one_second);

    let mut core = build_mixer(1);
    core.play(
        0,
        path.to_str().unwrap(),
        PlayOptions {
            loop_count: 2,
            ..Default::default()
        },
    );

    assert!(core.is_playing(0));
    let mut ticks = 0;
    while core.is_playing(0) {
        core.tick().unwrap();
        ticks += 1;
        assert!(ticks < 2000, "channel never finished its loops");
    }

    let expected_blocks = (total_frames as usize * 3 + BLOCK_SIZE - 1) / BLOCK_SIZE;
    assert!(
        ticks >= expected_blocks,
        "expected at least {expected_blocks} ticks for 3x playback, got {ticks}"
    );
}

#[test]
fn scenario_5_finish_loop_queue_starts_at_exact_boundary() {
    let dir = tempdir().unwrap();
    let long_frames = BLOCK_SIZE * 10; // comfortably larger than a handful of blocks
    let long_wav = common::dc(long_frames, 2, 10_000);
    let long_path = common::write_wav(dir.path(), "long.wav", SAMPLE_RATE, 2, &long_wav);

    let short_wav = common::dc(BLOCK_SIZE * 2, 2, -10_000);
    let short_path = common::write_wav(dir.path(), "short.wav", SAMPLE_RATE, 2, &short_wav);

    let mut core = build_mixer(1);
    core.play(
        0,
        long_path.to_str().unwrap(),
        PlayOptions {
            loop_count: -1,
            ..Default::default()
        },
    );
    assert!(core.queue(
        0,
        short_path.to_str().unwrap(),
        PlayOptions::default(),
        LoopBehavior::FinishLoop,
    ));

    // The last block exactly drains `long.wav` and triggers the switch
    // within the same tick, so the queued item is still pending for all
    // blocks up to (but not including) that final one.
    let blocks_before_switch = long_frames / BLOCK_SIZE - 1;
    for _ in 0..blocks_before_switch {
        core.tick().unwrap();
        assert!(core.handle().has_queued(0));
    }
    core.tick().unwrap();
    assert!(!core.handle().has_queued(0));
    assert!(core.is_playing(0));
}

#[test]
fn scenario_6_fade_completes_in_exactly_2205_frames() {
    let dir = tempdir().unwrap();
    // Long enough DC source that the fade, not the source, ends playback.
    let full_scale = common::dc(SAMPLE_RATE as usize, 1, i16::MAX);
    let path = common::write_wav(dir.path(), "dc.wav", SAMPLE_RATE, 1, &full_scale);

    let mut core = build_mixer(1);
    core.play(0, path.to_str().unwrap(), PlayOptions::default());
    core.tick().unwrap(); // let it play a block first
    core.stop(0, StopMode::Fade);

    let fade_blocks = 2205 / BLOCK_SIZE; // = 5 with BLOCK_SIZE = 441
    for _ in 0..fade_blocks {
        assert!(core.is_playing(0));
        core.tick().unwrap();
    }
    assert!(!core.is_playing(0));
}

#[test]
fn mute_then_unmute_round_trip_preserves_register_via_volume_composition() {
    // Exercises the §8 idempotence law at the mixer/codec boundary: a
    // mute/unmute pair must not perturb channel output beyond what the
    // codec layer itself guarantees (see codec.rs for the register-level
    // assertion).
    let dir = tempdir().unwrap();
    let tone = common::dc(BLOCK_SIZE * 4, 2, 15_000);
    let path = common::write_wav(dir.path(), "tone.wav", SAMPLE_RATE, 2, &tone);

    let codec: Arc<Mutex<dyn CodecControl>> = Arc::new(Mutex::new(NullCodec::new()));
    let mut core = MixerCore::begin(
        MixerConfig {
            sample_rate: SAMPLE_RATE,
            block_size: BLOCK_SIZE,
            num_channels: 1,
            command_ring_capacity: 16,
        },
        MockSink::new(),
        codec.clone(),
    )
    .unwrap();

    core.play(0, path.to_str().unwrap(), PlayOptions::default());
    codec.lock().set_mute(true).unwrap();
    codec.lock().set_mute(false).unwrap();
    core.tick().unwrap();
    assert!(core.is_playing(0));
}

#[test]
fn clear_queue_leaves_no_queued_item_until_next_queue_call() {
    let dir = tempdir().unwrap();
    let wav = common::dc(BLOCK_SIZE * 2, 2, 5_000);
    let path = common::write_wav(dir.path(), "a.wav", SAMPLE_RATE, 2, &wav);

    let mut core = build_mixer(1);
    core.play(
        0,
        path.to_str().unwrap(),
        PlayOptions {
            loop_count: -1,
            ..Default::default()
        },
    );
    core.queue(
        0,
        path.to_str().unwrap(),
        PlayOptions::default(),
        LoopBehavior::FinishLoop,
    );
    assert!(core.has_queued(0));
    core.clear_queue(0);
    assert!(!core.has_queued(0));
    core.tick().unwrap();
    assert!(!core.has_queued(0));
}
