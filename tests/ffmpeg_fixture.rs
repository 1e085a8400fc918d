//! Tests against the real FFmpeg engine.
//!
//! Tests require fixture files from `tests/fixtures/generate_fixtures.sh`
//! and return early when they are missing.

mod common;

use std::path::Path;
use std::time::Duration;

use framepipe::{
    AudioFormat, BridgeOptions, Destination, FfmpegEngine, FfmpegLogLevel, InputSettings,
    MediaEngine, MediaKind, MediaOptions, PipelineError, Player, StreamBridge,
    get_ffmpeg_log_level, set_ffmpeg_log_level,
};

use common::wait_until;

fn sample_video_path() -> &'static str {
    "tests/fixtures/sample_video.mp4"
}

// ── log level ──────────────────────────────────────────────────────

#[test]
fn ffmpeg_log_level_round_trips() {
    set_ffmpeg_log_level(FfmpegLogLevel::Error);
    assert_eq!(get_ffmpeg_log_level(), Some(FfmpegLogLevel::Error));
    set_ffmpeg_log_level(FfmpegLogLevel::Quiet);
    assert_eq!(get_ffmpeg_log_level(), Some(FfmpegLogLevel::Quiet));
}

// ── engine ─────────────────────────────────────────────────────────

#[test]
fn open_nonexistent_file() {
    let result = FfmpegEngine::new().open_input("this_file_does_not_exist.mp4", &InputSettings::default());
    match result {
        Err(PipelineError::Open { address, .. }) => assert_eq!(address, "this_file_does_not_exist.mp4"),
        Err(other) => panic!("expected an open error, got {other}"),
        Ok(_) => panic!("a missing file must not open"),
    }
}

#[test]
fn engine_decodes_fixture_video() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let mut input = FfmpegEngine::new()
        .open_input(path, &InputSettings::default())
        .expect("Failed to open fixture");
    assert!(!framepipe::configuration::is_realtime_format(&input.format_name()));

    let video = input
        .streams()
        .into_iter()
        .find(|stream| stream.kind == Some(MediaKind::Video))
        .expect("fixture has video");
    assert_eq!((video.width, video.height), (320, 240));
    input.open_decoder(video.index, Default::default()).expect("decoder");

    let mut decoded = Vec::new();
    while decoded.len() < 5 {
        let packet = match input.read_packet() {
            Ok(packet) => packet,
            Err(error) if error.is_transient() => continue,
            Err(error) => panic!("read failed: {error}"),
        };
        if packet.stream != video.index {
            continue;
        }
        decoded.extend(input.decode(&packet).expect("decode"));
    }
    let image = decoded[0].as_video().expect("video frame");
    assert_eq!(image.dimensions(), (320, 240));
    assert!(decoded.iter().all(|frame| frame.pts().is_some()));
}

#[test]
fn resampler_converts_to_stereo_48k() {
    let from = AudioFormat {
        sample_rate: 44_100,
        channels: 1,
    };
    let mut resampler = FfmpegEngine::new()
        .create_resampler(from, AudioFormat::STEREO_48K)
        .expect("resampler");
    let input = framepipe::AudioSamples::new(from, vec![100; 4410]);
    let output = resampler.resample(&input).expect("resample");
    assert_eq!(output.format(), AudioFormat::STEREO_48K);
    assert_eq!(output.data.len() % 2, 0, "interleaved stereo");
}

// ── player ─────────────────────────────────────────────────────────

#[test]
fn player_delivers_frames_and_remuxes_to_file() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }
    let directory = tempfile::tempdir().expect("Failed to create temp dir");
    let output = directory.path().join("copy.mkv");

    let mut player = Player::new(path)
        .with_options(MediaOptions::new().with_audio_index(0).with_name("fixture"))
        .with_destination(Destination::File(output.clone()));
    player.open().expect("Failed to open fixture");
    assert!(player.throttle_playback(), "files are played at wall-clock pace");

    let video = player.video().expect("video collection").clone();
    assert!(wait_until(Duration::from_secs(10), || video.len() >= 3));
    let frame = video.try_get().expect("open").expect("queued frame");
    assert_eq!(frame.pts(), Some(0), "first frame is rebased to zero");

    player.close().expect("close");
    let size = std::fs::metadata(&output).expect("output written").len();
    assert!(size > 0);
}

// ── bridge ─────────────────────────────────────────────────────────

#[test]
fn bridge_resizes_fixture_frames() {
    let path = sample_video_path();
    if !Path::new(path).exists() {
        return;
    }

    let options = BridgeOptions::new(path).with_source_size(160, 120);
    let mut bridge = StreamBridge::open(options).expect("Failed to open fixture");

    let mut sizes = Vec::new();
    bridge.run(|image| {
        sizes.push(image.dimensions());
        Ok(None)
    });
    assert!(!sizes.is_empty());
    assert!(sizes.iter().all(|&size| size == (160, 120)));
    assert!(bridge.latest_error().is_none());
    bridge.close().expect("close");
}
