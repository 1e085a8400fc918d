//! MediaOptions, HlsOutputOptions and BridgeOptions tests.

use std::path::Path;
use std::time::Duration;

use framepipe::configuration::{
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_DROP_THRESHOLD, DEFAULT_FLUSH_THRESHOLD, DEFAULT_FRAME_QUEUE_MAX,
    DEFAULT_IO_BUFFER_SIZE, DEFAULT_RECONNECT_DELAY, is_realtime_format,
};
use framepipe::{BridgeOptions, Destination, HlsOutputOptions, MediaOptions, PlaylistType, Timeout};

// ── MediaOptions ───────────────────────────────────────────────────

#[test]
fn media_options_defaults() {
    let options = MediaOptions::new();
    assert_eq!(options.format, None);
    assert_eq!(options.buffer_size, DEFAULT_IO_BUFFER_SIZE);
    assert_eq!(options.buffer_size, 3840 * 2160 * 3);
    assert_eq!(options.timeout, Timeout::new(Duration::from_secs(32), Duration::from_secs(16)));
    assert_eq!(options.video_index, Some(0));
    assert_eq!(options.audio_index, None);
    assert_eq!(options.max_frame_queue, DEFAULT_FRAME_QUEUE_MAX);
    assert!(options.go_faster);
    assert!(options.low_delay);
    assert_eq!(options.flush_threshold, DEFAULT_FLUSH_THRESHOLD);
    assert_eq!(options.reconnect_delay, DEFAULT_RECONNECT_DELAY);
}

#[test]
fn media_options_builders() {
    let options = MediaOptions::new()
        .with_format("v4l2")
        .with_input_option("framerate", "30")
        .with_output_option("movflags", "faststart")
        .with_audio_index(1)
        .without_video()
        .with_max_frame_queue(0)
        .with_go_faster(false)
        .with_reconnect_delay(Duration::from_millis(250))
        .with_name("dock")
        .with_device_id(4);

    assert_eq!(options.format.as_deref(), Some("v4l2"));
    assert_eq!(options.input_options.get("framerate").map(String::as_str), Some("30"));
    assert_eq!(options.output_options.get("movflags").map(String::as_str), Some("faststart"));
    assert_eq!(options.audio_index, Some(1));
    assert_eq!(options.video_index, None);
    assert_eq!(options.max_frame_queue, 0);
    assert!(!options.go_faster);
    assert_eq!(options.reconnect_delay, Duration::from_millis(250));
    assert_eq!(options.name.as_deref(), Some("dock"));
    assert_eq!(options.device_id, Some(4));
}

#[test]
fn flush_threshold_is_at_least_one() {
    assert_eq!(MediaOptions::new().with_flush_threshold(0).flush_threshold, 1);
    assert_eq!(BridgeOptions::new("in").with_flush_threshold(0).flush_threshold, 1);
}

#[test]
fn media_options_debug_omits_the_sink() {
    let debug = format!("{:?}", MediaOptions::new().with_name("dock"));
    assert!(debug.contains("MediaOptions"));
    assert!(debug.contains("name: Some(\"dock\")"));
    assert!(!debug.contains("metrics"));
}

// ── realtime formats ───────────────────────────────────────────────

#[test]
fn realtime_formats_are_recognised() {
    assert!(is_realtime_format("rtsp"));
    assert!(is_realtime_format("v4l2"));
    assert!(is_realtime_format("video4linux2,v4l2"));
    assert!(is_realtime_format("pulse"));
    assert!(!is_realtime_format("mov,mp4,m4a,3gp,3g2,mj2"));
    assert!(!is_realtime_format("matroska,webm"));
    assert!(!is_realtime_format(""));
}

// ── HLS ────────────────────────────────────────────────────────────

#[test]
fn hls_defaults_and_paths() {
    let hls = HlsOutputOptions::new("/srv/archive", "/tmp/hls");
    assert_eq!(hls.segment_duration, 10);
    assert_eq!(hls.playlist_type, PlaylistType::Vod);
    assert!(hls.drop_first_segment);
    assert_eq!(hls.master_path(), Path::new("/tmp/hls/master.m3u8"));

    let destination = Destination::Hls(hls.clone());
    assert_eq!(destination.hls(), Some(&hls));
    assert_eq!(Destination::File("out.mp4".into()).hls(), None);
}

#[test]
fn hls_muxer_options() {
    let options = HlsOutputOptions::new("/srv/archive", "/tmp/hls")
        .with_segment_duration(6)
        .with_playlist_type(PlaylistType::Event)
        .muxer_options();

    let get = |key: &str| options.get(key).map(String::as_str);
    assert_eq!(get("strftime"), Some("1"));
    assert_eq!(get("strftime_mkdir"), Some("1"));
    assert_eq!(get("hls_time"), Some("6"));
    assert_eq!(get("hls_playlist_type"), Some("event"));
    let segment_filename = Path::new(get("hls_segment_filename").expect("segment pattern"));
    assert_eq!(segment_filename.parent(), Some(Path::new("/tmp/hls")));
    assert_eq!(
        segment_filename.extension().and_then(|ext| ext.to_str()),
        Some(HlsOutputOptions::SEGMENT_EXTENSION)
    );
}

#[test]
fn hls_segment_duration_is_at_least_one_second() {
    let hls = HlsOutputOptions::new("a", "b").with_segment_duration(0);
    assert_eq!(hls.segment_duration, 1);
}

// ── BridgeOptions ──────────────────────────────────────────────────

#[test]
fn bridge_defaults_suit_rtsp() {
    let options = BridgeOptions::new("rtsp://camera/stream");
    assert_eq!(options.input_options.get("rtsp_transport").map(String::as_str), Some("tcp"));
    assert_eq!(options.output, None);
    assert!(!options.drop_slow_frame);
    assert_eq!(options.drop_threshold, DEFAULT_DROP_THRESHOLD);
    assert_eq!(options.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
    assert_eq!(options.encode_size(), None);

    let short = options.with_drain_timeout(Duration::from_millis(50));
    assert_eq!(short.drain_timeout, Duration::from_millis(50));
}

#[test]
fn bridge_encode_size_prefers_output_size() {
    let source_only = BridgeOptions::new("in").with_source_size(640, 360);
    assert_eq!(source_only.encode_size(), Some((640, 360)));

    let both = source_only.with_output_size(1280, 720);
    assert_eq!(both.encode_size(), Some((1280, 720)));
}

#[test]
fn bridge_drop_policy_builder() {
    let options = BridgeOptions::new("in").with_drop_slow_frame(true, 0).with_channel_capacity(0);
    assert!(options.drop_slow_frame);
    assert_eq!(options.drop_threshold, 1, "threshold is clamped");
    assert_eq!(options.channel_capacity, 1);
}
