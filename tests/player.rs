//! Player integration tests against the scripted engine.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use framepipe::{
    AsyncMediaHandler, AudioFormat, AudioSamples, CallbackResult, CodecHints, Destination,
    HlsOutputOptions, MediaCallbacks, MediaHandler, MediaKind, MediaOptions, PipelineError,
    Player, RunPhase,
};
use image::RgbImage;

use common::{
    ScriptedEngine, Script, Step, VIDEO_TICKS_PER_FRAME, audio_step, audio_stream, flush_step,
    untimed_video_step, video_step, video_steps, video_stream, wait_until,
};

const FINISH_LIMIT: Duration = Duration::from_secs(5);

fn live_engine(steps: impl Fn() -> Vec<common::Step> + Send + Sync + 'static) -> Arc<ScriptedEngine> {
    Arc::new(ScriptedEngine::new(move |_| {
        Ok(Script::new("rtsp", vec![video_stream(0)], steps()))
    }))
}

fn player_with(engine: &Arc<ScriptedEngine>, options: MediaOptions) -> Player {
    Player::new("rtsp://camera/stream")
        .with_engine(engine.clone())
        .with_options(options)
}

fn drain_pts(player: &Player, kind: MediaKind) -> Vec<i64> {
    let collection = match kind {
        MediaKind::Video => player.video(),
        MediaKind::Audio => player.audio(),
    }
    .expect("track selected");
    let mut seen = Vec::new();
    while let Ok(Some(frame)) = collection.try_get() {
        seen.push(frame.pts().expect("frames carry pts"));
    }
    seen
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    fail_on_frame: bool,
}

impl Recorder {
    fn push(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl MediaHandler for Recorder {
    fn on_container_begin(&self) -> CallbackResult {
        self.push("begin");
        Ok(())
    }

    fn on_container_end(&self) -> CallbackResult {
        self.push("end");
        Ok(())
    }

    fn on_video_frame(&self, _image: Arc<RgbImage>, start: DateTime<Local>, last: DateTime<Local>) -> CallbackResult {
        assert!(start <= last);
        self.push("video");
        if self.fail_on_frame {
            return Err("boom".into());
        }
        Ok(())
    }

    fn on_audio_frame(&self, _samples: Arc<AudioSamples>, _start: DateTime<Local>, _last: DateTime<Local>) -> CallbackResult {
        self.push("audio");
        Ok(())
    }
}

// ── lifecycle ──────────────────────────────────────────────────────

#[test]
fn close_twice_fails_with_not_open() {
    let engine = live_engine(|| video_steps(0, 0, 3));
    let mut player = player_with(&engine, MediaOptions::new());

    player.open().expect("open");
    player.close().expect("first close");
    assert!(!player.is_open());
    assert!(matches!(player.close(), Err(PipelineError::NotOpen)));
    player.close_if_open().expect("close_if_open is a no-op when closed");
}

#[test]
fn close_before_open_fails_with_not_open() {
    let engine = live_engine(Vec::new);
    let mut player = player_with(&engine, MediaOptions::new());
    assert!(matches!(player.close(), Err(PipelineError::NotOpen)));
}

#[test]
fn open_twice_fails_with_already_open() {
    let engine = Arc::new(ScriptedEngine::new(|_| {
        Ok(Script::new("rtsp", vec![video_stream(0)], Vec::new()).held_open())
    }));
    let mut player = player_with(&engine, MediaOptions::new());

    player.open().expect("open");
    assert!(matches!(player.open(), Err(PipelineError::AlreadyOpen)));
    assert_eq!(engine.attempts(), 1, "rejected open must not touch the engine");
    player.close().expect("close");
}

#[test]
fn player_can_reopen_after_close() {
    let engine = live_engine(|| video_steps(0, 0, 2));
    let mut player = player_with(&engine, MediaOptions::new());

    player.open().expect("first open");
    player.close().expect("first close");
    player.open().expect("second open");
    player.close().expect("second close");
    assert_eq!(engine.attempts(), 2);
}

#[test]
fn display_includes_name_and_device() {
    let player = Player::new("rtsp://camera/stream")
        .with_options(MediaOptions::new().with_name("gate").with_device_id(3));
    assert_eq!(player.to_string(), "Player[name='gate',device=3]");
}

#[test]
fn open_fails_without_selectable_stream() {
    let engine = live_engine(Vec::new);
    let mut player = player_with(&engine, MediaOptions::new().without_video());

    let result = player.open();
    assert!(matches!(result, Err(PipelineError::Open { .. })), "{result:?}");
    assert!(!player.is_open());
}

// ── timestamps ─────────────────────────────────────────────────────

#[test]
fn video_timestamps_start_at_zero_and_never_decrease() {
    let engine = live_engine(|| video_steps(0, 90_000, 6));
    let mut player = player_with(&engine, MediaOptions::new().with_max_frame_queue(0));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));

    let expected: Vec<i64> = (0..6).map(|i| i * VIDEO_TICKS_PER_FRAME).collect();
    assert_eq!(drain_pts(&player, MediaKind::Video), expected);
    player.close().expect("end of stream is a clean exit");
}

#[test]
fn video_frames_without_pts_are_skipped() {
    let engine = live_engine(|| {
        vec![
            video_step(0, 500, 1),
            untimed_video_step(0, 600),
            video_step(0, 700, 2),
        ]
    });
    let mut player = player_with(&engine, MediaOptions::new());

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    assert_eq!(drain_pts(&player, MediaKind::Video), vec![0, 200]);
    player.close().expect("close");
}

#[test]
fn stream_selection_uses_per_kind_index() {
    let format = AudioFormat::STEREO_48K;
    let engine = Arc::new(ScriptedEngine::new(move |_| {
        Ok(Script::new(
            "rtsp",
            vec![audio_stream(0, format), video_stream(1), video_stream(2)],
            vec![video_step(2, 0, 1)],
        ))
    }));
    let options = MediaOptions::new()
        .with_video_index(1)
        .with_go_faster(true)
        .with_low_delay(true);
    let mut player = player_with(&engine, options);

    player.open().expect("open");
    assert!(player.audio().is_none(), "audio index not configured");
    let journal = engine.journal();
    assert_eq!(
        journal.lock().unwrap().decoders,
        vec![(
            2,
            CodecHints {
                go_faster: true,
                low_delay: true
            }
        )]
    );
    player.close().expect("close");
}

// ── flush markers and errors ───────────────────────────────────────

#[test]
fn flush_markers_beyond_threshold_end_the_run() {
    let engine = live_engine(|| {
        vec![
            video_step(0, 0, 1),
            flush_step(0, MediaKind::Video),
            flush_step(0, MediaKind::Video),
            flush_step(0, MediaKind::Video),
            video_step(0, 3000, 2),
        ]
    });
    let mut player = player_with(&engine, MediaOptions::new().with_flush_threshold(2));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    assert_eq!(drain_pts(&player, MediaKind::Video), vec![0]);
    player.close().expect("flush threshold is a clean end of stream");
}

#[test]
fn flush_counter_resets_on_real_packets() {
    let engine = live_engine(|| {
        vec![
            flush_step(0, MediaKind::Video),
            flush_step(0, MediaKind::Video),
            video_step(0, 0, 1),
            flush_step(0, MediaKind::Video),
            flush_step(0, MediaKind::Video),
            video_step(0, 3000, 2),
        ]
    });
    let mut player = player_with(&engine, MediaOptions::new().with_flush_threshold(2));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    assert_eq!(drain_pts(&player, MediaKind::Video), vec![0, 3000]);
    player.close().expect("close");
}

#[test]
fn transient_errors_are_retried() {
    let engine = live_engine(|| {
        vec![
            Step::Again,
            Step::Again,
            video_step(0, 0, 1),
            Step::Again,
            video_step(0, 3000, 2),
        ]
    });
    let mut player = player_with(&engine, MediaOptions::new());

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    assert_eq!(drain_pts(&player, MediaKind::Video), vec![0, 3000]);
    player.close().expect("close");
}

#[test]
fn fatal_error_is_returned_by_close_after_teardown() {
    let recorder = Recorder::default();
    let engine = live_engine(|| vec![video_step(0, 0, 1), Step::Fail(|| PipelineError::BrokenPipe)]);
    let mut player = player_with(&engine, MediaOptions::new())
        .with_destination(Destination::File("out.ts".into()))
        .with_callbacks(MediaCallbacks::sync(recorder.clone()));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    assert!(player.video().expect("video").is_closed());

    assert!(matches!(player.close(), Err(PipelineError::BrokenPipe)));
    assert_eq!(recorder.events(), vec!["begin", "video", "end"]);
    let journal = engine.journal();
    let journal = journal.lock().unwrap();
    assert_eq!(journal.flushed_streams, vec![0], "encoders drained despite the error");
    assert_eq!(journal.output_closed, 1);
}

#[test]
fn sync_callback_error_ends_the_run() {
    let recorder = Recorder {
        fail_on_frame: true,
        ..Recorder::default()
    };
    let engine = live_engine(|| video_steps(0, 0, 5));
    let mut player = player_with(&engine, MediaOptions::new())
        .with_callbacks(MediaCallbacks::sync(recorder.clone()));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));

    match player.close() {
        Err(PipelineError::Callback(message)) => assert!(message.contains("boom"), "{message}"),
        other => panic!("expected a callback error, got {other:?}"),
    }
    assert_eq!(recorder.events(), vec!["begin", "video", "end"]);
}

// ── callbacks ──────────────────────────────────────────────────────

#[test]
fn sync_callbacks_fire_in_decode_order() {
    let recorder = Recorder::default();
    let engine = live_engine(|| video_steps(0, 0, 3));
    let mut player = player_with(&engine, MediaOptions::new())
        .with_callbacks(MediaCallbacks::sync(recorder.clone()));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    player.close().expect("close");

    assert_eq!(recorder.events(), vec!["begin", "video", "video", "video", "end"]);
}

#[derive(Default)]
struct Counts {
    frames: AtomicUsize,
    ends: AtomicUsize,
}

#[derive(Clone, Default)]
struct CountingHandler {
    counts: Arc<Counts>,
}

#[async_trait::async_trait]
impl AsyncMediaHandler for CountingHandler {
    async fn on_container_end(&self) -> CallbackResult {
        self.counts.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_video_frame(&self, _image: Arc<RgbImage>, _start: DateTime<Local>, _last: DateTime<Local>) -> CallbackResult {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.counts.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_callbacks_run_on_the_runtime() {
    let handler = CountingHandler::default();
    let counts = handler.counts.clone();
    let engine = live_engine(|| video_steps(0, 0, 4));
    let mut player = player_with(&engine, MediaOptions::new().with_callback_queue(16))
        .with_callbacks(MediaCallbacks::asynchronous(handler));

    player.open().expect("open");
    player.wait().await.expect("player is open");
    assert!(player.is_finished());

    for _ in 0..500 {
        if counts.frames.load(Ordering::SeqCst) == 4 && counts.ends.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(counts.frames.load(Ordering::SeqCst), 4);
    assert_eq!(counts.ends.load(Ordering::SeqCst), 1);
    player.close().expect("close");
}

#[tokio::test]
async fn close_returns_while_blocking_the_only_runtime_thread() {
    let handler = CountingHandler::default();
    let counts = handler.counts.clone();
    let engine = Arc::new(ScriptedEngine::new(|_| {
        Ok(Script::new("rtsp", vec![video_stream(0)], video_steps(0, 0, 200)).held_open())
    }));
    let mut player = player_with(&engine, MediaOptions::new().with_callback_queue(16))
        .with_callbacks(MediaCallbacks::asynchronous(handler));

    // Nothing polls the forwarding task while this thread is blocked, so
    // the callback channel fills up and stays full.
    player.open().expect("open");
    let video = player.video().expect("video").clone();
    assert!(wait_until(FINISH_LIMIT, || video.newest_pts() == Some(199 * VIDEO_TICKS_PER_FRAME)));

    let started = std::time::Instant::now();
    player.close().expect("close");
    assert!(started.elapsed() < FINISH_LIMIT, "close took {:?}", started.elapsed());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(counts.frames.load(Ordering::SeqCst) < 200, "backlog drops frames");
    assert_eq!(counts.ends.load(Ordering::SeqCst), 0, "end event is dropped after the grace period");
}

#[test]
fn async_callbacks_require_a_runtime() {
    let engine = live_engine(|| video_steps(0, 0, 1));
    let mut player = player_with(&engine, MediaOptions::new())
        .with_callbacks(MediaCallbacks::asynchronous(CountingHandler::default()));

    assert!(matches!(player.open(), Err(PipelineError::NoRuntime)));
    assert!(!player.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn phase_reaches_finished_and_collections_close() {
    let engine = live_engine(|| video_steps(0, 0, 2));
    let mut player = player_with(&engine, MediaOptions::new());

    player.open().expect("open");
    let mut phase = player.phase().expect("open player has a phase");
    tokio::time::timeout(FINISH_LIMIT, phase.wait_for(|phase| *phase == RunPhase::Finished))
        .await
        .expect("run finishes")
        .expect("phase published");

    let video = player.video().expect("video").clone();
    assert!(video.is_closed());
    assert_eq!(video.get(None).await.expect("pending").pts(), Some(0));
    assert_eq!(video.get(None).await.expect("pending").pts(), Some(3000));
    assert!(matches!(video.get(None).await, Err(PipelineError::CollectionClosed)));
    player.close().expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn begin_is_remembered_after_a_short_run_finishes() {
    let engine = live_engine(|| video_steps(0, 0, 2));
    let mut player = player_with(&engine, MediaOptions::new());
    assert!(!player.has_begun());

    player.open().expect("open");
    player.wait().await.expect("player is open");
    assert!(player.is_finished());
    assert!(player.has_begun());

    player.close().expect("close");
    assert!(!player.has_begun(), "closed players report nothing");
}

#[test]
fn failed_begin_is_not_reported_as_begun() {
    struct RejectBegin;
    impl MediaHandler for RejectBegin {
        fn on_container_begin(&self) -> CallbackResult {
            Err("not today".into())
        }
    }

    let engine = live_engine(|| video_steps(0, 0, 2));
    let mut player = player_with(&engine, MediaOptions::new())
        .with_callbacks(MediaCallbacks::sync(RejectBegin));
    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    assert!(!player.has_begun());
    assert!(matches!(player.close(), Err(PipelineError::Callback(_))));
}

// ── audio ──────────────────────────────────────────────────────────

#[test]
fn audio_is_resampled_into_uniform_chunks() {
    let mono = AudioFormat {
        sample_rate: 24_000,
        channels: 1,
    };
    let engine = Arc::new(ScriptedEngine::new(move |_| {
        Ok(Script::new(
            "alsa",
            vec![audio_stream(0, mono)],
            vec![
                audio_step(0, 0, mono, 700),
                audio_step(0, 700, mono, 700),
                audio_step(0, 1400, mono, 700),
            ],
        ))
    }));
    let options = MediaOptions::new().without_video().with_audio_index(0).with_max_frame_queue(0);
    let mut player = player_with(&engine, options);

    player.open().expect("open");
    assert!(player.video().is_none());
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));

    // 2100 mono samples at 24 kHz -> 4200 per channel at 48 kHz -> 4 full chunks.
    let audio = player.audio().expect("audio selected");
    let mut pts = Vec::new();
    while let Ok(Some(frame)) = audio.try_get() {
        let samples = frame.as_audio().expect("audio payload");
        assert_eq!(samples.format(), AudioFormat::STEREO_48K);
        assert_eq!(samples.samples_per_channel(), 960);
        assert_eq!(frame.time_base(), framepipe::Rational(1, 48_000));
        pts.push(frame.pts().expect("pts"));
    }
    assert_eq!(pts, vec![0, 960, 1920, 2880]);

    let journal = engine.journal();
    assert_eq!(journal.lock().unwrap().resamplers, vec![(mono, AudioFormat::STEREO_48K)]);
    player.close().expect("close");
}

#[test]
fn matching_audio_skips_the_resampler() {
    let format = AudioFormat::STEREO_48K;
    let engine = Arc::new(ScriptedEngine::new(move |_| {
        Ok(Script::new(
            "pulse",
            vec![audio_stream(0, format)],
            vec![audio_step(0, 0, format, 1920)],
        ))
    }));
    let options = MediaOptions::new().without_video().with_audio_index(0);
    let mut player = player_with(&engine, options);

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    assert_eq!(drain_pts(&player, MediaKind::Audio), vec![0, 960]);
    assert!(engine.journal().lock().unwrap().resamplers.is_empty());
    player.close().expect("close");
}

// ── pacing ─────────────────────────────────────────────────────────

#[test]
fn file_formats_are_throttled_and_live_formats_are_not() {
    for (format, throttled) in [("mov,mp4,m4a,3gp,3g2,mj2", true), ("rtsp", false), ("v4l2", false)] {
        let engine = Arc::new(ScriptedEngine::new(move |_| {
            Ok(Script::new(format, vec![video_stream(0)], Vec::new()).held_open())
        }));
        let mut player = player_with(&engine, MediaOptions::new());

        player.open().expect("open");
        assert_eq!(player.throttle_playback(), throttled, "{format}");
        assert_eq!(player.is_realtime(), !throttled, "{format}");
        assert_eq!(player.format_name(), Some(format));
        player.close().expect("close");
    }
}

// ── destinations ───────────────────────────────────────────────────

#[test]
fn file_destination_receives_rebased_packets() {
    let engine = live_engine(|| video_steps(0, 90_000, 4));
    let mut player = player_with(&engine, MediaOptions::new().with_output_option("movflags", "faststart"))
        .with_destination(Destination::File("out.mp4".into()));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    player.close().expect("close");

    let journal = engine.journal();
    let journal = journal.lock().unwrap();
    let (address, settings) = &journal.opened_outputs[0];
    assert_eq!(address, "out.mp4");
    assert_eq!(settings.format, None);
    assert_eq!(settings.options.get("movflags").map(String::as_str), Some("faststart"));

    let dts: Vec<Option<i64>> = journal.muxed.iter().map(|packet| packet.dts).collect();
    assert_eq!(dts, vec![Some(0), Some(3000), Some(6000), Some(9000)]);
    assert!(journal.muxed.iter().all(|packet| packet.stream == 0));
    assert_eq!(journal.flushed_streams, vec![0]);
    assert_eq!(journal.output_closed, 1);
}

#[test]
fn packet_origin_is_rescaled_with_rounding_across_time_bases() {
    // 3001 ticks at 1/90000 is 1600.53 ticks at 1/48000, which rounds to 1601.
    let engine = Arc::new(ScriptedEngine::new(|_| {
        Ok(Script::new(
            "rtsp",
            vec![video_stream(0), audio_stream(1, AudioFormat::STEREO_48K)],
            vec![
                video_step(0, 3001, 0),
                audio_step(1, 1601, AudioFormat::STEREO_48K, 960),
            ],
        ))
    }));
    let mut player = player_with(&engine, MediaOptions::new().with_audio_index(0))
        .with_destination(Destination::File("out.mkv".into()));

    player.open().expect("open");
    assert!(wait_until(FINISH_LIMIT, || player.is_finished()));
    player.close().expect("close");

    let journal = engine.journal();
    let journal = journal.lock().unwrap();
    let dts: Vec<Option<i64>> = journal.muxed.iter().map(|packet| packet.dts).collect();
    assert_eq!(dts, vec![Some(0), Some(0)]);
}

#[test]
fn unwritable_archive_fails_before_anything_opens() {
    let destination = tempfile::tempdir().expect("Failed to create temp dir");
    let missing_cache = destination.path().join("missing-cache");
    let engine = live_engine(|| video_steps(0, 0, 1));
    let mut player = player_with(&engine, MediaOptions::new()).with_destination(Destination::Hls(
        HlsOutputOptions::new(destination.path().join("archive"), &missing_cache),
    ));

    let result = player.open();
    assert!(matches!(result, Err(PipelineError::Archive { .. })), "{result:?}");
    assert_eq!(engine.attempts(), 0);
}

#[test]
fn input_settings_come_from_options() {
    let engine = live_engine(Vec::new);
    let options = MediaOptions::new()
        .with_format("rtsp")
        .with_input_option("rtsp_transport", "tcp")
        .with_buffer_size(1024);
    let mut player = player_with(&engine, options);

    player.open().expect("open");
    player.close().expect("close");

    let journal = engine.journal();
    let journal = journal.lock().unwrap();
    let settings = &journal.input_settings[0];
    assert_eq!(settings.format.as_deref(), Some("rtsp"));
    assert_eq!(settings.options.get("rtsp_transport").map(String::as_str), Some("tcp"));
    assert_eq!(settings.buffer_size, 1024);
    assert_eq!(journal.opened_inputs, vec!["rtsp://camera/stream".to_string()]);
}
