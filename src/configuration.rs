//! Pipeline configuration.
//!
//! [`MediaOptions`] is a builder that threads every per-run setting of a
//! [`Player`](crate::Player) or [`Supervisor`](crate::Supervisor) through a
//! single value: container hints, stream selection, queue depth, codec hints
//! and the injected metrics sink. [`Destination`] and [`HlsOutputOptions`]
//! describe where re-muxed packets go, and [`BridgeOptions`] configures the
//! single-stream [`StreamBridge`](crate::StreamBridge).
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use framepipe::{Destination, HlsOutputOptions, MediaOptions, Timeout};
//!
//! let options = MediaOptions::new()
//!     .with_name("gate")
//!     .with_input_option("rtsp_transport", "tcp")
//!     .with_timeout(Timeout::new(Duration::from_secs(10), Duration::from_secs(5)))
//!     .with_audio_index(0)
//!     .with_max_frame_queue(4);
//!
//! let destination = Destination::Hls(
//!     HlsOutputOptions::new("/srv/records", "/tmp/gate-hls").with_segment_duration(6),
//! );
//! ```

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::{MetricsSink, NoOpMetrics};

/// Input buffer large enough for one 4K RGB24 image.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 3840 * 2160 * 3;

/// Default time allowed for opening a container.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(32);

/// Default time allowed for a single read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(16);

/// Default depth of each frame collection.
pub const DEFAULT_FRAME_QUEUE_MAX: usize = 8;

/// Consecutive flush markers tolerated before the input counts as ended.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;

/// Pause between two supervisor attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(4);

/// Capacity of the channel carrying async callback events.
pub const DEFAULT_CALLBACK_QUEUE: usize = 64;

/// Outstanding bridge frames tolerated before the slow-consumer policy applies.
pub const DEFAULT_DROP_THRESHOLD: usize = 3;

/// How long an async bridge waits for in-flight handlers at the end.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Samples per step-average log line.
pub const DEFAULT_LOGGING_STEP: u64 = 1000;

/// Demuxer formats that deliver data at wall-clock pace by themselves.
///
/// Any input whose format name matches none of these is throttled to
/// real-time playback speed.
pub const REALTIME_FORMATS: &[&str] = &[
    "alsa",
    "android_camera",
    "avfoundation",
    "bktr",
    "decklink",
    "dshow",
    "fbdev",
    "gdigrab",
    "iec61883",
    "jack",
    "kmsgrab",
    "openal",
    "oss",
    "pulse",
    "sndio",
    "rtsp",
    "v4l2",
    "vfwcap",
    "x11grab",
];

/// Returns `true` if any comma-separated name in `format_name` is a
/// real-time device or protocol.
pub fn is_realtime_format(format_name: &str) -> bool {
    format_name
        .split(',')
        .map(str::trim)
        .any(|name| REALTIME_FORMATS.contains(&name))
}

/// Open and read deadlines handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Time allowed for opening the container.
    pub open: Duration,
    /// Time allowed for each read once open.
    pub read: Duration,
}

impl Timeout {
    /// Separate open and read deadlines.
    pub fn new(open: Duration, read: Duration) -> Self {
        Self { open, read }
    }

    /// One deadline for both phases.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            open: timeout,
            read: timeout,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

/// Per-run settings of a [`Player`](crate::Player).
///
/// Construct with [`MediaOptions::new`] (or [`Default`]) and chain `with_*`
/// methods. Cloning is cheap; the metrics sink is shared.
#[derive(Clone)]
pub struct MediaOptions {
    /// Input format name, `None` to probe.
    pub format: Option<String>,
    /// Options passed to the input demuxer.
    pub input_options: BTreeMap<String, String>,
    /// Options passed to the output muxer (merged over HLS defaults).
    pub output_options: BTreeMap<String, String>,
    /// I/O buffer size in bytes.
    pub buffer_size: usize,
    /// Open/read deadlines.
    pub timeout: Timeout,
    /// Which video stream to use, counted among video streams only.
    pub video_index: Option<usize>,
    /// Which audio stream to use, counted among audio streams only.
    pub audio_index: Option<usize>,
    /// Depth of each frame collection; `0` means unbounded.
    pub max_frame_queue: usize,
    /// Let decoders trade accuracy for speed.
    pub go_faster: bool,
    /// Ask decoders to minimise buffering.
    pub low_delay: bool,
    /// Consecutive flush markers that end a run.
    pub flush_threshold: usize,
    /// Pause between supervisor attempts.
    pub reconnect_delay: Duration,
    /// Capacity of the async callback channel.
    pub callback_queue: usize,
    /// Human-readable name used in logs.
    pub name: Option<String>,
    /// Device identifier used in logs.
    pub device_id: Option<u32>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            format: None,
            input_options: BTreeMap::new(),
            output_options: BTreeMap::new(),
            buffer_size: DEFAULT_IO_BUFFER_SIZE,
            timeout: Timeout::default(),
            video_index: Some(0),
            audio_index: None,
            max_frame_queue: DEFAULT_FRAME_QUEUE_MAX,
            go_faster: true,
            low_delay: true,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            callback_queue: DEFAULT_CALLBACK_QUEUE,
            name: None,
            device_id: None,
            metrics: Arc::new(NoOpMetrics),
        }
    }
}

impl Debug for MediaOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MediaOptions")
            .field("format", &self.format)
            .field("input_options", &self.input_options)
            .field("output_options", &self.output_options)
            .field("buffer_size", &self.buffer_size)
            .field("timeout", &self.timeout)
            .field("video_index", &self.video_index)
            .field("audio_index", &self.audio_index)
            .field("max_frame_queue", &self.max_frame_queue)
            .field("go_faster", &self.go_faster)
            .field("low_delay", &self.low_delay)
            .field("flush_threshold", &self.flush_threshold)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("name", &self.name)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl MediaOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force an input format instead of probing.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Add one demuxer option.
    #[must_use]
    pub fn with_input_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.input_options.insert(key.into(), value.into());
        self
    }

    /// Add one muxer option.
    #[must_use]
    pub fn with_output_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.output_options.insert(key.into(), value.into());
        self
    }

    /// Set the I/O buffer size in bytes.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the open/read deadlines.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Select the `index`-th video stream.
    #[must_use]
    pub fn with_video_index(mut self, index: usize) -> Self {
        self.video_index = Some(index);
        self
    }

    /// Ignore video entirely.
    #[must_use]
    pub fn without_video(mut self) -> Self {
        self.video_index = None;
        self
    }

    /// Select the `index`-th audio stream.
    #[must_use]
    pub fn with_audio_index(mut self, index: usize) -> Self {
        self.audio_index = Some(index);
        self
    }

    /// Set the frame collection depth; `0` means unbounded.
    #[must_use]
    pub fn with_max_frame_queue(mut self, depth: usize) -> Self {
        self.max_frame_queue = depth;
        self
    }

    /// Toggle the decoder speed hint.
    #[must_use]
    pub fn with_go_faster(mut self, go_faster: bool) -> Self {
        self.go_faster = go_faster;
        self
    }

    /// Toggle the decoder low-latency hint.
    #[must_use]
    pub fn with_low_delay(mut self, low_delay: bool) -> Self {
        self.low_delay = low_delay;
        self
    }

    /// Set how many consecutive flush markers end a run.
    #[must_use]
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Set the supervisor's pause between attempts.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the capacity of the async callback channel.
    #[must_use]
    pub fn with_callback_queue(mut self, capacity: usize) -> Self {
        self.callback_queue = capacity.max(1);
        self
    }

    /// Name used in log lines and `Display` output.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Device identifier used in log lines and `Display` output.
    #[must_use]
    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Attach a metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The configured metrics sink.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }
}

/// Where a player writes re-muxed packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A single output file (format inferred from the extension unless
    /// [`MediaOptions`] says otherwise).
    File(PathBuf),
    /// Rotating HLS segments archived into a dated directory tree.
    Hls(HlsOutputOptions),
}

impl Destination {
    /// The HLS descriptor, if this is an HLS destination.
    pub fn hls(&self) -> Option<&HlsOutputOptions> {
        match self {
            Destination::Hls(hls) => Some(hls),
            Destination::File(_) => None,
        }
    }
}

/// HLS playlist flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaylistType {
    /// Complete playlist, written once.
    #[default]
    Vod,
    /// Append-only playlist.
    Event,
}

impl PlaylistType {
    fn as_str(self) -> &'static str {
        match self {
            PlaylistType::Vod => "vod",
            PlaylistType::Event => "event",
        }
    }
}

/// Rotating segment output followed by archival into a dated tree.
///
/// The muxer writes segments named [`SEGMENT_PATTERN`](Self::SEGMENT_PATTERN)
/// into `cache_dir`; each completed segment is then moved to
/// `destination_dir/<YYYYMMDD>/<HHMMSS_micros>.ts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsOutputOptions {
    /// Final archive root.
    pub destination_dir: PathBuf,
    /// Scratch directory the muxer writes into. Must exist and be writable.
    pub cache_dir: PathBuf,
    /// Target segment duration in seconds.
    pub segment_duration: u32,
    /// Playlist flavour.
    pub playlist_type: PlaylistType,
    /// Expand `strftime` patterns in segment names.
    pub strftime: bool,
    /// Create missing directories from expanded segment names.
    pub strftime_mkdir: bool,
    /// Discard the first completed segment, which is usually partial.
    pub drop_first_segment: bool,
}

impl HlsOutputOptions {
    /// Reserved playlist filename inside `cache_dir`.
    pub const MASTER_FILENAME: &'static str = "master.m3u8";

    /// Segment filename pattern inside `cache_dir`.
    pub const SEGMENT_PATTERN: &'static str = "%Y-%m-%d_%H-%M-%S.ts";

    /// Extension of segment files.
    pub const SEGMENT_EXTENSION: &'static str = "ts";

    /// Create HLS options with default segmenting.
    pub fn new(destination_dir: impl AsRef<Path>, cache_dir: impl AsRef<Path>) -> Self {
        Self {
            destination_dir: destination_dir.as_ref().to_path_buf(),
            cache_dir: cache_dir.as_ref().to_path_buf(),
            segment_duration: 10,
            playlist_type: PlaylistType::default(),
            strftime: true,
            strftime_mkdir: true,
            drop_first_segment: true,
        }
    }

    /// Set the target segment duration in seconds.
    #[must_use]
    pub fn with_segment_duration(mut self, seconds: u32) -> Self {
        self.segment_duration = seconds.max(1);
        self
    }

    /// Set the playlist flavour.
    #[must_use]
    pub fn with_playlist_type(mut self, playlist_type: PlaylistType) -> Self {
        self.playlist_type = playlist_type;
        self
    }

    /// Keep or discard the first completed segment.
    #[must_use]
    pub fn with_drop_first_segment(mut self, drop: bool) -> Self {
        self.drop_first_segment = drop;
        self
    }

    /// Path of the playlist the muxer is opened on.
    pub fn master_path(&self) -> PathBuf {
        self.cache_dir.join(Self::MASTER_FILENAME)
    }

    /// Muxer options for the `hls` output format.
    pub fn muxer_options(&self) -> BTreeMap<String, String> {
        let flag = |on: bool| if on { "1" } else { "0" }.to_string();
        let segment_filename = self.cache_dir.join(Self::SEGMENT_PATTERN);

        BTreeMap::from([
            ("strftime".to_string(), flag(self.strftime)),
            ("strftime_mkdir".to_string(), flag(self.strftime_mkdir)),
            ("hls_time".to_string(), self.segment_duration.to_string()),
            (
                "hls_playlist_type".to_string(),
                self.playlist_type.as_str().to_string(),
            ),
            (
                "hls_segment_filename".to_string(),
                segment_filename.to_string_lossy().into_owned(),
            ),
        ])
    }
}

/// Settings of a [`StreamBridge`](crate::StreamBridge).
#[derive(Clone)]
pub struct BridgeOptions {
    /// Input address.
    pub input: String,
    /// Optional output address.
    pub output: Option<String>,
    /// Input format name, `None` to probe.
    pub input_format: Option<String>,
    /// Output format name, `None` to infer.
    pub output_format: Option<String>,
    /// Demuxer options; defaults suit RTSP sources.
    pub input_options: BTreeMap<String, String>,
    /// Muxer options.
    pub output_options: BTreeMap<String, String>,
    /// Resize decoded frames to this size before handing them out.
    pub source_size: Option<(u32, u32)>,
    /// Encode at this size; falls back to `source_size`, then the input.
    pub output_size: Option<(u32, u32)>,
    /// I/O buffer size in bytes.
    pub buffer_size: usize,
    /// Open/read deadlines.
    pub timeout: Timeout,
    /// Consecutive flush markers that end the stream.
    pub flush_threshold: usize,
    /// Discard frames instead of warning when the consumer falls behind.
    pub drop_slow_frame: bool,
    /// Outstanding frames tolerated before the slow-consumer policy applies.
    pub drop_threshold: usize,
    /// Capacity of the channel feeding the async consumer.
    pub channel_capacity: usize,
    /// How long the async bridge waits for handlers still running at the
    /// end before aborting them.
    pub drain_timeout: Duration,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl Debug for BridgeOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("BridgeOptions")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("input_format", &self.input_format)
            .field("output_format", &self.output_format)
            .field("input_options", &self.input_options)
            .field("output_options", &self.output_options)
            .field("source_size", &self.source_size)
            .field("output_size", &self.output_size)
            .field("buffer_size", &self.buffer_size)
            .field("timeout", &self.timeout)
            .field("flush_threshold", &self.flush_threshold)
            .field("drop_slow_frame", &self.drop_slow_frame)
            .field("drop_threshold", &self.drop_threshold)
            .field("channel_capacity", &self.channel_capacity)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

impl BridgeOptions {
    /// Bridge options reading from `input`, with RTSP-friendly defaults.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: None,
            input_format: None,
            output_format: None,
            input_options: BTreeMap::from([
                ("rtsp_transport".to_string(), "tcp".to_string()),
                ("fflags".to_string(), "nobuffer".to_string()),
            ]),
            output_options: BTreeMap::new(),
            source_size: None,
            output_size: None,
            buffer_size: DEFAULT_IO_BUFFER_SIZE,
            timeout: Timeout::default(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            drop_slow_frame: false,
            drop_threshold: DEFAULT_DROP_THRESHOLD,
            channel_capacity: DEFAULT_CALLBACK_QUEUE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Encode processed frames to `output`.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Force an input format instead of probing.
    #[must_use]
    pub fn with_input_format(mut self, format: impl Into<String>) -> Self {
        self.input_format = Some(format.into());
        self
    }

    /// Force an output format instead of inferring it.
    #[must_use]
    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    /// Add or override one demuxer option.
    #[must_use]
    pub fn with_input_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.input_options.insert(key.into(), value.into());
        self
    }

    /// Add one muxer option.
    #[must_use]
    pub fn with_output_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.output_options.insert(key.into(), value.into());
        self
    }

    /// Resize decoded frames before handing them out.
    #[must_use]
    pub fn with_source_size(mut self, width: u32, height: u32) -> Self {
        self.source_size = Some((width, height));
        self
    }

    /// Encode at a fixed size.
    #[must_use]
    pub fn with_output_size(mut self, width: u32, height: u32) -> Self {
        self.output_size = Some((width, height));
        self
    }

    /// Set the open/read deadlines.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how many consecutive flush markers end the stream.
    #[must_use]
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Drop frames instead of queueing them once the consumer lags by
    /// `threshold` frames.
    #[must_use]
    pub fn with_drop_slow_frame(mut self, drop: bool, threshold: usize) -> Self {
        self.drop_slow_frame = drop;
        self.drop_threshold = threshold.max(1);
        self
    }

    /// Set the capacity of the channel feeding the async consumer.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Set how long in-flight handlers may run once the stream ended.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Attach a metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Size frames are encoded at, if it is known before the first frame.
    pub fn encode_size(&self) -> Option<(u32, u32)> {
        self.output_size.or(self.source_size)
    }
}
