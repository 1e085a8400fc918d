//! # framepipe
//!
//! Decode live or recorded media on a background thread and hand the
//! frames to async consumers, with automatic reconnection and optional
//! segment archiving.
//!
//! `framepipe` keeps every blocking FFmpeg call (open, demux, decode,
//! encode, mux, file moves) on one dedicated worker thread per run, powered
//! by the [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate. The
//! consumer side is a [tokio](https://tokio.rs) runtime that reads frames
//! from bounded, never-blocking [`FrameCollection`]s or receives them
//! through callbacks.
//!
//! ## Quick Start
//!
//! ### Read frames from a camera
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use framepipe::{MediaOptions, PipelineError, Player};
//!
//! # async fn example() -> Result<(), PipelineError> {
//! let mut player = Player::new("rtsp://10.0.0.7/stream1")
//!     .with_options(MediaOptions::new().with_name("gate").with_low_delay(true));
//! player.open()?;
//!
//! let video = player.video().ok_or(PipelineError::NoVideoStream)?;
//! let frame = video.get(Some(Duration::from_secs(5))).await?;
//! println!("{:?}", frame.as_video().map(|image| image.dimensions()));
//!
//! player.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Archive a stream as HLS segments, reconnecting forever
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use framepipe::{Destination, HlsOutputOptions, Supervisor};
//!
//! # async fn example() -> Result<(), framepipe::PipelineError> {
//! let hls = HlsOutputOptions::new("/srv/archive", "/var/cache/framepipe");
//! let supervisor = Arc::new(
//!     Supervisor::new("rtsp://10.0.0.7/stream1").with_destination(Destination::Hls(hls)),
//! );
//!
//! let runner = supervisor.clone();
//! let task = tokio::spawn(async move { runner.run().await });
//! // ...
//! supervisor.close()?;
//! # let _ = task.await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! - **[`FrameCollection`]**: bounded drop-oldest hand-off plus a newest-frame
//!   snapshot, one per track.
//! - **[`Player`]**: opens the containers, decides pacing, runs the worker
//!   thread and tears it down.
//! - **[`Supervisor`]**: reopens a fresh player after every failure or end of
//!   stream until told to stop.
//! - **[`StreamBridge`] / [`AsyncBridge`]**: a single-video-stream pipeline
//!   with a slow-consumer drop policy.
//! - **[`MediaEngine`]**: the seam to the codec library; [`FfmpegEngine`] in
//!   production, synthetic engines in tests.
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed on your system.

mod archive;
pub mod bridge;
pub mod callbacks;
pub mod configuration;
mod demux;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod frame_collection;
pub mod metrics;
mod mux;
pub mod player;
mod resample;
pub mod stream;
pub mod supervisor;
mod timestamps;
mod utilities;
mod worker;

pub use bridge::{AsyncBridge, FrameIter, ImageHandler, StickyError, StreamBridge};
pub use callbacks::{AsyncMediaHandler, CallbackError, CallbackResult, MediaCallbacks, MediaHandler};
pub use configuration::{
    BridgeOptions, Destination, HlsOutputOptions, MediaOptions, PlaylistType, Timeout,
};
pub use engine::{
    AudioResampler, CodecHints, InputContainer, InputSettings, MediaEngine, OutputContainer,
    OutputSettings, StreamInfo, StreamTemplate, VideoEncoderSettings,
};
pub use error::PipelineError;
pub use ffmpeg::{FfmpegEngine, FfmpegLogLevel, get_ffmpeg_log_level, set_ffmpeg_log_level};
pub use ffmpeg_next::Rational;
pub use frame::{AudioFormat, AudioSamples, Frame, FrameData, MediaKind, Packet};
pub use frame_collection::FrameCollection;
pub use metrics::{CancellationToken, DropReason, LogMetrics, MetricsSink, Step};
pub use player::Player;
pub use stream::FrameStream;
pub use supervisor::{AutoPlayerState, Supervisor};
pub use worker::RunPhase;
