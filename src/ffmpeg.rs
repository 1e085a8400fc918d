//! The FFmpeg media engine and FFmpeg log level configuration.
//!
//! [`FfmpegEngine`] implements [`MediaEngine`] on top of `ffmpeg-next`:
//! inputs are demuxed and decoded to RGB24 / interleaved s16, outputs either
//! copy packets from an input stream or encode RGB frames to H.264, and
//! audio layouts are converted with `swresample`.
//!
//! FFmpeg has its own internal logging system, separate from the Rust
//! [`log`](https://crates.io/crates/log) crate. By default it prints warnings
//! and errors to stderr, which gets noisy when a supervisor reconnects to a
//! flaky camera every few seconds. [`set_ffmpeg_log_level`] tunes it without
//! importing `ffmpeg-next` directly.
//!
//! # Example
//!
//! ```no_run
//! use framepipe::{FfmpegLogLevel, Player};
//!
//! framepipe::set_ffmpeg_log_level(FfmpegLogLevel::Error);
//!
//! let mut player = Player::new("rtsp://10.0.0.7/stream1");
//! player.open()?;
//! # Ok::<(), framepipe::PipelineError>(())
//! ```
//!
//! # Note
//!
//! The log level controls **FFmpeg's own console output**, not the Rust-side
//! diagnostic messages emitted via the `log` crate. To configure those,
//! use a standard `log` subscriber such as `env_logger` or `tracing`.

use std::ffi::CString;

use ffmpeg_next::Dictionary;
use ffmpeg_next::format::{self, context::Context as FormatContext};
use ffmpeg_next::util::log::Level;

use crate::demux::FfmpegInput;
use crate::engine::{
    AudioResampler, InputContainer, InputSettings, MediaEngine, OutputContainer, OutputSettings,
};
use crate::error::PipelineError;
use crate::frame::AudioFormat;
use crate::mux::FfmpegOutput;
use crate::resample::FfmpegResampler;

/// FFmpeg internal log verbosity level.
///
/// Maps directly to FFmpeg's `AV_LOG_*` constants. Setting a level causes
/// FFmpeg to suppress all messages below that severity.
///
/// # Ordering (most verbose → most quiet)
///
/// `Trace` > `Debug` > `Verbose` > `Info` > `Warning` > `Error` > `Fatal` > `Panic` > `Quiet`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfmpegLogLevel {
    /// Print no output at all.
    Quiet,
    /// Only log conditions after which the process aborts.
    Panic,
    /// Only log unrecoverable errors.
    Fatal,
    /// Log recoverable errors.
    Error,
    /// Log warnings (default FFmpeg level).
    Warning,
    /// Log informational messages.
    Info,
    /// Log verbose informational messages.
    Verbose,
    /// Log debugging messages.
    Debug,
    /// Extremely verbose tracing output.
    Trace,
}

impl FfmpegLogLevel {
    fn to_ffmpeg_level(self) -> Level {
        match self {
            FfmpegLogLevel::Quiet => Level::Quiet,
            FfmpegLogLevel::Panic => Level::Panic,
            FfmpegLogLevel::Fatal => Level::Fatal,
            FfmpegLogLevel::Error => Level::Error,
            FfmpegLogLevel::Warning => Level::Warning,
            FfmpegLogLevel::Info => Level::Info,
            FfmpegLogLevel::Verbose => Level::Verbose,
            FfmpegLogLevel::Debug => Level::Debug,
            FfmpegLogLevel::Trace => Level::Trace,
        }
    }

    fn from_ffmpeg_level(level: Level) -> Self {
        match level {
            Level::Quiet => FfmpegLogLevel::Quiet,
            Level::Panic => FfmpegLogLevel::Panic,
            Level::Fatal => FfmpegLogLevel::Fatal,
            Level::Error => FfmpegLogLevel::Error,
            Level::Warning => FfmpegLogLevel::Warning,
            Level::Info => FfmpegLogLevel::Info,
            Level::Verbose => FfmpegLogLevel::Verbose,
            Level::Debug => FfmpegLogLevel::Debug,
            Level::Trace => FfmpegLogLevel::Trace,
        }
    }
}

/// Set the FFmpeg internal log verbosity level.
///
/// This controls what FFmpeg prints to stderr. It does **not** affect
/// Rust-side `log` crate output.
pub fn set_ffmpeg_log_level(level: FfmpegLogLevel) {
    ffmpeg_next::util::log::set_level(level.to_ffmpeg_level());
}

/// Get the current FFmpeg internal log verbosity level.
///
/// Returns `None` if the current level does not map to a known variant.
pub fn get_ffmpeg_log_level() -> Option<FfmpegLogLevel> {
    ffmpeg_next::util::log::get_level()
        .ok()
        .map(FfmpegLogLevel::from_ffmpeg_level)
}

/// [`MediaEngine`] backed by the system FFmpeg libraries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegEngine;

impl FfmpegEngine {
    /// Create the engine.
    pub fn new() -> Self {
        Self
    }
}

fn initialize(address: &str) -> Result<(), PipelineError> {
    ffmpeg_next::init().map_err(|e| PipelineError::Open {
        address: address.to_string(),
        reason: format!("FFmpeg initialisation failed: {e}"),
    })
}

fn to_dictionary<'a>(options: impl IntoIterator<Item = (&'a String, &'a String)>) -> Dictionary<'static> {
    let mut dictionary = Dictionary::new();
    for (key, value) in options {
        dictionary.set(key, value);
    }
    dictionary
}

fn find_input_format(address: &str, name: &str) -> Result<format::Input, PipelineError> {
    let c_name = CString::new(name).map_err(|_| PipelineError::Open {
        address: address.to_string(),
        reason: format!("invalid format name {name:?}"),
    })?;
    let pointer = unsafe { ffmpeg_sys_next::av_find_input_format(c_name.as_ptr()) };
    if pointer.is_null() {
        return Err(PipelineError::Open {
            address: address.to_string(),
            reason: format!("unknown input format {name:?}"),
        });
    }
    Ok(unsafe { format::Input::wrap(pointer as *mut _) })
}

impl MediaEngine for FfmpegEngine {
    fn open_input(
        &self,
        address: &str,
        settings: &InputSettings,
    ) -> Result<Box<dyn InputContainer>, PipelineError> {
        initialize(address)?;

        let mut options = settings.options.clone();
        // Protocol-level deadlines, in microseconds.
        options
            .entry("timeout".to_string())
            .or_insert_with(|| settings.timeout.open.as_micros().to_string());
        options
            .entry("rw_timeout".to_string())
            .or_insert_with(|| settings.timeout.read.as_micros().to_string());

        log::debug!(
            "Opening input (address='{}', format={:?}, timeout.open={:?}, timeout.read={:?})",
            address, settings.format, settings.timeout.open, settings.timeout.read,
        );

        let open_error = |e: ffmpeg_next::Error| PipelineError::Open {
            address: address.to_string(),
            reason: e.to_string(),
        };

        let context = match &settings.format {
            Some(name) => {
                let input_format = find_input_format(address, name)?;
                match format::open_with(address, &format::Format::Input(input_format), to_dictionary(&options))
                    .map_err(open_error)?
                {
                    FormatContext::Input(input) => input,
                    FormatContext::Output(_) => {
                        return Err(PipelineError::Open {
                            address: address.to_string(),
                            reason: "opened as an output".to_string(),
                        });
                    }
                }
            }
            None => format::input_with_dictionary(address, to_dictionary(&options)).map_err(open_error)?,
        };

        log::info!("Input container opened: {} ({})", address, context.format().name());
        Ok(Box::new(FfmpegInput::new(context)))
    }

    fn open_output(
        &self,
        address: &str,
        settings: &OutputSettings,
    ) -> Result<Box<dyn OutputContainer>, PipelineError> {
        initialize(address)?;

        let open_error = |e: ffmpeg_next::Error| PipelineError::Open {
            address: address.to_string(),
            reason: format!("Failed to create output: {e}"),
        };

        let context = match &settings.format {
            Some(name) => format::output_as(address, name).map_err(open_error)?,
            None => format::output(address).map_err(open_error)?,
        };

        log::info!("Output container opened: {}", address);
        Ok(Box::new(FfmpegOutput::new(context, to_dictionary(&settings.options))))
    }

    fn create_resampler(
        &self,
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Box<dyn AudioResampler>, PipelineError> {
        Ok(Box::new(FfmpegResampler::new(from, to)?))
    }
}
