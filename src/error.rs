//! Error types for the `framepipe` crate.
//!
//! This module defines [`PipelineError`], the unified error type returned by
//! every fallible operation in the crate. Besides carrying context, each
//! error belongs to one class of the pipeline's error taxonomy, exposed
//! through the `is_*` helpers:
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | transient | [`Again`](PipelineError::Again) | retried in place after a short sleep |
//! | end-of-stream | [`EndOfStream`](PipelineError::EndOfStream) | normal completion of a run |
//! | interruption | [`Interrupted`](PipelineError::Interrupted) | clean unwind, never logged as an error |
//! | fatal | everything else | logged and propagated, ending the run |

use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use ffmpeg_next::Error as FfmpegError;
use thiserror::Error;

use crate::supervisor::AutoPlayerState;

/// The unified error type for all `framepipe` operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// An input or output container could not be opened.
    #[error("Failed to open {address}: {reason}")]
    Open {
        /// Address (path, URL or device) that was passed to the engine.
        address: String,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The input does not contain a video stream.
    #[error("No video stream found in input")]
    NoVideoStream,

    /// A stream index does not exist in the container.
    #[error("Stream {index} does not exist")]
    StreamNotFound {
        /// The requested stream index.
        index: usize,
    },

    /// The engine has no data right now; try again shortly.
    #[error("Resource temporarily unavailable")]
    Again,

    /// The input reached its end.
    #[error("End of stream")]
    EndOfStream,

    /// The worker observed its quit signal.
    #[error("Interrupted")]
    Interrupted,

    /// The peer closed the connection while writing.
    #[error("Broken pipe")]
    BrokenPipe,

    /// The remote endpoint refused the connection.
    #[error("Connection refused")]
    ConnectionRefused,

    /// An error originating from the FFmpeg libraries.
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),

    /// A video frame could not be decoded or converted.
    #[error("Failed to decode video frame: {0}")]
    VideoDecodeError(String),

    /// A video frame could not be encoded.
    #[error("Video encoding error: {0}")]
    VideoEncodeError(String),

    /// Audio samples could not be resampled.
    #[error("Audio resampling error: {0}")]
    ResampleError(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    IoError(#[from] IoError),

    /// The segment scratch or destination directory is unusable.
    #[error("Archive directory {path} is unusable: {reason}")]
    Archive {
        /// Offending directory or file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The frame collection was closed.
    #[error("Frame collection is closed")]
    CollectionClosed,

    /// No frame arrived before the deadline.
    #[error("Timed out waiting for a frame")]
    Timeout,

    /// `open()` was called on a player that is already open.
    #[error("Player is already open")]
    AlreadyOpen,

    /// `close()` was called on a player that is not open.
    #[error("Player is not open")]
    NotOpen,

    /// A supervisor operation is not valid in its current state.
    #[error("Illegal supervisor state: {state:?}")]
    IllegalState {
        /// State observed when the call was rejected.
        state: AutoPlayerState,
    },

    /// A bridge loop was started after an earlier fatal error.
    #[error("Bridge already failed: {0}")]
    AlreadyFailed(#[source] Arc<PipelineError>),

    /// A user callback reported an error.
    #[error("Callback error: {0}")]
    Callback(String),

    /// Async callbacks were registered but no tokio runtime is reachable.
    #[error("Async callbacks require a tokio runtime")]
    NoRuntime,

    /// The worker thread panicked.
    #[error("Worker thread panicked")]
    WorkerPanicked,
}

impl PipelineError {
    /// `true` for conditions that are retried in place.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Again)
    }

    /// `true` when the input ended normally.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, PipelineError::EndOfStream)
    }

    /// `true` when the quit signal unwound the loop.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PipelineError::Interrupted)
    }

    /// `true` for errors after which draining the output encoder is pointless
    /// because the peer is gone.
    pub fn skips_flush(&self) -> bool {
        match self {
            PipelineError::BrokenPipe | PipelineError::ConnectionRefused => true,
            PipelineError::AlreadyFailed(inner) => inner.skips_flush(),
            _ => false,
        }
    }

    /// `true` for every error that ends a run abnormally.
    pub fn is_fatal(&self) -> bool {
        !(self.is_transient() || self.is_end_of_stream() || self.is_interrupted())
    }
}

impl From<FfmpegError> for PipelineError {
    fn from(error: FfmpegError) -> Self {
        match error {
            FfmpegError::Eof => PipelineError::EndOfStream,
            FfmpegError::Other { errno } => match IoError::from_raw_os_error(errno).kind() {
                ErrorKind::WouldBlock => PipelineError::Again,
                ErrorKind::BrokenPipe => PipelineError::BrokenPipe,
                ErrorKind::ConnectionRefused => PipelineError::ConnectionRefused,
                _ => PipelineError::FfmpegError(error.to_string()),
            },
            other => PipelineError::FfmpegError(other.to_string()),
        }
    }
}
