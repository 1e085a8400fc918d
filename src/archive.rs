//! Hand-off of completed HLS segments into a dated archive tree.
//!
//! The HLS muxer writes rotating segments into the scratch directory. A
//! segment is complete once a newer one exists (or once the output has
//! been closed); only then is it moved to
//! `destination_dir/<YYYYMMDD>/<HHMMSS_micros>.ts`, named after the wall
//! clock time its recording started. The move is a rename when both
//! directories share a filesystem, and a copy to a `.partial` file followed
//! by a rename otherwise, so the destination never holds a half-written
//! segment.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::configuration::HlsOutputOptions;
use crate::error::PipelineError;

const WRITE_PROBE: &str = ".framepipe-write-probe";

/// A segment that reached the destination tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArchivedSegment {
    pub(crate) directory: String,
    pub(crate) filename: String,
    pub(crate) start: DateTime<Local>,
    pub(crate) last: DateTime<Local>,
}

fn archive_error(path: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::Archive {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn ensure_writable_directory(path: &Path) -> Result<(), PipelineError> {
    if !path.is_dir() {
        return Err(archive_error(path, "not found or not a directory"));
    }
    let probe = path.join(WRITE_PROBE);
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(|e| archive_error(path, format!("write permission is required: {e}")))?;
    fs::remove_file(&probe)?;
    Ok(())
}

/// Check both archive directories before anything is opened.
///
/// The scratch directory must already exist; the destination root is
/// created if missing. Both must accept new files.
pub(crate) fn validate_directories(options: &HlsOutputOptions) -> Result<(), PipelineError> {
    ensure_writable_directory(&options.cache_dir)?;
    if !options.destination_dir.exists() {
        fs::create_dir_all(&options.destination_dir)
            .map_err(|e| archive_error(&options.destination_dir, e.to_string()))?;
    }
    ensure_writable_directory(&options.destination_dir)
}

/// Watches the scratch directory and archives completed segments.
#[derive(Debug)]
pub(crate) struct SegmentArchiver {
    options: HlsOutputOptions,
    first_segment_handled: bool,
    segment_start: DateTime<Local>,
}

impl SegmentArchiver {
    pub(crate) fn new(options: HlsOutputOptions, start: DateTime<Local>) -> Self {
        Self {
            options,
            first_segment_handled: false,
            segment_start: start,
        }
    }

    /// When the segment currently being recorded began.
    pub(crate) fn segment_start(&self) -> DateTime<Local> {
        self.segment_start
    }

    /// Remove everything a previous run left in the scratch directory.
    pub(crate) fn clear_cache(&self) -> Result<(), PipelineError> {
        for entry in fs::read_dir(&self.options.cache_dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
                log::warn!("Removed stale HLS cache file: {}", path.display());
            }
        }
        Ok(())
    }

    fn cached_segments(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.options.cache_dir)? {
            let path = entry?.path();
            let is_segment = path
                .extension()
                .is_some_and(|ext| ext == HlsOutputOptions::SEGMENT_EXTENSION);
            if is_segment && path.is_file() {
                segments.push(path);
            }
        }
        // Segment names are zero-padded timestamps, so name order is age order.
        segments.sort();
        Ok(segments)
    }

    /// Archive every segment that has a newer successor.
    pub(crate) fn poll(&mut self, now: DateTime<Local>) -> Result<Vec<ArchivedSegment>, PipelineError> {
        let segments = self.cached_segments()?;
        let complete = segments.len().saturating_sub(1);
        self.archive_all(&segments[..complete], now)
    }

    /// Archive every remaining segment; call after the output is closed.
    pub(crate) fn finish(&mut self, now: DateTime<Local>) -> Result<Vec<ArchivedSegment>, PipelineError> {
        let segments = self.cached_segments()?;
        self.archive_all(&segments, now)
    }

    fn archive_all(
        &mut self,
        segments: &[PathBuf],
        now: DateTime<Local>,
    ) -> Result<Vec<ArchivedSegment>, PipelineError> {
        let mut archived = Vec::new();
        for segment in segments {
            if let Some(done) = self.archive_one(segment, now)? {
                archived.push(done);
            }
            self.segment_start = now;
        }
        Ok(archived)
    }

    fn archive_one(
        &mut self,
        cached: &Path,
        now: DateTime<Local>,
    ) -> Result<Option<ArchivedSegment>, PipelineError> {
        if !self.first_segment_handled {
            self.first_segment_handled = true;
            if self.options.drop_first_segment {
                log::debug!("Removing the first segment file: {}", cached.display());
                fs::remove_file(cached)?;
                return Ok(None);
            }
        }

        let start = self.segment_start;
        let directory = start.format("%Y%m%d").to_string();
        let filename = format!("{}.{}", start.format("%H%M%S_%6f"), HlsOutputOptions::SEGMENT_EXTENSION);

        let record_directory = self.options.destination_dir.join(&directory);
        fs::create_dir_all(&record_directory)?;
        let archive_path = record_directory.join(&filename);
        if archive_path.exists() {
            return Err(archive_error(&archive_path, "archive file already exists"));
        }

        move_file(cached, &archive_path)?;
        log::info!("Archived segment {} -> {}", cached.display(), archive_path.display());

        Ok(Some(ArchivedSegment {
            directory,
            filename,
            start,
            last: now,
        }))
    }
}

/// Rename `from` to `to`, falling back to copy-then-rename across
/// filesystems. `to` appears only once complete.
fn move_file(from: &Path, to: &Path) -> Result<(), PipelineError> {
    match fs::rename(from, to) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {}
        Err(e) => return Err(archive_error(from, format!("rename failed: {e}"))),
    }

    let partial = to.with_extension("partial");
    let copied = fs::copy(from, &partial).and_then(|_| fs::rename(&partial, to));
    if let Err(e) = copied {
        let _ = fs::remove_file(&partial);
        return Err(archive_error(to, format!("copy failed: {e}")));
    }
    fs::remove_file(from)?;
    Ok(())
}
