//! Bounded, drop-oldest hand-off between the worker thread and consumers.
//!
//! A [`FrameCollection`] holds two things for one track:
//!
//! - the **newest** frame, overwritten unconditionally on every decode, for
//!   consumers that only care about the current picture;
//! - a short **backlog** of pending frames, capped at `capacity`. When full,
//!   the oldest pending frame is evicted so the backlog always holds the
//!   most recent frames. The producer never waits.
//!
//! Consumers await [`FrameCollection::get`], which suspends until a frame is
//! pending, the deadline passes, or the collection is closed. Once closed,
//! `get` never suspends: it returns whatever is still queued and then fails
//! with [`PipelineError::CollectionClosed`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use framepipe::{Player, PipelineError};
//!
//! # async fn example() -> Result<(), PipelineError> {
//! let mut player = Player::new("input.mp4");
//! player.open()?;
//! let video = player.video().cloned().ok_or(PipelineError::NoVideoStream)?;
//!
//! loop {
//!     match video.get(Some(Duration::from_secs(1))).await {
//!         Ok(frame) => println!("pts={:?}", frame.pts()),
//!         Err(PipelineError::Timeout) => continue,
//!         Err(_) => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ffmpeg_next::Rational;
use tokio::sync::Notify;

use crate::error::PipelineError;
use crate::frame::{Frame, FrameData, MediaKind};
use crate::metrics::{DropReason, MetricsSink, NoOpMetrics};
use crate::stream::FrameStream;

struct State {
    pending: VecDeque<Frame>,
    newest: Option<Frame>,
    closed: bool,
    evicted: u64,
}

struct Shared {
    kind: MediaKind,
    capacity: usize,
    state: Mutex<State>,
    notify: Notify,
    metrics: Arc<dyn MetricsSink>,
}

/// Per-track frame hand-off. Cloning yields another handle to the same
/// collection.
#[derive(Clone)]
pub struct FrameCollection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for FrameCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FrameCollection")
            .field("kind", &self.shared.kind)
            .field("capacity", &self.shared.capacity)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl FrameCollection {
    /// Create a collection holding at most `capacity` pending frames;
    /// `0` means unbounded.
    pub fn new(kind: MediaKind, capacity: usize) -> Self {
        Self::with_metrics(kind, capacity, Arc::new(NoOpMetrics))
    }

    /// Like [`new`](Self::new), reporting evictions to `metrics`.
    pub fn with_metrics(kind: MediaKind, capacity: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                capacity,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    newest: None,
                    closed: false,
                    evicted: 0,
                }),
                notify: Notify::new(),
                metrics,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track kind of this collection.
    pub fn kind(&self) -> MediaKind {
        self.shared.kind
    }

    /// Maximum backlog, `0` for unbounded.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Append a frame, evicting the oldest pending frames if full.
    ///
    /// # Errors
    ///
    /// [`PipelineError::CollectionClosed`] after [`close`](Self::close).
    pub fn put(&self, frame: Frame) -> Result<(), PipelineError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PipelineError::CollectionClosed);
            }
            if self.shared.capacity > 0 {
                while state.pending.len() >= self.shared.capacity {
                    state.pending.pop_front();
                    state.evicted += 1;
                    self.shared.metrics.on_frame_dropped(DropReason::QueueFull);
                }
            }
            state.pending.push_back(frame);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Replace the newest-frame snapshot without touching the backlog.
    ///
    /// # Errors
    ///
    /// [`PipelineError::CollectionClosed`] after [`close`](Self::close).
    pub fn update_newest(&self, frame: &Frame) -> Result<(), PipelineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PipelineError::CollectionClosed);
        }
        state.newest = Some(frame.clone());
        Ok(())
    }

    /// [`update_newest`](Self::update_newest) then [`put`](Self::put);
    /// returns the snapshot payload.
    pub fn update_newest_and_put(&self, frame: Frame) -> Result<FrameData, PipelineError> {
        self.update_newest(&frame)?;
        let data = frame.data().clone();
        self.put(frame)?;
        Ok(data)
    }

    /// The newest frame seen so far.
    pub fn newest(&self) -> Option<Frame> {
        self.lock().newest.clone()
    }

    /// Timestamp of the newest frame.
    pub fn newest_pts(&self) -> Option<i64> {
        self.lock().newest.as_ref().and_then(Frame::pts)
    }

    /// Time base of the newest frame.
    pub fn newest_time_base(&self) -> Option<Rational> {
        self.lock().newest.as_ref().map(Frame::time_base)
    }

    /// Take the oldest pending frame without waiting.
    ///
    /// Returns `Ok(None)` when nothing is pending and the collection is open.
    ///
    /// # Errors
    ///
    /// [`PipelineError::CollectionClosed`] when closed and drained.
    pub fn try_get(&self) -> Result<Option<Frame>, PipelineError> {
        let mut state = self.lock();
        match state.pending.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if state.closed => Err(PipelineError::CollectionClosed),
            None => Ok(None),
        }
    }

    /// Wait for the oldest pending frame.
    ///
    /// `timeout` of `None` waits until a frame arrives or the collection is
    /// closed. A closed collection never suspends the caller.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Timeout`] if the deadline passes first.
    /// - [`PipelineError::CollectionClosed`] when closed and drained.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Frame, PipelineError> {
        let wait = async {
            loop {
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.try_get() {
                    Ok(Some(frame)) => return Ok::<Frame, PipelineError>(frame),
                    Ok(None) => notified.await,
                    Err(error) => return Err(error),
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| PipelineError::Timeout)?,
            None => wait.await,
        }
    }

    /// Close the collection and wake every waiter. Idempotent.
    pub fn close(&self) {
        let newly_closed = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            log::debug!("{:?} frame collection closed", self.shared.kind);
        }
        self.shared.notify.notify_waiters();
    }

    /// `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pending frames.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Frames evicted by the drop-oldest policy so far.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    /// Consume pending frames as a [`Stream`](tokio_stream::Stream) that
    /// ends once the collection is closed and drained.
    pub fn stream(&self) -> FrameStream {
        FrameStream::new(self.clone())
    }
}
