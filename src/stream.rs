//! Async streaming over a frame collection.
//!
//! [`FrameStream`] adapts [`FrameCollection::get`] to
//! [`tokio_stream::Stream`] so consumers can use
//! [`StreamExt`](tokio_stream::StreamExt) combinators such as `next()`,
//! `map()`, `filter()` and `take()`. The stream yields pending frames in
//! decode order and ends once the collection is closed and drained.
//!
//! # Example
//!
//! ```no_run
//! use tokio_stream::StreamExt;
//!
//! use framepipe::{PipelineError, Player};
//!
//! # async fn example() -> Result<(), PipelineError> {
//! let mut player = Player::new("rtsp://10.0.0.7/stream1");
//! player.open()?;
//!
//! let mut frames = player.video().ok_or(PipelineError::NoVideoStream)?.stream();
//! while let Some(frame) = frames.next().await {
//!     println!("pts={:?}", frame.pts());
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio_stream::Stream;

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::frame_collection::FrameCollection;

type PendingGet = Pin<Box<dyn Future<Output = Result<Frame, PipelineError>> + Send>>;

/// A stream of frames taken from a [`FrameCollection`].
///
/// Created via [`FrameCollection::stream`]. Several streams over the same
/// collection compete for frames; each frame is delivered once.
pub struct FrameStream {
    collection: FrameCollection,
    pending: Option<PendingGet>,
    finished: bool,
}

impl FrameStream {
    pub(crate) fn new(collection: FrameCollection) -> Self {
        Self {
            collection,
            pending: None,
            finished: false,
        }
    }
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let collection = self.collection.clone();
        let pending = self
            .pending
            .get_or_insert_with(|| Box::pin(async move { collection.get(None).await }));

        let polled = pending.as_mut().poll(cx);
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.pending = None;
                match result {
                    Ok(frame) => Poll::Ready(Some(frame)),
                    Err(_) => {
                        self.finished = true;
                        Poll::Ready(None)
                    }
                }
            }
        }
    }
}
