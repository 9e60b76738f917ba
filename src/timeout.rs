//! Deadlines for upstream bodies.
//!
//! A body that stalls between frames, or trickles for too long overall,
//! fails with `RelayError::Timeout` instead of holding the relay open.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::time::{Instant, Sleep, sleep};

use crate::config::RelayConfig;
use crate::error::{BoxError, RelayError};

/// Per-frame and whole-stream deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Longest wait for the next frame
    pub chunk_timeout: Duration,
    /// Longest time from first poll to end-of-stream
    pub total_timeout: Duration,
}

impl TimeoutConfig {
    pub fn new(chunk_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            chunk_timeout,
            total_timeout,
        }
    }
}

impl From<&RelayConfig> for TimeoutConfig {
    fn from(config: &RelayConfig) -> Self {
        Self::new(config.stream_read_timeout, config.stream_total_timeout)
    }
}

/// Body wrapper enforcing a [`TimeoutConfig`].
///
/// The total clock starts on the first poll, not at construction, so time
/// spent before the body is read is not charged to it. The chunk clock only
/// runs while the inner body is pending, so a consumer that stops pulling
/// never trips it.
pub struct TimeoutBody<B> {
    inner: B,
    config: TimeoutConfig,
    chunk_deadline: Pin<Box<Sleep>>,
    total_deadline: Pin<Box<Sleep>>,
    started: bool,
    waiting: bool,
}

impl<B> TimeoutBody<B> {
    pub fn new(inner: B, config: TimeoutConfig) -> Self {
        Self {
            inner,
            config,
            chunk_deadline: Box::pin(sleep(config.chunk_timeout)),
            total_deadline: Box::pin(sleep(config.total_timeout)),
            started: false,
            waiting: false,
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }
}

impl<B> Body for TimeoutBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if !this.started {
            this.started = true;
            this.total_deadline
                .as_mut()
                .reset(Instant::now() + this.config.total_timeout);
        }

        if this.total_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(RelayError::Timeout(format!(
                "total stream timeout exceeded ({:?})",
                this.config.total_timeout
            )))));
        }

        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_frame(cx) {
            this.waiting = false;
            return Poll::Ready(result.map(|r| r.map_err(|e| RelayError::from_boxed(e.into()))));
        }

        // Arm the idle clock on the first pending poll after a frame.
        if !this.waiting {
            this.waiting = true;
            this.chunk_deadline
                .as_mut()
                .reset(Instant::now() + this.config.chunk_timeout);
        }

        if this.chunk_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(RelayError::Timeout(format!(
                "chunk timeout exceeded ({:?})",
                this.config.chunk_timeout
            )))));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
