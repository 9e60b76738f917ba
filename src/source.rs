//! One-shot byte source over an HTTP body.
//!
//! A [`ByteSource`] is a forward-only cursor over the data frames of a body.
//! Bytes come out in source order exactly once; a frame that is larger than
//! the caller's request is split and the remainder is kept for the next read.
//!
//! Release is explicit: [`ByteSource::cancel`] drops the underlying body
//! (which for a hyper body aborts the upstream transfer) and records why.
//! A source dropped while still open cancels itself with
//! [`CancelReason::released`].
//!
//! [`ByteSource::tee`] splits an unread source into two independent cursors
//! over the same bytes. Frames pulled by one branch are queued for the other
//! until that branch reads or is released.

use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker, ready};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use tracing::{debug, warn};

use crate::error::{BoxError, RelayError, RelayResult};

/// Type-erased body a [`ByteSource`] reads from.
pub type SourceBody = UnsyncBoxBody<Bytes, BoxError>;

/// Why a source was released before it reached its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason(String);

impl CancelReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    /// The duplicate handle is no longer needed once the prefix is classified.
    pub fn inspection_complete() -> Self {
        Self::new("inspection complete")
    }

    /// The outgoing body was dropped by its consumer.
    pub fn downstream_dropped() -> Self {
        Self::new("downstream dropped")
    }

    /// The outgoing body's cancellation token fired.
    pub fn downstream_cancelled() -> Self {
        Self::new("downstream cancelled")
    }

    /// The source handle went out of scope while still open.
    pub fn released() -> Self {
        Self::new("source released")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a [`ByteSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// More bytes may follow.
    Open,
    /// The body signalled end-of-stream.
    Ended,
    /// A read failed; the body has been released.
    Failed,
    /// Released on request before the end was reached.
    Cancelled(CancelReason),
}

/// Forward-only, read-once cursor over a body's data frames.
pub struct ByteSource {
    body: Option<SourceBody>,
    pending: Bytes,
    consumed: u64,
    state: SourceState,
    label: &'static str,
}

impl ByteSource {
    /// Wrap any body whose data frames are [`Bytes`].
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::from_body(
            body.map_err(|e| -> BoxError { e.into() }).boxed_unsync(),
            "upstream",
        )
    }

    fn from_body(body: SourceBody, label: &'static str) -> Self {
        Self {
            body: Some(body),
            pending: Bytes::new(),
            consumed: 0,
            state: SourceState::Open,
            label,
        }
    }

    /// Name used in log events for this handle.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Total bytes handed out so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    pub fn state(&self) -> &SourceState {
        &self.state
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, SourceState::Cancelled(_))
    }

    /// The reason given to the first [`cancel`](Self::cancel) call, if any.
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match &self.state {
            SourceState::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }

    /// Poll for the next run of at most `max` bytes.
    ///
    /// Returns `Ok(None)` once the source has ended or been released. A data
    /// frame longer than `max` is split without copying.
    pub fn poll_next_bytes(
        &mut self,
        cx: &mut Context<'_>,
        max: usize,
    ) -> Poll<RelayResult<Option<Bytes>>> {
        loop {
            if !self.pending.is_empty() {
                let take = self.pending.len().min(max.max(1));
                let chunk = self.pending.split_to(take);
                self.consumed += take as u64;
                return Poll::Ready(Ok(Some(chunk)));
            }

            let Some(body) = self.body.as_mut() else {
                return Poll::Ready(Ok(None));
            };

            let polled = Pin::new(body).poll_frame(cx);
            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(frame))) => {
                    // Trailers carry no body bytes.
                    if let Ok(data) = frame.into_data() {
                        self.pending = data;
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    self.body = None;
                    self.state = SourceState::Failed;
                    let err = RelayError::from_boxed(err);
                    warn!(
                        source = self.label,
                        consumed = self.consumed,
                        error = %err,
                        "Byte source read failed"
                    );
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(None) => {
                    self.body = None;
                    self.state = SourceState::Ended;
                    return Poll::Ready(Ok(None));
                }
            }
        }
    }

    /// Poll a single low-level read into `buf`. `Ok(0)` means end-of-stream.
    pub fn poll_read_into(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<RelayResult<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match ready!(self.poll_next_bytes(cx, buf.len())) {
            Ok(Some(chunk)) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Poll::Ready(Ok(chunk.len()))
            }
            Ok(None) => Poll::Ready(Ok(0)),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    /// Copy whatever the next read yields into `buf`, up to its length.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> RelayResult<usize> {
        poll_fn(|cx| self.poll_read_into(cx, buf)).await
    }

    /// Next run of at most `max` bytes, or `None` at end-of-stream.
    pub async fn next_chunk(&mut self, max: usize) -> RelayResult<Option<Bytes>> {
        poll_fn(|cx| self.poll_next_bytes(cx, max)).await
    }

    /// Release the underlying body. Calling this on a source that already
    /// ended, failed or was cancelled does nothing.
    pub fn cancel(&mut self, reason: CancelReason) {
        if self.state != SourceState::Open {
            return;
        }
        self.body = None;
        self.pending = Bytes::new();
        debug!(
            source = self.label,
            consumed = self.consumed,
            reason = %reason,
            "Byte source cancelled"
        );
        self.state = SourceState::Cancelled(reason);
    }

    /// Split an unread source into `(primary, duplicate)`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::DuplicationTooLate` if any byte has already been
    /// read from this source, or if it is no longer open.
    pub fn tee(mut self) -> RelayResult<(ByteSource, ByteSource)> {
        if self.consumed > 0 || !self.pending.is_empty() || self.state != SourceState::Open {
            return Err(RelayError::DuplicationTooLate {
                consumed: self.consumed,
            });
        }
        let Some(body) = self.body.take() else {
            return Err(RelayError::DuplicationTooLate {
                consumed: self.consumed,
            });
        };

        let shared = Arc::new(Mutex::new(TeeShared {
            body: Some(body),
            branches: Default::default(),
            finished: false,
        }));
        let primary = TeeBranch {
            shared: Arc::clone(&shared),
            index: 0,
        };
        let duplicate = TeeBranch { shared, index: 1 };

        Ok((
            ByteSource::from_body(primary.boxed_unsync(), "primary"),
            ByteSource::from_body(duplicate.boxed_unsync(), "duplicate"),
        ))
    }
}

impl Drop for ByteSource {
    fn drop(&mut self) {
        if self.body.is_some() {
            self.cancel(CancelReason::released());
        }
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("label", &self.label)
            .field("consumed", &self.consumed)
            .field("pending", &self.pending.len())
            .field("state", &self.state)
            .finish()
    }
}

impl Body for ByteSource {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.get_mut()
            .poll_next_bytes(cx, usize::MAX)
            .map(|result| result.map(|chunk| chunk.map(Frame::data)).transpose())
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_empty() && self.body.as_ref().is_none_or(|b| b.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        let pending = self.pending.len() as u64;
        match &self.body {
            Some(body) => {
                let inner = body.size_hint();
                let mut hint = SizeHint::new();
                hint.set_lower(inner.lower().saturating_add(pending));
                if let Some(upper) = inner.upper() {
                    hint.set_upper(upper.saturating_add(pending));
                }
                hint
            }
            None => SizeHint::with_exact(pending),
        }
    }
}

// ============================================================================
// Tee
// ============================================================================

enum TeeItem {
    Data(Bytes),
    Error(String),
}

#[derive(Default)]
struct BranchState {
    queue: VecDeque<TeeItem>,
    waker: Option<Waker>,
    released: bool,
}

struct TeeShared {
    body: Option<SourceBody>,
    branches: [BranchState; 2],
    finished: bool,
}

impl TeeShared {
    fn poll_branch(
        &mut self,
        index: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        if let Some(item) = self.branches[index].queue.pop_front() {
            return Poll::Ready(Some(match item {
                TeeItem::Data(data) => Ok(Frame::data(data)),
                TeeItem::Error(msg) => Err(Box::new(RelayError::SourceRead(msg)) as BoxError),
            }));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            let Some(body) = self.body.as_mut() else {
                return Poll::Ready(None);
            };
            let polled = Pin::new(body).poll_frame(cx);
            match polled {
                Poll::Pending => {
                    self.branches[index].waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        self.push_to_other(index, TeeItem::Data(data.clone()));
                        return Poll::Ready(Some(Ok(Frame::data(data))));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    self.push_to_other(index, TeeItem::Error(err.to_string()));
                    self.finish();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    self.finish();
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn push_to_other(&mut self, index: usize, item: TeeItem) {
        let other = &mut self.branches[1 - index];
        if other.released {
            return;
        }
        other.queue.push_back(item);
        if let Some(waker) = other.waker.take() {
            waker.wake();
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.body = None;
        for branch in &mut self.branches {
            if let Some(waker) = branch.waker.take() {
                waker.wake();
            }
        }
    }
}

/// One cursor of a tee. Dropping it stops queueing for that side; the
/// shared upstream body is released once both sides are gone.
struct TeeBranch {
    shared: Arc<Mutex<TeeShared>>,
    index: usize,
}

impl Body for TeeBranch {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let index = self.index;
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.poll_branch(index, cx)
    }
}

impl Drop for TeeBranch {
    fn drop(&mut self) {
        let other_waker = {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            let branch = &mut shared.branches[self.index];
            branch.released = true;
            branch.queue.clear();
            branch.waker = None;
            if shared.branches.iter().all(|b| b.released) {
                shared.body = None;
            }
            // The upstream may only hold this branch's waker.
            shared.branches[1 - self.index].waker.take()
        };
        if let Some(waker) = other_waker {
            waker.wake();
        }
    }
}
