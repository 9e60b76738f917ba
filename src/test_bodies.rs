//! Body fixtures shared by the unit tests.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream;
use http_body::{Body, Frame, SizeHint};
use http_body_util::StreamBody;

use crate::gate::InspectionSink;

pub(crate) type ChunkBody =
    StreamBody<stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, std::io::Error>>>>;

/// Deterministic, non-repeating-at-small-scale test payload.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub(crate) fn split_into(data: &[u8], chunk: usize) -> Vec<Bytes> {
    data.chunks(chunk.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}

pub(crate) fn chunked(chunks: Vec<Bytes>) -> ChunkBody {
    let frames: Vec<_> = chunks.into_iter().map(|c| Ok(Frame::data(c))).collect();
    StreamBody::new(stream::iter(frames))
}

pub(crate) fn failing_after(chunks: Vec<Bytes>, message: &str) -> ChunkBody {
    let mut frames: Vec<_> = chunks.into_iter().map(|c| Ok(Frame::data(c))).collect();
    frames.push(Err(std::io::Error::other(message.to_string())));
    StreamBody::new(stream::iter(frames))
}

/// Body wrapper that flags when the wrapped body is dropped.
pub(crate) struct DropTracked<B> {
    inner: B,
    dropped: Arc<AtomicBool>,
}

impl<B> DropTracked<B> {
    pub(crate) fn new(inner: B) -> (Self, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                dropped: Arc::clone(&dropped),
            },
            dropped,
        )
    }
}

impl<B> Drop for DropTracked<B> {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

impl<B: Body + Unpin> Body for DropTracked<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Sink that keeps every record for later assertions.
#[derive(Default)]
pub(crate) struct RecordingSink {
    records: Mutex<Vec<(Bytes, bool)>>,
}

impl RecordingSink {
    pub(crate) fn records(&self) -> Vec<(Bytes, bool)> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl InspectionSink for RecordingSink {
    fn record(&self, prefix: Bytes, whole_body: bool) {
        if let Ok(mut records) = self.records.lock() {
            records.push((prefix, whole_body));
        }
    }
}
