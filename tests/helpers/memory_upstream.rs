//! In-memory upstreams implementing `peek_relay::upstream::Upstream`.

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use http::{HeaderValue, Response, header};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, StreamBody};
use peek_relay::error::{BoxError, RelayError, RelayResult};
use peek_relay::source::SourceBody;
use peek_relay::upstream::Upstream;
use tokio::sync::Notify;

/// Upstream that serves a fixed payload in fixed-size frames.
///
/// Each fetch builds a fresh body. The `released` flag flips when the most
/// recent body is dropped, which is how the relay lets go of an upstream.
pub struct MemoryUpstream {
    data: Bytes,
    chunk_size: usize,
    content_length: Option<String>,
    failure: Option<String>,
    tail_gate: Option<Arc<Notify>>,
    fetches: AtomicUsize,
    released: Arc<AtomicBool>,
}

impl MemoryUpstream {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        let content_length = Some(data.len().to_string());
        Self {
            data: Bytes::from(data),
            chunk_size: chunk_size.max(1),
            content_length,
            failure: None,
            tail_gate: None,
            fetches: AtomicUsize::new(0),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override (or remove) the `content-length` header.
    pub fn with_content_length(mut self, value: Option<&str>) -> Self {
        self.content_length = value.map(str::to_owned);
        self
    }

    /// Fail the body with `message` after every data frame has been sent.
    pub fn failing_with(mut self, message: &str) -> Self {
        self.failure = Some(message.to_owned());
        self
    }

    /// Hold the body's end (or its failure) until `gate` is notified, so a
    /// client can receive the response head first.
    pub fn hold_tail_until(mut self, gate: Arc<Notify>) -> Self {
        self.tail_gate = Some(gate);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn fetch(&self) -> RelayResult<Response<SourceBody>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);

        let mut frames: Vec<Result<Frame<Bytes>, std::io::Error>> = Vec::new();
        let mut offset = 0;
        while offset < self.data.len() {
            let end = (offset + self.chunk_size).min(self.data.len());
            frames.push(Ok(Frame::data(self.data.slice(offset..end))));
            offset = end;
        }

        let gate = self.tail_gate.clone();
        let failure = self.failure.clone();
        let tail = stream::once(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            failure.map(|message| Err(std::io::Error::other(message)))
        })
        .filter_map(|item| async move { item });

        let body = ReleaseTracked {
            inner: StreamBody::new(stream::iter(frames).chain(tail).boxed()),
            released: Arc::clone(&self.released),
        };

        let mut response = Response::new(
            body.map_err(|e| -> BoxError { Box::new(e) })
                .boxed_unsync(),
        );
        response
            .headers_mut()
            .insert("x-upstream", HeaderValue::from_static("memory"));
        if let Some(len) = &self.content_length
            && let Ok(value) = HeaderValue::from_str(len)
        {
            response.headers_mut().insert(header::CONTENT_LENGTH, value);
        }
        Ok(response)
    }
}

/// Upstream whose fetch always fails with the given error.
pub struct FailingUpstream {
    make_error: fn() -> RelayError,
}

impl FailingUpstream {
    pub fn refused() -> Self {
        Self {
            make_error: || RelayError::ConnectionRefused("127.0.0.1:9 refused".into()),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            make_error: || RelayError::Timeout("upstream did not answer".into()),
        }
    }
}

#[async_trait]
impl Upstream for FailingUpstream {
    async fn fetch(&self) -> RelayResult<Response<SourceBody>> {
        Err((self.make_error)())
    }
}

/// Body wrapper that records when it is dropped.
struct ReleaseTracked<B> {
    inner: B,
    released: Arc<AtomicBool>,
}

impl<B> Drop for ReleaseTracked<B> {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl<B: Body + Unpin> Body for ReleaseTracked<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }
}
