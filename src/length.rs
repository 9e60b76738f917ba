//! Length enforcement for re-streamed bodies.
//!
//! A body rebuilt by the splice strategy no longer carries the upstream's
//! framing, so the upstream `content-length` is re-applied here: exactly
//! that many bytes are forwarded, a short stream fails, and anything past
//! the declared count is dropped.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_LENGTH;
use http_body::{Body, Frame, SizeHint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};

/// Read the declared body length from `headers`.
///
/// # Errors
///
/// With `missing_as_zero == false`:
/// - `MissingContentLength` if the header is absent.
/// - `InvalidContentLength` if it is not a non-negative integer.
///
/// With `missing_as_zero == true` both cases yield `Ok(0)`.
pub fn declared_length(headers: &HeaderMap, missing_as_zero: bool) -> RelayResult<u64> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return if missing_as_zero {
            Ok(0)
        } else {
            Err(RelayError::MissingContentLength)
        };
    };

    let parsed = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok());

    match parsed {
        Some(len) => Ok(len),
        None if missing_as_zero => Ok(0),
        None => Err(RelayError::InvalidContentLength(
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )),
    }
}

/// Body wrapper that forwards exactly `declared` bytes.
///
/// - Inner stream ends early: yields `RelayError::ShortBody`.
/// - Inner stream runs long: the crossing frame is truncated, one warning
///   is logged, and the inner body is released.
/// - Once `declared` bytes have passed, the inner body is released without
///   being polled again.
/// - Inner stream ends early because the attached cancellation token fired:
///   the body ends without an error. The peer still sees a short transfer.
pub struct FixedLengthBody<B> {
    inner: Option<B>,
    declared: u64,
    received: u64,
    cancel_token: Option<CancellationToken>,
}

impl<B> FixedLengthBody<B> {
    pub fn new(inner: B, declared: u64) -> Self {
        Self {
            inner: Some(inner),
            declared,
            received: 0,
            cancel_token: None,
        }
    }

    /// Treat an early end as cancellation, not a short body, once `token`
    /// has fired.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn declared(&self) -> u64 {
        self.declared
    }

    /// Bytes forwarded so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl<B> Body for FixedLengthBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<RelayError>,
{
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.received >= this.declared {
            this.inner = None;
            return Poll::Ready(None);
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(Pin::new(inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                let mut data = match frame.into_data() {
                    Ok(data) => data,
                    Err(frame) => return Poll::Ready(Some(Ok(frame))),
                };
                let remaining = this.declared - this.received;
                if data.len() as u64 > remaining {
                    warn!(
                        declared = this.declared,
                        excess = data.len() as u64 - remaining,
                        "Body exceeds declared length, truncating"
                    );
                    // remaining < data.len() so it fits in usize
                    data.truncate(remaining as usize);
                    this.inner = None;
                }
                this.received += data.len() as u64;
                Poll::Ready(Some(Ok(Frame::data(data))))
            }
            Some(Err(err)) => {
                this.inner = None;
                Poll::Ready(Some(Err(err.into())))
            }
            None => {
                this.inner = None;
                if this
                    .cancel_token
                    .as_ref()
                    .is_some_and(CancellationToken::is_cancelled)
                {
                    debug!(
                        declared = this.declared,
                        received = this.received,
                        "Body cancelled before declared length"
                    );
                    return Poll::Ready(None);
                }
                warn!(
                    declared = this.declared,
                    received = this.received,
                    "Body ended before declared length"
                );
                Poll::Ready(Some(Err(RelayError::ShortBody {
                    declared: this.declared,
                    received: this.received,
                })))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.received >= self.declared
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.declared.saturating_sub(self.received))
    }
}
