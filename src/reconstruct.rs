//! Rebuild a complete outgoing body after its prefix has been inspected.
//!
//! Reading the prefix consumes bytes from a one-shot source, so the
//! response body has to be put back together before it can be forwarded.
//! Two strategies are available:
//!
//! - [`Strategy::Duplicate`]: tee the source, read the prefix from the
//!   duplicate, release the duplicate, and forward the untouched primary.
//! - [`Strategy::Splice`]: read the prefix from the source itself, then emit
//!   the prefix followed by the rest of the source in bounded chunks.
//!
//! Both produce a [`RelayBody`] whose bytes equal the source's bytes.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::gate::{Classification, InspectionSink, inspect};
use crate::reader::{Fill, MinFillReader};
use crate::source::{ByteSource, CancelReason};

/// How the outgoing body is rebuilt around the inspected prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Duplicate-and-discard.
    Duplicate,
    /// Splice-and-continue.
    Splice,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Duplicate => "clone",
            Strategy::Splice => "stream",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clone" | "duplicate" => Ok(Strategy::Duplicate),
            "stream" | "splice" => Ok(Strategy::Splice),
            other => Err(format!("unknown relay strategy: {other}")),
        }
    }
}

/// A rebuilt body plus what was learned from its prefix.
#[derive(Debug)]
pub struct Relayed {
    pub body: RelayBody,
    pub strategy: Strategy,
    pub classification: Classification,
    /// Length of the prefix read used for classification.
    pub prefix_len: usize,
    /// The source ended inside the prefix read.
    pub prefix_is_end: bool,
}

/// Run `strategy` against `source` using the thresholds in `config`.
pub async fn relay(
    strategy: Strategy,
    source: ByteSource,
    config: &RelayConfig,
    sink: &dyn InspectionSink,
) -> RelayResult<Relayed> {
    match strategy {
        Strategy::Duplicate => duplicate_and_discard(source, config.inspect_threshold, sink).await,
        Strategy::Splice => {
            splice_and_continue(
                source,
                config.inspect_threshold,
                config.remainder_chunk_size,
                sink,
            )
            .await
        }
    }
}

/// Tee `source`, classify a prefix read from the duplicate, then forward the
/// primary unchanged.
///
/// # Errors
///
/// - `DuplicationTooLate` if `source` has already been read from.
/// - Any error from the prefix read. Both handles are released first.
pub async fn duplicate_and_discard(
    source: ByteSource,
    threshold: usize,
    sink: &dyn InspectionSink,
) -> RelayResult<Relayed> {
    let (primary, mut duplicate) = source.tee()?;

    let fill = match read_prefix(&mut duplicate, threshold).await {
        Ok(fill) => fill,
        Err(err) => {
            duplicate.cancel(CancelReason::new(format!("prefix read failed: {err}")));
            drop(primary);
            return Err(err);
        }
    };

    let classification = inspect(&fill, threshold, sink);

    // Frames the duplicate pulled stay queued for the primary; releasing it
    // only stops further queueing and never touches the shared upstream.
    duplicate.cancel(CancelReason::inspection_complete());

    info!(
        strategy = %Strategy::Duplicate,
        prefix_len = fill.len(),
        is_end = fill.is_end,
        classification = %classification,
        "Body prefix inspected"
    );

    Ok(Relayed {
        body: RelayBody::passthrough(primary),
        strategy: Strategy::Duplicate,
        classification,
        prefix_len: fill.len(),
        prefix_is_end: fill.is_end,
    })
}

/// Classify a prefix read from `source` itself, then emit that prefix
/// followed by the rest of `source` in reads of at most `chunk_size` bytes.
///
/// # Errors
///
/// Returns any error from the prefix read; `source` is released.
pub async fn splice_and_continue(
    mut source: ByteSource,
    threshold: usize,
    chunk_size: usize,
    sink: &dyn InspectionSink,
) -> RelayResult<Relayed> {
    let fill = read_prefix(&mut source, threshold).await?;
    let classification = inspect(&fill, threshold, sink);

    info!(
        strategy = %Strategy::Splice,
        prefix_len = fill.len(),
        is_end = fill.is_end,
        classification = %classification,
        "Body prefix inspected"
    );

    let prefix_len = fill.len();
    let prefix_is_end = fill.is_end;
    Ok(Relayed {
        body: RelayBody::spliced(SpliceBody::new(fill.chunk, source, chunk_size)),
        strategy: Strategy::Splice,
        classification,
        prefix_len,
        prefix_is_end,
    })
}

async fn read_prefix(source: &mut ByteSource, threshold: usize) -> RelayResult<Fill> {
    let size = threshold.saturating_add(1);
    MinFillReader::new(source)
        .read(BytesMut::with_capacity(size), size)
        .await
}

// ============================================================================
// SpliceBody
// ============================================================================

/// Body that yields an already-read prefix, then the remainder of a source.
///
/// The prefix is emitted exactly once, as the first frame, and is skipped
/// when empty. Remainder frames are at most `chunk_size` bytes.
pub struct SpliceBody {
    prefix: Option<Bytes>,
    source: ByteSource,
    chunk_size: usize,
}

impl SpliceBody {
    pub fn new(prefix: Bytes, source: ByteSource, chunk_size: usize) -> Self {
        Self {
            prefix: Some(prefix),
            source,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn source(&self) -> &ByteSource {
        &self.source
    }

    /// Stop the body and release the source with `reason`, unchanged.
    pub fn cancel(&mut self, reason: CancelReason) {
        self.prefix = None;
        self.source.cancel(reason);
    }
}

impl Drop for SpliceBody {
    fn drop(&mut self) {
        self.source.cancel(CancelReason::downstream_dropped());
    }
}

impl Body for SpliceBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(prefix) = this.prefix.take()
            && !prefix.is_empty()
        {
            return Poll::Ready(Some(Ok(Frame::data(prefix))));
        }

        this.source
            .poll_next_bytes(cx, this.chunk_size)
            .map(|result| result.map(|chunk| chunk.map(Frame::data)).transpose())
    }

    fn is_end_stream(&self) -> bool {
        self.prefix.as_ref().is_none_or(Bytes::is_empty) && self.source.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let prefix = self.prefix.as_ref().map_or(0, |p| p.len() as u64);
        let rest = self.source.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(rest.lower().saturating_add(prefix));
        if let Some(upper) = rest.upper() {
            hint.set_upper(upper.saturating_add(prefix));
        }
        hint
    }
}

// ============================================================================
// RelayBody
// ============================================================================

enum RelayInner {
    Passthrough(ByteSource),
    Spliced(SpliceBody),
}

/// Outgoing body produced by either strategy.
///
/// An attached [`CancellationToken`] is checked on every poll; once it fires
/// the body ends and the source is released as "downstream cancelled".
/// Dropping the body releases the source as "downstream dropped".
pub struct RelayBody {
    inner: RelayInner,
    cancel_token: Option<CancellationToken>,
}

impl RelayBody {
    pub fn passthrough(source: ByteSource) -> Self {
        Self {
            inner: RelayInner::Passthrough(source),
            cancel_token: None,
        }
    }

    pub fn spliced(body: SpliceBody) -> Self {
        Self {
            inner: RelayInner::Spliced(body),
            cancel_token: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// The source this body is reading from.
    pub fn source(&self) -> &ByteSource {
        match &self.inner {
            RelayInner::Passthrough(source) => source,
            RelayInner::Spliced(body) => body.source(),
        }
    }

    /// Release the source with `reason`. Further polls report end-of-stream.
    pub fn cancel(&mut self, reason: CancelReason) {
        match &mut self.inner {
            RelayInner::Passthrough(source) => source.cancel(reason),
            RelayInner::Spliced(body) => body.cancel(reason),
        }
    }
}

impl fmt::Debug for RelayBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            RelayInner::Passthrough(_) => "passthrough",
            RelayInner::Spliced(_) => "spliced",
        };
        f.debug_struct("RelayBody")
            .field("kind", &kind)
            .field("source", self.source())
            .finish()
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        self.cancel(CancelReason::downstream_dropped());
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this
            .cancel_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            if !this.source().is_cancelled() {
                debug!(
                    consumed = this.source().bytes_consumed(),
                    "Downstream cancelled, releasing source"
                );
            }
            this.cancel(CancelReason::downstream_cancelled());
            return Poll::Ready(None);
        }

        match &mut this.inner {
            RelayInner::Passthrough(source) => Pin::new(source).poll_frame(cx),
            RelayInner::Spliced(body) => Pin::new(body).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            RelayInner::Passthrough(source) => source.is_end_stream(),
            RelayInner::Spliced(body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            RelayInner::Passthrough(source) => source.size_hint(),
            RelayInner::Spliced(body) => body.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceState;
    use crate::test_bodies::{
        DropTracked, RecordingSink, chunked, failing_after, pattern, split_into,
    };
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;

    const THRESHOLD: usize = 10240;

    async fn collect(body: RelayBody) -> Vec<u8> {
        body.collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_splice_large_body_is_not_logged() {
        let data = pattern(10241);
        let source = ByteSource::new(chunked(split_into(&data, 1000)));
        let sink = RecordingSink::default();

        let relayed = splice_and_continue(source, THRESHOLD, 1 << 20, &sink)
            .await
            .unwrap();

        assert_eq!(relayed.classification, Classification::TooLarge);
        assert_eq!(relayed.prefix_len, 10241);
        assert!(!relayed.prefix_is_end);
        assert!(sink.records().is_empty());
        assert_eq!(collect(relayed.body).await, data);
    }

    #[tokio::test]
    async fn test_duplicate_small_body_is_logged() {
        let data = pattern(5000);
        let source = ByteSource::new(chunked(split_into(&data, 1500)));
        let sink = RecordingSink::default();

        let relayed = duplicate_and_discard(source, THRESHOLD, &sink).await.unwrap();

        assert_eq!(relayed.classification, Classification::Inspectable);
        assert_eq!(relayed.prefix_len, 5000);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].0[..], &data[..]);
        assert!(records[0].1);
        assert_eq!(collect(relayed.body).await, data);
    }

    #[tokio::test]
    async fn test_body_at_threshold_is_inspectable_for_both_strategies() {
        let data = pattern(THRESHOLD);
        for strategy in [Strategy::Duplicate, Strategy::Splice] {
            let source = ByteSource::new(chunked(split_into(&data, 4096)));
            let sink = RecordingSink::default();

            let relayed = relay(strategy, source, &RelayConfig::default(), &sink)
                .await
                .unwrap();

            assert_eq!(relayed.classification, Classification::Inspectable);
            assert!(relayed.prefix_is_end);
            assert_eq!(sink.records().len(), 1);
            assert_eq!(collect(relayed.body).await, data, "{strategy}");
        }
    }

    #[tokio::test]
    async fn test_duplicate_large_body_forwarded_whole() {
        let data = pattern(50_000);
        let (body, dropped) = DropTracked::new(chunked(split_into(&data, 3000)));
        let sink = RecordingSink::default();

        let relayed = duplicate_and_discard(ByteSource::new(body), THRESHOLD, &sink)
            .await
            .unwrap();

        assert_eq!(relayed.classification, Classification::TooLarge);
        assert!(sink.records().is_empty());
        assert!(!dropped.load(Ordering::SeqCst));
        assert_eq!(collect(relayed.body).await, data);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_splice_remainder_reads_are_bounded() {
        let data = pattern(200);
        let source = ByteSource::new(chunked(vec![Bytes::from(data.clone())]));
        let sink = RecordingSink::default();

        let relayed = splice_and_continue(source, 16, 10, &sink).await.unwrap();
        let mut body = relayed.body;

        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&first[..], &data[..17]);

        let mut out = first.to_vec();
        while let Some(frame) = body.frame().await {
            let chunk = frame.unwrap().into_data().unwrap();
            assert!(chunk.len() <= 10);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_splice_empty_body_emits_no_frames() {
        let sink = RecordingSink::default();
        let relayed = splice_and_continue(ByteSource::new(chunked(Vec::new())), THRESHOLD, 64, &sink)
            .await
            .unwrap();

        assert_eq!(relayed.classification, Classification::Inspectable);
        assert!(relayed.prefix_is_end);
        assert_eq!(sink.records(), vec![(Bytes::new(), true)]);

        let mut body = relayed.body;
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_splice_cancel_forwards_reason() {
        let data = pattern(30_000);
        let (inner, dropped) = DropTracked::new(chunked(split_into(&data, 4096)));
        let sink = RecordingSink::default();

        let relayed = splice_and_continue(ByteSource::new(inner), THRESHOLD, 1024, &sink)
            .await
            .unwrap();
        let mut body = relayed.body;
        body.frame().await.unwrap().unwrap();

        body.cancel(CancelReason::new("client abort"));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(
            body.source().cancel_reason().map(CancelReason::as_str),
            Some("client abort")
        );
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_token_releases_source() {
        let data = pattern(30_000);
        let (inner, dropped) = DropTracked::new(chunked(split_into(&data, 4096)));
        let sink = RecordingSink::default();
        let token = CancellationToken::new();

        let relayed = splice_and_continue(ByteSource::new(inner), THRESHOLD, 1024, &sink)
            .await
            .unwrap();
        let mut body = relayed.body.with_cancel_token(token.clone());

        body.frame().await.unwrap().unwrap();
        token.cancel();

        assert!(body.frame().await.is_none());
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(
            body.source().state(),
            &SourceState::Cancelled(CancelReason::downstream_cancelled())
        );
    }

    #[tokio::test]
    async fn test_dropping_body_releases_upstream() {
        let data = pattern(30_000);
        for strategy in [Strategy::Duplicate, Strategy::Splice] {
            let (inner, dropped) = DropTracked::new(chunked(split_into(&data, 4096)));
            let sink = RecordingSink::default();

            let relayed = relay(
                strategy,
                ByteSource::new(inner),
                &RelayConfig::default(),
                &sink,
            )
            .await
            .unwrap();
            assert!(!dropped.load(Ordering::SeqCst));

            drop(relayed);
            assert!(dropped.load(Ordering::SeqCst), "{strategy}");
        }
    }

    #[tokio::test]
    async fn test_prefix_read_failure_propagates() {
        for strategy in [Strategy::Duplicate, Strategy::Splice] {
            let source = ByteSource::new(failing_after(
                vec![Bytes::from_static(b"partial")],
                "upstream reset",
            ));
            let sink = RecordingSink::default();

            let err = relay(strategy, source, &RelayConfig::default(), &sink)
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::SourceRead(_)), "{strategy}");
            assert!(sink.records().is_empty());
        }
    }

    #[tokio::test]
    async fn test_duplicate_on_read_source_is_rejected() {
        let mut source = ByteSource::new(chunked(vec![Bytes::from_static(b"abc")]));
        source.next_chunk(1).await.unwrap();
        let sink = RecordingSink::default();

        let err = duplicate_and_discard(source, THRESHOLD, &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DuplicationTooLate { consumed: 1 }));
    }

    #[test]
    fn test_strategy_parse_and_display() {
        assert_eq!("clone".parse::<Strategy>().unwrap(), Strategy::Duplicate);
        assert_eq!("STREAM".parse::<Strategy>().unwrap(), Strategy::Splice);
        assert_eq!("splice".parse::<Strategy>().unwrap(), Strategy::Splice);
        assert!("tee".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Duplicate.to_string(), "clone");
        assert_eq!(Strategy::Splice.to_string(), "stream");
    }
}
