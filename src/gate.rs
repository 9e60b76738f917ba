//! Inspection gate: decide whether a body prefix is small enough to log.
//!
//! The decision looks at length and end-of-stream only, never at content.
//! Whatever the outcome, the prefix bytes still flow downstream.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::reader::Fill;

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The prefix is the whole body, or fits within the threshold.
    Inspectable,
    /// More than `threshold` bytes and the source has not ended.
    TooLarge,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Inspectable => "inspectable",
            Classification::TooLarge => "too_large",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a prefix by its length and the end-of-stream flag.
pub fn classify(prefix: &[u8], is_end: bool, threshold: usize) -> Classification {
    if is_end || prefix.len() <= threshold {
        Classification::Inspectable
    } else {
        Classification::TooLarge
    }
}

/// Logging collaborator that receives inspectable prefixes.
///
/// `record` is fire-and-forget: it runs on the response path and must not
/// block. `whole_body` is true when the source ended inside the prefix.
pub trait InspectionSink: Send + Sync {
    fn record(&self, prefix: Bytes, whole_body: bool);
}

/// Classify `fill` and, when inspectable, hand a handle to its bytes to `sink`.
pub fn inspect(fill: &Fill, threshold: usize, sink: &dyn InspectionSink) -> Classification {
    let classification = classify(&fill.chunk, fill.is_end, threshold);
    debug!(
        prefix_len = fill.len(),
        is_end = fill.is_end,
        threshold,
        classification = %classification,
        "Prefix classified"
    );
    if classification == Classification::Inspectable {
        sink.record(fill.chunk.clone(), fill.is_end);
    }
    classification
}

/// Default sink: emits the prefix as a tracing event.
#[derive(Debug, Clone)]
pub struct TracingSink {
    preview_limit: usize,
}

impl TracingSink {
    pub fn new(preview_limit: usize) -> Self {
        Self { preview_limit }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InspectionSink for TracingSink {
    fn record(&self, prefix: Bytes, whole_body: bool) {
        let shown = prefix.len().min(self.preview_limit);
        let preview = String::from_utf8_lossy(&prefix[..shown]);
        info!(
            prefix_len = prefix.len(),
            whole_body,
            truncated_preview = shown < prefix.len(),
            preview = %preview,
            "Inspected body prefix"
        );
    }
}

/// Sink that forwards prefixes to an async consumer over an unbounded channel.
///
/// A dropped receiver is not an error; records are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<InspectedPrefix>,
}

/// Message delivered by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedPrefix {
    pub bytes: Bytes,
    pub whole_body: bool,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InspectedPrefix>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl InspectionSink for ChannelSink {
    fn record(&self, prefix: Bytes, whole_body: bool) {
        if self
            .tx
            .send(InspectedPrefix {
                bytes: prefix,
                whole_body,
            })
            .is_err()
        {
            debug!("Inspection receiver closed, dropping prefix");
        }
    }
}
