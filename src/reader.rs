//! Minimum-fill reads over a [`ByteSource`].
//!
//! A single read against a streaming body may return as little as one byte.
//! [`MinFillReader::read`] keeps reading into the caller's buffer until at
//! least `min_bytes` have arrived or the source ends, so a prefix decision is
//! never made on an arbitrarily small first frame.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::{RelayError, RelayResult};
use crate::source::ByteSource;

/// Result of a minimum-fill read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    /// Bytes gathered, in source order.
    pub chunk: Bytes,
    /// The source reached end-of-stream during this read.
    pub is_end: bool,
}

impl Fill {
    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }
}

/// Reader that coalesces low-level reads until a minimum is met.
///
/// Errors from the source are returned as-is without retry; releasing the
/// source afterwards is the caller's job.
pub struct MinFillReader<'a> {
    source: &'a mut ByteSource,
}

impl<'a> MinFillReader<'a> {
    pub fn new(source: &'a mut ByteSource) -> Self {
        Self { source }
    }

    /// Fill `buf` (up to its capacity) until it holds at least `min_bytes`
    /// or the source ends.
    ///
    /// Returns with `chunk.len() >= min_bytes` and `is_end == false`, or with
    /// `is_end == true` and every remaining byte of the source.
    ///
    /// # Errors
    ///
    /// - `InvalidReadRequest` if `min_bytes` exceeds the buffer capacity.
    /// - `SourceRead` (or the source's own error) if a read fails.
    pub async fn read(&mut self, mut buf: BytesMut, min_bytes: usize) -> RelayResult<Fill> {
        let capacity = buf.capacity();
        if min_bytes > capacity {
            return Err(RelayError::InvalidReadRequest {
                min_bytes,
                capacity,
            });
        }

        buf.clear();
        buf.resize(capacity, 0);

        let mut filled = 0;
        let mut is_end = false;
        let mut reads = 0u32;

        while filled < min_bytes {
            let n = self.source.read_into(&mut buf[filled..]).await?;
            reads += 1;
            if n == 0 {
                is_end = true;
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        trace!(
            source = self.source.label(),
            filled,
            min_bytes,
            reads,
            is_end,
            "Minimum-fill read complete"
        );

        Ok(Fill {
            chunk: buf.freeze(),
            is_end,
        })
    }
}
