//! Byte-range partitioning for chunked uploads and ranged downloads

use crate::error::{RemoteError, Result};
use std::fmt;

/// A contiguous, non-empty span of an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Offset of the first byte
    pub start: u64,
    /// Number of bytes in the span
    pub len: u64,
}

impl ByteRange {
    /// Create a range from its start offset and length
    #[must_use]
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Offset one past the last byte
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Offset of the last byte (inclusive, as used by HTTP `Range`)
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.end() - 1
    }

    /// Value for an HTTP `Range` request header
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.last())
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.last())
    }
}

/// Split `[0, total)` into at most `parts` contiguous ranges of
/// `ceil(total / parts)` bytes, the last one truncated to `total`.
///
/// Ranges that would be empty are not returned, so a zero-length input
/// yields no ranges and small inputs may yield fewer than `parts`.
#[must_use]
pub fn partition(total: u64, parts: usize) -> Vec<ByteRange> {
    let parts = parts.max(1) as u64;
    let segment = total.div_ceil(parts);
    if segment == 0 {
        return Vec::new();
    }

    let mut ranges = Vec::with_capacity(parts as usize);
    let mut start = 0;
    while start < total {
        let len = segment.min(total - start);
        ranges.push(ByteRange::new(start, len));
        start += len;
    }
    ranges
}

/// Extract the total length from a `Content-Range` header
/// (`bytes <first>-<last>/<total>`)
pub fn parse_content_range_total(header: &str) -> Result<u64> {
    let invalid = || RemoteError::InvalidContentRange {
        header: header.to_string(),
    };

    let spec = header.trim().strip_prefix("bytes").ok_or_else(invalid)?.trim_start();
    let (span, total) = spec.split_once('/').ok_or_else(invalid)?;
    let (first, last) = span.split_once('-').ok_or_else(invalid)?;
    if first.parse::<u64>().is_err() || last.parse::<u64>().is_err() {
        return Err(invalid());
    }
    total.parse::<u64>().map_err(|_| invalid())
}
