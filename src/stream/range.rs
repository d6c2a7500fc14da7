//! Range parsing and chunk alignment
//!
//! The pure half of the range engine: translating an HTTP `Range` header
//! into an inclusive byte window, and aligning that window to the
//! upstream's fixed 1 MiB chunk protocol.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// `bytes=S-E` with either side optionally empty. Anything that does not
/// match this shape in full (multi-range lists included) is malformed.
static RANGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^bytes=(\d*)-(\d*)$").expect("range regex"));

/// Inclusive byte window within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset, `0 <= start <= end`.
    pub start: u64,
    /// Last byte offset, `end <= file_size - 1`.
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes in the window.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a window holds at least one byte by construction.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether the window covers the whole file.
    ///
    /// A resolved full-range request is served as a plain `200`, not `206`.
    pub fn is_full(&self, file_size: u64) -> bool {
        self.start == 0 && self.end == file_size.saturating_sub(1)
    }
}

/// Range header rejection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RangeError {
    /// Syntactically malformed header (HTTP 400).
    #[error("invalid range header: {0}")]
    Invalid(String),
    /// Well-formed but outside the file (HTTP 416).
    #[error("unsatisfiable range for file of {size} bytes")]
    Unsatisfiable {
        /// File size echoed in `Content-Range: bytes */<size>`.
        size: u64,
    },
}

/// Parse a `Range` header against a known file size.
///
/// - no header: the whole file
/// - `bytes=S-E`: `[S, E]`
/// - `bytes=S-`: `[S, size-1]`
/// - `bytes=-N` with `N > 0`: the last `N` bytes
/// - `bytes=-0`, or a window outside the file: unsatisfiable
/// - anything else: invalid
pub fn parse_range(header: Option<&str>, file_size: u64) -> Result<ByteRange, RangeError> {
    let header = match header {
        None | Some("") => {
            return Ok(ByteRange {
                start: 0,
                end: file_size.saturating_sub(1),
            })
        }
        Some(h) => h,
    };

    let captures = RANGE_REGEX
        .captures(header)
        .ok_or_else(|| RangeError::Invalid(header.to_string()))?;
    let start_str = captures.get(1).map(|m| m.as_str()).unwrap_or("");
    let end_str = captures.get(2).map(|m| m.as_str()).unwrap_or("");

    let (start, end) = if !start_str.is_empty() {
        let start: u64 = start_str
            .parse()
            .map_err(|_| RangeError::Invalid(header.to_string()))?;
        let end = if end_str.is_empty() {
            file_size.saturating_sub(1)
        } else {
            end_str
                .parse()
                .map_err(|_| RangeError::Invalid(header.to_string()))?
        };
        (start, end)
    } else {
        if end_str.is_empty() {
            return Err(RangeError::Invalid(header.to_string()));
        }
        let suffix_len: u64 = end_str
            .parse()
            .map_err(|_| RangeError::Invalid(header.to_string()))?;
        if suffix_len == 0 {
            return Err(RangeError::Unsatisfiable { size: file_size });
        }
        (
            file_size.saturating_sub(suffix_len),
            file_size.saturating_sub(1),
        )
    };

    if end >= file_size || start > end {
        return Err(RangeError::Unsatisfiable { size: file_size });
    }
    Ok(ByteRange { start, end })
}

/// Value of the `Content-Range` header for a satisfied partial response.
pub fn content_range(range: ByteRange, file_size: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end, file_size)
}

/// Alignment of a byte window to the upstream chunk protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// First chunk to request, counted in chunks.
    pub chunk_offset: u64,
    /// Number of chunks to request. Overshoots by one so the final
    /// requested byte is always covered across chunk boundaries.
    pub chunk_limit: u64,
    /// Bytes to discard from the front of the first chunk.
    pub head_skip: u64,
}

/// Align `length` bytes starting at `start` to `chunk_size` frames.
pub fn chunk_align(start: u64, length: u64, chunk_size: u64) -> ChunkPlan {
    ChunkPlan {
        chunk_offset: start / chunk_size,
        chunk_limit: length.div_ceil(chunk_size) + 1,
        head_skip: start % chunk_size,
    }
}
