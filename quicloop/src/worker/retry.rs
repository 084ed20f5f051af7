//! Send failure classification and chunked resend.
//!
//! A failed send is sorted into one of three buckets by its OS error:
//! - **Unreachable** (`ENETUNREACH`, `EHOSTUNREACH`, `EADDRNOTAVAIL`): the
//!   engine is told so it can abandon the path. No retry.
//! - **Too large** (`EIO` from a rejected GSO batch, or `EMSGSIZE` when the
//!   buffer held several segments): resend segment by segment.
//! - **Other**: logged, the loop carries on.

use nix::errno::Errno;
use std::io;
use std::ops::Range;

/// What to do about a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Unreachable,
    TooLarge,
    Other,
}

/// Classify a send error for a buffer of `len` bytes carrying segments of
/// `segment_size` bytes (0 when not segmented).
pub fn classify(err: &io::Error, len: usize, segment_size: usize) -> SendFailure {
    let Some(code) = err.raw_os_error() else {
        return SendFailure::Other;
    };
    match Errno::from_raw(code) {
        Errno::ENETUNREACH | Errno::EHOSTUNREACH | Errno::EADDRNOTAVAIL => {
            SendFailure::Unreachable
        }
        Errno::EIO if segment_size > 0 => SendFailure::TooLarge,
        Errno::EMSGSIZE if segment_size > 0 && segment_size < len => SendFailure::TooLarge,
        _ => SendFailure::Other,
    }
}

/// Byte ranges covering `0..len` in pieces of at most `segment_size`.
///
/// Yields `ceil(len / segment_size)` contiguous ranges; nothing when either
/// argument is zero.
pub fn chunks(len: usize, segment_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = if segment_size == 0 { len.max(1) } else { segment_size };
    let count = if segment_size == 0 || len == 0 {
        0
    } else {
        len.div_ceil(segment_size)
    };
    (0..count).map(move |i| {
        let start = i * step;
        start..(start + step).min(len)
    })
}

/// A chunk could not be sent.
#[derive(Debug)]
pub struct ChunkFailure {
    /// Bytes successfully resent before the failing chunk.
    pub offset: usize,
    pub chunk_len: usize,
    pub error: io::Error,
}

/// Resend `len` bytes in chunks of `segment_size`, stopping at the first
/// failing chunk.
///
/// `send` receives each chunk's byte range. Returns the number of chunks sent.
pub fn resend_in_chunks<F>(len: usize, segment_size: usize, mut send: F) -> Result<usize, ChunkFailure>
where
    F: FnMut(Range<usize>) -> io::Result<usize>,
{
    let mut sent = 0;
    for range in chunks(len, segment_size) {
        let offset = range.start;
        let chunk_len = range.len();
        match send(range) {
            Ok(n) if n > 0 => sent += 1,
            Ok(_) => {
                return Err(ChunkFailure {
                    offset,
                    chunk_len,
                    error: io::Error::new(io::ErrorKind::WriteZero, "chunk not sent"),
                })
            }
            Err(error) => {
                return Err(ChunkFailure {
                    offset,
                    chunk_len,
                    error,
                })
            }
        }
    }
    Ok(sent)
}
