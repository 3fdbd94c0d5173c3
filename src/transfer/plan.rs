use super::error::{Result, TransferError};

/// Maximum number of parts in one multipart upload (S3 and COS limit)
pub const MAX_PARTS: u64 = 10_000;

/// One byte range of a transfer. `end` is inclusive, matching the HTTP
/// `Range` header convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// Only a range with `end < start` is empty; `start == end` is one byte
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Render as an HTTP range header value, e.g. `bytes=0-1023`
    pub fn header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// The part of this range that starts at `from`, or `None` if `from` is past the end
    pub fn remainder(&self, from: u64) -> Option<ChunkRange> {
        (from >= self.start && from <= self.end).then_some(ChunkRange {
            start: from,
            end: self.end,
        })
    }
}

/// Lazy iterator over the ranges of `[start, total_size)`
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    next: u64,
    total_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64, start: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidRequest(
                "chunk size must be positive".to_string(),
            ));
        }
        if start > total_size {
            return Err(TransferError::InvalidRequest(format!(
                "start offset {} is beyond total size {}",
                start, total_size
            )));
        }
        Ok(Self {
            next: start,
            total_size,
            chunk_size,
        })
    }
}

impl Iterator for ChunkPlan {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        if self.next >= self.total_size {
            return None;
        }
        let start = self.next;
        let end = start.saturating_add(self.chunk_size).min(self.total_size) - 1;
        self.next = end + 1;
        Some(ChunkRange { start, end })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total_size - self.next.min(self.total_size)).div_ceil(self.chunk_size);
        let n = usize::try_from(remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

/// Plan the ranges covering `[start, total_size)` in order.
///
/// Every range is `chunk_size` long except possibly the last one. An empty
/// plan means there is nothing left to transfer.
pub fn plan(total_size: u64, chunk_size: u64, start: u64) -> Result<Vec<ChunkRange>> {
    Ok(ChunkPlan::new(total_size, chunk_size, start)?.collect())
}

/// Number of parts needed to upload `total_size` bytes
pub fn part_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}
