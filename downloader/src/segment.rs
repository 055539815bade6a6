//! Byte-range planning for segmented transfers.

/// A contiguous byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inclusive last byte, as used by the `Range` header.
    pub fn last_byte(&self) -> u64 {
        self.end.saturating_sub(1)
    }

    /// `Range` header value: `bytes=start-(end-1)`.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.last_byte())
    }
}

/// Upper bound on concurrent segments for one transfer. Each segment holds its
/// own connection and file handle.
pub const MAX_PARTS: usize = 32;

/// Number of segments actually used: never more segments than bytes or
/// `MAX_PARTS`, never zero for a non-empty transfer.
pub fn effective_parts(total_size: u64, part_count: usize) -> usize {
    if total_size == 0 {
        return 0;
    }
    (part_count.clamp(1, MAX_PARTS) as u64).min(total_size) as usize
}

/// Split `[0, total_size)` into contiguous, non-overlapping ranges.
///
/// Every range is `total_size / parts` long except the last, which absorbs the
/// remainder of the integer division. Returns an empty plan for an empty transfer.
pub fn plan_ranges(total_size: u64, part_count: usize) -> Vec<ByteRange> {
    let parts = effective_parts(total_size, part_count) as u64;
    if parts == 0 {
        return Vec::new();
    }

    let part_size = total_size / parts;
    (0..parts)
        .map(|i| {
            let start = i * part_size;
            let end = if i == parts - 1 { total_size } else { start + part_size };
            ByteRange { start, end }
        })
        .collect()
}
