//! Per-session window cache.
//!
//! Holds the byte spans already pulled from an origin as a sorted list of
//! disjoint windows. Overlapping or adjacent inserts are merged, so a parser
//! that asks for bytes next to (or inside) what it already has never causes a
//! second round trip for the part that is resident.

use tracing::trace;

/// A half-open byte range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteSpan {
    pub offset: u64,
    pub len: u64,
}

impl ByteSpan {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Span from `start` up to (not including) `end`.
    pub fn between(start: u64, end: u64) -> Self {
        Self {
            offset: start,
            len: end.saturating_sub(start),
        }
    }

    /// Exclusive end offset. Saturates so hostile offsets cannot wrap.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A contiguous run of resident bytes.
#[derive(Debug)]
struct Window {
    offset: u64,
    bytes: Vec<u8>,
}

impl Window {
    fn end(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}

/// Sorted, disjoint, non-adjacent windows of one origin.
///
/// The cache knows the origin's total size so parsers can clip their
/// read-ahead, but it never performs I/O itself: the session asks it which
/// part of a request is [`missing`](WindowCache::missing), fetches exactly
/// that, and hands the bytes back through [`insert`](WindowCache::insert).
#[derive(Debug)]
pub struct WindowCache {
    size: u64,
    windows: Vec<Window>,
}

impl WindowCache {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            windows: Vec::new(),
        }
    }

    /// Total size of the origin in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of bytes currently resident.
    pub fn held_bytes(&self) -> u64 {
        self.windows.iter().map(|w| w.bytes.len() as u64).sum()
    }

    /// Number of disjoint windows currently held.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Index of the window containing `pos`, if any.
    fn window_at(&self, pos: u64) -> Option<usize> {
        // First window whose end is past `pos`.
        let idx = self.windows.partition_point(|w| w.end() <= pos);
        match self.windows.get(idx) {
            Some(w) if w.offset <= pos => Some(idx),
            _ => None,
        }
    }

    /// Borrow `len` resident bytes at `offset`, or `None` if any of them is missing.
    ///
    /// Because adjacent windows are always merged, a fully resident span is
    /// always contained in a single window.
    pub fn get(&self, offset: u64, len: u64) -> Option<&[u8]> {
        if len == 0 {
            return Some(&[]);
        }
        let end = offset.checked_add(len)?;
        let w = &self.windows[self.window_at(offset)?];
        if end > w.end() {
            return None;
        }
        let start = (offset - w.offset) as usize;
        Some(&w.bytes[start..start + len as usize])
    }

    /// Smallest single span covering every non-resident byte of `span`.
    ///
    /// Resident bytes at either edge are trimmed; resident islands in the
    /// middle are re-fetched rather than splitting the request in two.
    pub fn missing(&self, span: ByteSpan) -> Option<ByteSpan> {
        if span.is_empty() {
            return None;
        }
        let end = span.end();

        let mut start = span.offset;
        while let Some(idx) = self.window_at(start) {
            start = self.windows[idx].end();
            if start >= end {
                return None;
            }
        }

        let mut stop = end;
        while let Some(idx) = self.window_at(stop - 1) {
            stop = self.windows[idx].offset;
            if stop <= start {
                break;
            }
        }

        Some(ByteSpan::between(start, stop.max(start + 1)))
    }

    /// Store freshly fetched bytes, merging with any overlapping or adjacent window.
    pub fn insert(&mut self, offset: u64, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let end = offset + bytes.len() as u64;

        // Windows [first, last) touch the new span (overlap or adjacency).
        let first = self.windows.partition_point(|w| w.end() < offset);
        let last = self.windows.partition_point(|w| w.offset <= end);

        if first == last {
            self.windows.insert(first, Window { offset, bytes });
            return;
        }

        let merged_start = offset.min(self.windows[first].offset);
        let merged_end = end.max(self.windows[last - 1].end());
        let mut merged = vec![0u8; (merged_end - merged_start) as usize];

        for w in self.windows.drain(first..last) {
            let at = (w.offset - merged_start) as usize;
            merged[at..at + w.bytes.len()].copy_from_slice(&w.bytes);
        }
        let at = (offset - merged_start) as usize;
        merged[at..at + bytes.len()].copy_from_slice(&bytes);

        trace!(
            offset = merged_start,
            len = merged.len(),
            "merged windows"
        );
        self.windows.insert(
            first,
            Window {
                offset: merged_start,
                bytes: merged,
            },
        );
    }
}
