#![forbid(unsafe_code)]

/// A span of reusable bytes in slab space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunk {
    /// First ref covered by the span.
    pub start: u64,
    /// Span length in bytes.
    pub len: usize,
}

impl Chunk {
    /// Creates a span.
    pub fn new(start: u64, len: usize) -> Self {
        Self { start, len }
    }

    /// One past the last ref covered.
    pub fn end(&self) -> u64 {
        self.start + self.len as u64
    }

    /// Extends `self` by `other` when `other` starts where `self` ends.
    pub fn coalesce_with(&mut self, other: &Chunk) -> bool {
        if self.end() == other.start {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

/// Outcome of returning a span to the list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Release {
    /// Stored as a new entry.
    Added,
    /// Absorbed into at least one neighbouring entry.
    Merged,
}

/// First-fit free list with neighbour coalescing.
///
/// Entries never span a slab boundary, and two entries inside the same slab
/// are never adjacent: every release merges with both neighbours when the
/// shared edge is not a boundary.
#[derive(Clone, Default, Debug)]
pub struct FreeList {
    chunks: Vec<Chunk>,
}

impl FreeList {
    /// Builds a list from existing spans without merging them.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    /// Entries in list order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true when no space is free.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total free bytes.
    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.len).sum()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Appends a span without looking for neighbours.
    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    /// Carves `size` bytes off the front of the first entry large enough.
    pub fn take_first_fit(&mut self, size: usize) -> Option<u64> {
        let pos = self.chunks.iter().position(|c| c.len >= size)?;
        let chunk = &mut self.chunks[pos];
        let start = chunk.start;
        if chunk.len == size {
            self.chunks.remove(pos);
        } else {
            chunk.start += size as u64;
            chunk.len -= size;
        }
        Some(start)
    }

    /// Returns a span, merging with neighbours unless the shared edge is a
    /// slab boundary according to `is_boundary`.
    pub fn release(&mut self, chunk: Chunk, is_boundary: impl Fn(u64) -> bool) -> Release {
        let mut chunk = chunk;
        let mut merged = false;
        if !is_boundary(chunk.end()) {
            if let Some(pos) = self.chunks.iter().position(|c| c.start == chunk.end()) {
                let next = self.chunks.remove(pos);
                merged = chunk.coalesce_with(&next);
            }
        }
        if !is_boundary(chunk.start) {
            if let Some(prev) = self.chunks.iter_mut().find(|c| c.end() == chunk.start) {
                prev.coalesce_with(&chunk);
                return Release::Merged;
            }
        }
        self.chunks.push(chunk);
        if merged {
            Release::Merged
        } else {
            Release::Added
        }
    }

    /// Returns true if some entry overlaps `[start, start + len)`.
    pub fn overlaps(&self, start: u64, len: usize) -> bool {
        let end = start + len as u64;
        self.chunks.iter().any(|c| c.start < end && start < c.end())
    }
}
