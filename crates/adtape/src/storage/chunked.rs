//! Segmented, address-stable storage for tape data.
//!
//! A [`ChunkedStore`] is a chain of fixed-capacity segments. A segment is
//! allocated once with its full capacity and is never grown, so an item
//! never moves after it was pushed. Growth appends a new segment; `reset_to`
//! truncates and keeps the emptied segments around for the next recording.
//!
//! Items reserved together are always placed in one segment, so every
//! statement's arguments can be handed out as a contiguous slice.

use crate::error::TapeError;
use log::debug;
use std::mem::size_of;

/// Location inside a [`ChunkedStore`]: segment index plus offset.
///
/// Positions handed out by a store are canonical: an offset of `0` only
/// occurs in the first segment, so "end of segment `c`" and "start of
/// segment `c + 1`" have a single representation and compare correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkPosition {
    chunk: usize,
    offset: usize,
}

impl ChunkPosition {
    /// Create a position from its parts.
    pub const fn new(chunk: usize, offset: usize) -> Self {
        Self { chunk, offset }
    }

    /// Segment index.
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Offset inside the segment.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Byte ceiling shared by all stores of one tape.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBudget {
    limit: Option<usize>,
    used: usize,
}

impl MemoryBudget {
    /// Create a budget; `None` means unlimited.
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, used: 0 }
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Configured ceiling.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn charge(&mut self, bytes: usize) -> Result<(), TapeError> {
        let requested = self.used + bytes;
        if let Some(limit) = self.limit {
            if requested > limit {
                return Err(TapeError::OutOfTapeMemory { requested, limit });
            }
        }
        self.used = requested;
        Ok(())
    }

    fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }
}

/// Growable, checkpointable store made of fixed-size segments.
#[derive(Debug)]
pub struct ChunkedStore<T> {
    /// Segments; each has capacity `chunk_size` and is never reallocated.
    chunks: Vec<Vec<T>>,
    /// Segment receiving pushes. Segments after it are pooled (empty).
    current: usize,
    chunk_size: usize,
    name: &'static str,
}

impl<T> ChunkedStore<T> {
    /// Create an empty store. No memory is allocated until the first reserve.
    pub fn new(name: &'static str, chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            current: 0,
            chunk_size: chunk_size.max(1),
            name,
        }
    }

    /// Items per segment.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of allocated segments, pooled ones included.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes allocated by all segments.
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.len() * self.chunk_bytes()
    }

    fn chunk_bytes(&self) -> usize {
        self.chunk_size * size_of::<T>()
    }

    /// Total number of stored items.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Check whether no item is stored.
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Vec::is_empty)
    }

    /// Make room for `n` contiguous items.
    ///
    /// Either the active segment has room, or the next segment (pooled or
    /// freshly allocated) becomes active. Pushing up to `n` items afterwards
    /// never fails and never moves existing items.
    pub fn reserve(&mut self, n: usize, budget: &mut MemoryBudget) -> Result<(), TapeError> {
        if n > self.chunk_size {
            return Err(TapeError::StatementTooLarge {
                arguments: n,
                max: self.chunk_size,
            });
        }
        if self.chunks.is_empty() {
            self.allocate(budget)?;
            return Ok(());
        }
        if self.chunks[self.current].len() + n <= self.chunk_size {
            return Ok(());
        }
        if self.current + 1 < self.chunks.len() {
            debug!("{}: reusing pooled segment {}", self.name, self.current + 1);
            self.current += 1;
        } else {
            self.allocate(budget)?;
            self.current = self.chunks.len() - 1;
        }
        Ok(())
    }

    fn allocate(&mut self, budget: &mut MemoryBudget) -> Result<(), TapeError> {
        budget.charge(self.chunk_bytes())?;
        debug!(
            "{}: allocating segment {} ({} items)",
            self.name,
            self.chunks.len(),
            self.chunk_size
        );
        self.chunks.push(Vec::with_capacity(self.chunk_size));
        Ok(())
    }

    /// Append one item. Callers reserve room first.
    pub fn push(&mut self, item: T) {
        let chunk = &mut self.chunks[self.current];
        debug_assert!(chunk.len() < self.chunk_size, "push without reserve");
        chunk.push(item);
    }

    /// Append items from an iterator. Callers reserve room first.
    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.push(item);
        }
    }

    /// Canonical position after the last stored item.
    pub fn position(&self) -> ChunkPosition {
        if self.chunks.is_empty() {
            return ChunkPosition::default();
        }
        self.canonical(ChunkPosition::new(self.current, self.chunks[self.current].len()))
    }

    /// Position before any item.
    pub fn zero_position(&self) -> ChunkPosition {
        ChunkPosition::default()
    }

    fn canonical(&self, mut pos: ChunkPosition) -> ChunkPosition {
        while pos.offset == 0 && pos.chunk > 0 {
            pos.chunk -= 1;
            pos.offset = self.chunks[pos.chunk].len();
        }
        pos
    }

    /// Move `pos` forward to the segment holding the next item.
    fn forward_normalize(&self, mut pos: ChunkPosition) -> ChunkPosition {
        while pos.chunk + 1 < self.chunks.len() && pos.offset >= self.chunks[pos.chunk].len() {
            pos.chunk += 1;
            pos.offset = 0;
        }
        pos
    }

    /// Check that `pos` addresses a point inside the stored data.
    pub fn contains(&self, pos: ChunkPosition) -> bool {
        if self.chunks.is_empty() {
            return pos == ChunkPosition::default();
        }
        pos.chunk < self.chunks.len() && pos.offset <= self.chunks[pos.chunk].len()
    }

    /// Step back over one item and return it together with its position.
    pub fn prev(&self, pos: &mut ChunkPosition) -> &T {
        let at = self.canonical(*pos);
        let item_pos = ChunkPosition::new(at.chunk, at.offset - 1);
        *pos = self.canonical(item_pos);
        &self.chunks[item_pos.chunk][item_pos.offset]
    }

    /// Position of the item before `pos`, for in-place updates.
    pub fn prev_position(&self, pos: &mut ChunkPosition) -> ChunkPosition {
        let at = self.canonical(*pos);
        let item_pos = ChunkPosition::new(at.chunk, at.offset - 1);
        *pos = self.canonical(item_pos);
        item_pos
    }

    /// Position of the item at `pos` moving forward, then advance past it.
    pub fn next_position(&self, pos: &mut ChunkPosition) -> ChunkPosition {
        let at = self.forward_normalize(*pos);
        *pos = ChunkPosition::new(at.chunk, at.offset + 1);
        at
    }

    /// The `n` items before `pos`; moves `pos` back over them.
    pub fn slice_before(&self, pos: &mut ChunkPosition, n: usize) -> &[T] {
        if n == 0 {
            return &[];
        }
        let at = self.canonical(*pos);
        let start = at.offset - n;
        *pos = self.canonical(ChunkPosition::new(at.chunk, start));
        &self.chunks[at.chunk][start..at.offset]
    }

    /// The `n` items starting at `pos`; moves `pos` past them.
    pub fn slice_after(&self, pos: &mut ChunkPosition, n: usize) -> &[T] {
        if n == 0 {
            return &[];
        }
        let at = self.forward_normalize(*pos);
        let end = at.offset + n;
        *pos = ChunkPosition::new(at.chunk, end);
        &self.chunks[at.chunk][at.offset..end]
    }

    /// Item stored at `pos`.
    pub fn get(&self, pos: ChunkPosition) -> Option<&T> {
        self.chunks.get(pos.chunk)?.get(pos.offset)
    }

    /// Mutable item stored at `pos`.
    pub fn get_mut(&mut self, pos: ChunkPosition) -> Option<&mut T> {
        self.chunks.get_mut(pos.chunk)?.get_mut(pos.offset)
    }

    /// Iterate over all items in push order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }

    /// Iterate mutably over all items in push order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.chunks.iter_mut().flat_map(|chunk| chunk.iter_mut())
    }

    /// Discard every item after `pos`, newest first, handing each to `discard`.
    ///
    /// Emptied segments stay allocated and are reused by later reserves.
    pub fn reset_to_with(&mut self, pos: ChunkPosition, mut discard: impl FnMut(T)) {
        if self.chunks.is_empty() {
            return;
        }
        let pos = self.canonical(pos);
        for chunk in (pos.chunk + 1..self.chunks.len()).rev() {
            while let Some(item) = self.chunks[chunk].pop() {
                discard(item);
            }
        }
        let chunk = &mut self.chunks[pos.chunk];
        while chunk.len() > pos.offset {
            if let Some(item) = chunk.pop() {
                discard(item);
            }
        }
        self.current = pos.chunk;
    }

    /// Discard every item after `pos`.
    pub fn reset_to(&mut self, pos: ChunkPosition) {
        self.reset_to_with(pos, drop);
    }

    /// Discard everything, keeping segments pooled.
    pub fn reset_with(&mut self, discard: impl FnMut(T)) {
        self.reset_to_with(ChunkPosition::default(), discard);
    }

    /// Release pooled segments after the active one.
    pub fn shrink(&mut self, budget: &mut MemoryBudget) {
        let keep = if self.chunks.is_empty() { 0 } else { self.current + 1 };
        let released = self.chunks.len().saturating_sub(keep);
        if released > 0 {
            debug!("{}: releasing {} pooled segments", self.name, released);
            self.chunks.truncate(keep);
            budget.release(released * self.chunk_bytes());
        }
    }
}

impl<T: Clone> ChunkedStore<T> {
    /// Append a slice. Callers reserve room first.
    pub fn extend_from_slice(&mut self, items: &[T]) {
        let chunk = &mut self.chunks[self.current];
        debug_assert!(chunk.len() + items.len() <= self.chunk_size, "push without reserve");
        chunk.extend_from_slice(items);
    }
}
