//! # Arena Allocator
//!
//! A block-growing bump allocator for command payloads that are released all at
//! once when the owning list is reset.
//!
//! ```text
//! blocks: [ 4 KiB ][ 8 KiB ][ 16 KiB ] ...   (capped at MAX_BLOCK_SIZE)
//!            ^full   ^full    ^cursor
//! ```
//!
//! Allocation never fails from the caller's point of view: when the current block
//! is exhausted a new one is appended. Running out of real memory is left to the
//! global allocator, which aborts.

/// Default size of the first block.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Blocks stop doubling once they reach this size.
pub const MAX_BLOCK_SIZE: usize = 256 * 1024;

/// Location of an allocation inside an [`Arena`].
///
/// Spans are plain values. They are only meaningful for the arena that produced
/// them, and only until that arena is flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaSpan {
    block: u32,
    offset: u32,
    len: u32,
    generation: u32,
}

impl ArenaSpan {
    /// Length of the allocation in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true for zero-sized allocations.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A bump-pointer arena that grows by appending blocks.
///
/// # Thread Safety
///
/// The arena is owned by exactly one command list, which is touched by one thread
/// at a time. Mutation goes through `&mut self`.
///
/// # Example
///
/// ```rust,ignore
/// let mut arena = Arena::new();
/// let span = arena.copy_from_slice(b"vertex data");
/// assert_eq!(arena.bytes(span), b"vertex data");
/// arena.flush();
/// ```
#[derive(Debug)]
pub struct Arena {
    blocks: Vec<Box<[u8]>>,
    /// Index of the block currently being bumped.
    current: usize,
    /// Offset of the next free byte in the current block.
    cursor: usize,
    /// Bytes handed out since the last flush, padding included.
    used: usize,
    next_block_size: usize,
    first_block_size: usize,
    /// Bumped on every flush so stale spans are caught.
    generation: u32,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// Creates an arena with the default first block size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Creates an arena whose first block holds `block_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "arena block size must be non-zero");
        Self {
            blocks: vec![vec![0u8; block_size].into_boxed_slice()],
            current: 0,
            cursor: 0,
            used: 0,
            next_block_size: (block_size * 2).min(MAX_BLOCK_SIZE.max(block_size)),
            first_block_size: block_size,
            generation: 0,
        }
    }

    /// Bytes handed out since the last flush.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Total bytes reserved across all blocks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(|block| block.len()).sum()
    }

    /// Number of blocks currently held.
    #[inline]
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Reserves `size` bytes aligned to `align` relative to the block start.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes
    /// * `align` - Alignment, must be a power of two
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate(&mut self, size: usize, align: usize) -> ArenaSpan {
        assert!(align.is_power_of_two(), "arena alignment must be a power of two, got {align}");

        if size == 0 {
            return self.span(self.current, self.cursor, 0);
        }

        let aligned = align_up(self.cursor, align);
        if aligned + size <= self.blocks[self.current].len() {
            self.used += aligned - self.cursor + size;
            self.cursor = aligned + size;
            return self.span(self.current, aligned, size);
        }

        self.grow(size + align - 1);
        let aligned = align_up(self.cursor, align);
        self.used += aligned + size;
        self.cursor = aligned + size;
        self.span(self.current, aligned, size)
    }

    /// Copies `data` into the arena and returns its span.
    pub fn copy_from_slice(&mut self, data: &[u8]) -> ArenaSpan {
        let span = self.allocate(data.len(), 1);
        self.bytes_mut(span).copy_from_slice(data);
        span
    }

    /// Returns the bytes behind `span`.
    ///
    /// # Panics
    ///
    /// Panics if the span was produced before the last flush.
    #[must_use]
    pub fn bytes(&self, span: ArenaSpan) -> &[u8] {
        self.check_span(span);
        let start = span.offset as usize;
        &self.blocks[span.block as usize][start..start + span.len()]
    }

    /// Returns the bytes behind `span` mutably.
    ///
    /// # Panics
    ///
    /// Panics if the span was produced before the last flush.
    pub fn bytes_mut(&mut self, span: ArenaSpan) -> &mut [u8] {
        self.check_span(span);
        let start = span.offset as usize;
        &mut self.blocks[span.block as usize][start..start + span.len()]
    }

    /// Releases every block except the first and rewinds the cursor.
    ///
    /// All previously returned spans become invalid.
    pub fn flush(&mut self) {
        self.blocks.truncate(1);
        self.current = 0;
        self.cursor = 0;
        self.used = 0;
        self.next_block_size = (self.first_block_size * 2).min(MAX_BLOCK_SIZE.max(self.first_block_size));
        self.generation = self.generation.wrapping_add(1);
    }

    fn grow(&mut self, minimum: usize) {
        let size = self.next_block_size.max(minimum);
        // Oversized requests get a dedicated block and do not advance the growth curve.
        if size == self.next_block_size {
            self.next_block_size = (self.next_block_size * 2).min(MAX_BLOCK_SIZE);
        }
        self.blocks.push(vec![0u8; size].into_boxed_slice());
        self.current = self.blocks.len() - 1;
        self.cursor = 0;
    }

    fn span(&self, block: usize, offset: usize, len: usize) -> ArenaSpan {
        ArenaSpan {
            block: to_u32(block),
            offset: to_u32(offset),
            len: to_u32(len),
            generation: self.generation,
        }
    }

    fn check_span(&self, span: ArenaSpan) {
        assert!(
            span.generation == self.generation,
            "stale arena span used after flush (span generation {}, arena generation {})",
            span.generation,
            self.generation
        );
    }
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or_else(|_| panic!("arena offset {value} exceeds u32 range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_respects_alignment() {
        let mut arena = Arena::with_block_size(64);
        let _ = arena.allocate(3, 1);
        let span = arena.allocate(8, 8);
        assert_eq!(span.offset % 8, 0);
        assert_eq!(span.len(), 8);
        assert_eq!(arena.used(), 16);
    }

    #[test]
    fn test_grows_when_block_is_full() {
        let mut arena = Arena::with_block_size(16);
        let first = arena.copy_from_slice(&[1u8; 12]);
        let second = arena.copy_from_slice(&[2u8; 12]);
        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.bytes(first), &[1u8; 12]);
        assert_eq!(arena.bytes(second), &[2u8; 12]);
    }

    #[test]
    fn test_oversized_allocation_gets_dedicated_block() {
        let mut arena = Arena::with_block_size(16);
        let span = arena.allocate(1000, 4);
        assert_eq!(span.len(), 1000);
        assert!(arena.capacity() >= 1016);
    }

    #[test]
    fn test_zero_sized_allocation() {
        let mut arena = Arena::new();
        let span = arena.allocate(0, 16);
        assert!(span.is_empty());
        assert_eq!(arena.used(), 0);
        assert!(arena.bytes(span).is_empty());
    }

    #[test]
    fn test_flush_keeps_first_block() {
        let mut arena = Arena::with_block_size(16);
        for _ in 0..10 {
            let _ = arena.allocate(16, 1);
        }
        assert!(arena.block_count() > 1);

        arena.flush();
        assert_eq!(arena.block_count(), 1);
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.capacity(), 16);
    }

    #[test]
    fn test_flush_twice_is_stable() {
        let mut arena = Arena::new();
        let _ = arena.copy_from_slice(b"abc");
        arena.flush();
        let (used, blocks) = (arena.used(), arena.block_count());
        arena.flush();
        assert_eq!((arena.used(), arena.block_count()), (used, blocks));
    }

    #[test]
    #[should_panic(expected = "stale arena span")]
    fn test_stale_span_is_fatal() {
        let mut arena = Arena::new();
        let span = arena.copy_from_slice(b"abc");
        arena.flush();
        let _ = arena.bytes(span);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_bad_alignment_is_fatal() {
        let mut arena = Arena::new();
        let _ = arena.allocate(4, 3);
    }
}
