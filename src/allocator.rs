//! Assignment of file offsets to the blocks of a dump
//!
//! Offsets are handed out before the content of a block is known, which lets
//! the builder reserve every stream up front and fill them in later.

/// Alignment of every offset returned by [`RegionAllocator::allocate`]
pub const ALLOCATION_ALIGNMENT: u64 = 8;

#[inline]
fn align_up(value: u64) -> u64 {
    (value + (ALLOCATION_ALIGNMENT - 1)) & !(ALLOCATION_ALIGNMENT - 1)
}

/// A monotonically increasing cursor into the output file
#[derive(Debug)]
pub struct RegionAllocator {
    cursor: u64,
}

impl RegionAllocator {
    /// Creates an allocator whose first block goes at (or just after) `start`
    pub fn new(start: u64) -> Self {
        Self { cursor: start }
    }

    /// Reserves `size` bytes and returns the offset of the reservation
    ///
    /// The end of the previous block is rounded up to the alignment before the
    /// cursor advances, so consecutive blocks are packed without any later
    /// compaction.
    pub fn allocate(&mut self, size: u64) -> u64 {
        let offset = align_up(self.cursor);
        self.cursor = offset + size;
        offset
    }

    /// The unaligned end of the last reservation
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// The end of the last reservation, rounded up to the alignment. This is
    /// the final length of a file laid out by this allocator.
    pub fn end(&self) -> u64 {
        align_up(self.cursor)
    }
}
