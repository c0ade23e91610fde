//! Bump allocation for hash-table keys and rows.
//!
//! An [`Arena`] hands out space from zero-initialized blocks and never
//! relocates committed bytes; everything is addressed by stable byte
//! offsets, so encoded strings can link to each other with small relative
//! deltas. A soft capacity ceiling bounds block allocation without ever
//! failing a write that has already been promised (see [`ArenaPair`]).
//!
//! The write protocol is reserve/write/commit: a caller reserves a window,
//! encodes directly into it, then commits exactly the bytes it wrote. Rows
//! whose upper-bound reservation exceeds their actual encoded size give the
//! slack back for the next reservation.

use quern_error::{QuernError, Result};

/// Cap on the geometric block-size growth.
const MAX_BLOCK_SIZE: usize = 1 << 20;

struct Block {
    /// Offset of this block's first byte in the arena's address space.
    base: u64,
    buf: Box<[u8]>,
    /// Committed bytes; the window `buf[len..]` is free.
    len: usize,
}

/// A bump allocator over zero-initialized blocks with a soft capacity cap.
pub struct Arena {
    blocks: Vec<Block>,
    /// Base offset for the next block.
    next_base: u64,
    /// Total committed bytes.
    committed: usize,
    /// Total bytes held in blocks, committed or not.
    allocated: usize,
    /// Soft ceiling on `allocated`; 0 means unlimited.
    max_capacity: usize,
    min_block_size: usize,
    next_block_size: usize,
}

impl Arena {
    pub fn new(min_block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            next_base: 0,
            committed: 0,
            allocated: 0,
            max_capacity: 0,
            min_block_size,
            next_block_size: min_block_size,
        }
    }

    /// Set the soft capacity ceiling in bytes; 0 means unlimited. Applies
    /// to future block allocation only, never to already-held blocks.
    pub fn set_max_capacity(&mut self, cap: usize) {
        self.max_capacity = cap;
    }

    /// Free bytes remaining in the current block's window.
    pub fn remaining(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.buf.len() - b.len)
    }

    /// Arena offset of the current window's first byte.
    pub fn window_offset(&self) -> u64 {
        self.blocks.last().map_or(self.next_base, |b| b.base + b.len as u64)
    }

    /// The current block's free window, for the caller to encode into
    /// before committing with [`Self::raw_commit`].
    pub fn window(&mut self) -> &mut [u8] {
        self.blocks.last_mut().map_or(&mut [], |b| &mut b.buf[b.len..])
    }

    /// Retire the current block and open a new one with at least
    /// `min_bytes` free. Returns false (allocating nothing) if the new
    /// block would push the arena past its capacity ceiling.
    pub fn force_new_block(&mut self, min_bytes: usize) -> bool {
        let size = self.next_block_size.max(min_bytes);
        if self.max_capacity != 0 && self.allocated + size > self.max_capacity {
            return false;
        }
        self.blocks.push(Block {
            base: self.next_base,
            buf: vec![0u8; size].into_boxed_slice(),
            len: 0,
        });
        self.next_base += size as u64;
        self.allocated += size;
        self.next_block_size = (self.next_block_size * 2).min(MAX_BLOCK_SIZE);
        true
    }

    /// Ensure the window holds at least `required` free bytes, opening a
    /// new block if the current one is too small. Returns whether the
    /// reservation succeeded within the capacity ceiling.
    pub fn reserve(&mut self, required: usize) -> bool {
        if self.remaining() < required {
            self.force_new_block(required);
        }
        self.remaining() >= required
    }

    /// Commit `n` bytes of the window, which the caller has just written.
    /// Committing without a prior successful reservation is a caller bug,
    /// reported as an internal error.
    pub fn raw_commit(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let block = self
            .blocks
            .last_mut()
            .ok_or_else(|| QuernError::internal("arena commit without a reservation"))?;
        debug_assert!(block.len + n <= block.buf.len());
        block.len += n;
        self.committed += n;
        Ok(())
    }

    /// Indivisible allocate-and-commit of `n` bytes, returning the offset
    /// and the writable slice. `Ok(None)` means the capacity ceiling
    /// refused a needed block; an arena with an unlimited ceiling never
    /// returns it.
    pub fn alloc(&mut self, n: usize) -> Result<Option<(u64, &mut [u8])>> {
        if !self.reserve(n) {
            return Ok(None);
        }
        let offset = self.window_offset();
        let block = self
            .blocks
            .last_mut()
            .ok_or_else(|| QuernError::internal("arena reservation left no block behind"))?;
        let start = block.len;
        block.len += n;
        self.committed += n;
        Ok(Some((offset, &mut block.buf[start..start + n])))
    }

    /// Committed bytes across all blocks.
    pub fn used(&self) -> usize {
        self.committed
    }

    /// Bytes held in blocks, committed or not.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Drop all blocks and restart the offset space at zero. Outstanding
    /// offsets become invalid; callers clear their indexes alongside.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.next_base = 0;
        self.committed = 0;
        self.allocated = 0;
        self.next_block_size = self.min_block_size;
    }

    /// The bytes of the block containing `offset`, from `offset` to the
    /// block's end. Encoded strings never span blocks, so a decoder always
    /// finds its full extent in the returned slice.
    pub fn slice_at(&self, offset: u64) -> &[u8] {
        let idx = self.blocks.partition_point(|b| b.base <= offset) - 1;
        let block = &self.blocks[idx];
        &block.buf[(offset - block.base) as usize..]
    }
}

/// Address of an encoded string in an [`ArenaPair`]: a block-stable byte
/// offset, with the top bit selecting the overflow arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRef(u64);

impl ArenaRef {
    const OVERFLOW_TAG: u64 = 1 << 63;

    pub fn primary(offset: u64) -> Self {
        debug_assert!(offset & Self::OVERFLOW_TAG == 0);
        Self(offset)
    }

    pub fn overflow(offset: u64) -> Self {
        debug_assert!(offset & Self::OVERFLOW_TAG == 0);
        Self(offset | Self::OVERFLOW_TAG)
    }

    pub fn is_overflow(self) -> bool {
        self.0 & Self::OVERFLOW_TAG != 0
    }

    fn offset(self) -> u64 {
        self.0 & !Self::OVERFLOW_TAG
    }

    /// The raw tagged address, used as the base for relative links. Both
    /// halves of the pair share this one address space, so a link from an
    /// overflow-resident head into the primary arena is just a (large)
    /// delta.
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// The primary arena plus its overflow companion.
///
/// The primary arena carries the soft capacity ceiling. The overflow arena
/// is unlimited and accepts exactly the allocation that would have pushed
/// the primary past its ceiling, so that storing a row can signal fullness
/// without ever failing midway.
pub struct ArenaPair {
    pub primary: Arena,
    pub overflow: Arena,
}

impl ArenaPair {
    pub fn new(primary_block_size: usize, overflow_block_size: usize) -> Self {
        Self {
            primary: Arena::new(primary_block_size),
            overflow: Arena::new(overflow_block_size),
        }
    }

    pub fn slice(&self, r: ArenaRef) -> &[u8] {
        if r.is_overflow() {
            self.overflow.slice_at(r.offset())
        } else {
            self.primary.slice_at(r.offset())
        }
    }

    pub fn clear(&mut self) {
        self.primary.clear();
        self.overflow.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_write_commit_exact() {
        let mut arena = Arena::new(64);
        assert!(arena.reserve(16));
        let offset = arena.window_offset();
        arena.window()[..3].copy_from_slice(b"abc");
        arena.raw_commit(3).unwrap();
        assert_eq!(arena.used(), 3);
        assert_eq!(&arena.slice_at(offset)[..3], b"abc");
    }

    #[test]
    fn capacity_ceiling_refuses_new_blocks() {
        let mut arena = Arena::new(64);
        assert!(arena.reserve(10));
        arena.raw_commit(10).unwrap();
        arena.set_max_capacity(1);
        // The first block is already larger than the ceiling.
        assert!(!arena.force_new_block(64));
        assert!(!arena.reserve(1000));
        // The existing window is still usable.
        assert!(arena.remaining() > 0);
    }

    #[test]
    fn zero_capacity_means_unlimited() {
        let mut arena = Arena::new(16);
        arena.set_max_capacity(0);
        for _ in 0..100 {
            assert!(arena.reserve(16));
            arena.raw_commit(16).unwrap();
        }
        assert_eq!(arena.used(), 1600);
    }

    #[test]
    fn offsets_resolve_across_blocks() {
        let mut arena = Arena::new(32);
        let mut offsets = Vec::new();
        for i in 0..20u8 {
            assert!(arena.reserve(24));
            let offset = arena.window_offset();
            arena.window()[..24].fill(i);
            arena.raw_commit(24).unwrap();
            offsets.push((offset, i));
        }
        assert!(arena.blocks.len() > 1);
        for (offset, i) in offsets {
            assert_eq!(arena.slice_at(offset)[..24], [i; 24]);
        }
    }

    #[test]
    fn alloc_commits_immediately() {
        let mut arena = Arena::new(64);
        let (offset, slice) = arena.alloc(8).unwrap().expect("unlimited arena");
        slice.copy_from_slice(&[7u8; 8]);
        assert_eq!(arena.used(), 8);
        assert_eq!(&arena.slice_at(offset)[..8], &[7u8; 8]);
    }

    #[test]
    fn clear_restarts_offset_space() {
        let mut arena = Arena::new(64);
        assert!(arena.reserve(8));
        arena.raw_commit(8).unwrap();
        arena.clear();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.allocated(), 0);
        assert_eq!(arena.window_offset(), 0);
    }

    #[test]
    fn pair_resolves_tagged_refs() {
        let mut pair = ArenaPair::new(64, 64);
        let (p_off, p_slice) = pair.primary.alloc(4).unwrap().unwrap();
        p_slice.copy_from_slice(b"prim");
        let (o_off, o_slice) = pair.overflow.alloc(4).unwrap().unwrap();
        o_slice.copy_from_slice(b"over");

        assert_eq!(&pair.slice(ArenaRef::primary(p_off))[..4], b"prim");
        assert_eq!(&pair.slice(ArenaRef::overflow(o_off))[..4], b"over");
        assert!(ArenaRef::overflow(o_off).is_overflow());
        assert!(!ArenaRef::primary(p_off).is_overflow());
    }

    #[test]
    fn commit_without_reservation_is_an_error() {
        let mut arena = Arena::new(64);
        assert!(matches!(
            arena.raw_commit(4),
            Err(QuernError::Internal(_))
        ));
        // A zero-byte commit is a no-op even with no blocks.
        assert!(arena.raw_commit(0).is_ok());
    }

    #[test]
    fn block_sizes_grow_geometrically() {
        let mut arena = Arena::new(16);
        assert!(arena.force_new_block(1));
        assert!(arena.force_new_block(1));
        assert!(arena.force_new_block(1));
        assert_eq!(arena.blocks[0].buf.len(), 16);
        assert_eq!(arena.blocks[1].buf.len(), 32);
        assert_eq!(arena.blocks[2].buf.len(), 64);
    }
}
