//! Carving a taken block out of a free one.

use crate::heap::{Block, FreeBlock, Heap, TakenBlock};
use crate::tags::{Status, MIN_BLOCK_SIZE};

impl Heap {
    /// Hand out the first `size` bytes of `block`, which must be off every
    /// list and at least `size` bytes long.
    ///
    /// If what is left over can hold a free block, it is split off, merged
    /// with a free right neighbour if there is one, and listed. Otherwise the
    /// whole block is taken and the slack becomes padding.
    pub fn place(&mut self, block: FreeBlock, size: usize) -> TakenBlock {
        self.carve(block.block(), size)
    }

    /// Give back the tail of a taken block so that it is `size` bytes long,
    /// if the tail is big enough to be a block of its own.
    pub fn shrink(&mut self, block: TakenBlock, size: usize) -> TakenBlock {
        self.carve(block.block(), size)
    }

    pub(crate) fn carve(&mut self, block: Block, size: usize) -> TakenBlock {
        let total = self.size(block);
        debug_assert!(total >= size, "placing {} bytes in {}", size, total);

        let remainder = total - size;
        if remainder < MIN_BLOCK_SIZE {
            self.set_tags(block, total, Status::Taken);
            return Heap::taken_unchecked(block);
        }

        self.set_tags(block, size, Status::Taken);
        let rest = Block::from_offset(block.offset() + size as u32);
        self.set_tags(rest, remainder, Status::Free);
        let rest = self.coalesce(Heap::free_unchecked(rest));
        self.insert(rest);

        Heap::taken_unchecked(block)
    }
}
