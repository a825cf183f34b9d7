//! Blocks laid out in the managed region, and how to walk between them.
//!
//! The region looks like this once formatted:
//!
//! ```text
//! 0          128    132        136        140        144
//! | classes  | pad  | pro hdr  | pro ftr  | blocks ... | epilogue hdr |
//! ```
//!
//! The size-class table holds one list head per class. The prologue is a
//! taken block with an empty payload, and the epilogue is a taken header of
//! size zero; between them, every block is bounded by a header and a footer,
//! so neighbours can be found in O(1) in either direction.
//!
//! Blocks are named by the offset of their payload. A [`FreeBlock`] may carry
//! free-list links in its payload; a [`TakenBlock`] belongs to a caller. The
//! free-list, coalescing and placement logic live in their own modules as
//! further `impl Heap` blocks.

use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::region::Region;
use crate::size_class::NUM_SIZE_CLASSES;
use crate::tags::{self, Status, DSIZE, OVERHEAD, WSIZE};

/// Where the size-class table starts.
pub const TABLE_OFFSET: u32 = 0;

/// Bytes taken up by the size-class table.
pub const TABLE_SIZE: usize = NUM_SIZE_CLASSES * WSIZE;

/// Payload offset of the prologue block.
pub const PROLOGUE: u32 = (TABLE_SIZE + DSIZE) as u32;

/// Length of a freshly formatted region: table, padding, prologue, epilogue.
/// This is also the fixed overhead of the heap, never available to blocks.
pub const FORMAT_SIZE: usize = TABLE_SIZE + 2 * DSIZE;

// The first block payload (FORMAT_SIZE) must be double-word aligned.
const_assert!(TABLE_SIZE % DSIZE == 0);
const_assert!(FORMAT_SIZE % DSIZE == 0);

/// A block of any status, named by its payload offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Block(u32);

impl Block {
    pub(crate) fn from_offset(offset: u32) -> Block {
        Block(offset)
    }

    pub fn offset(self) -> u32 {
        self.0
    }
}

/// A block whose tags say FREE. Its first two payload words are free-list
/// links while it sits on a list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeBlock(Block);

impl FreeBlock {
    pub fn block(self) -> Block {
        self.0
    }

    pub fn offset(self) -> u32 {
        self.0.offset()
    }
}

/// A block whose tags say TAKEN. Its payload belongs to a caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TakenBlock(Block);

impl TakenBlock {
    pub fn block(self) -> Block {
        self.0
    }

    pub fn offset(self) -> u32 {
        self.0.offset()
    }
}

/// The formatted region: boundary-tagged blocks plus the size-class table.
pub struct Heap {
    pub(crate) region: Region,
}

impl Heap {
    /// Lay out an empty heap in `region`, which must be exactly
    /// [`FORMAT_SIZE`] bytes long.
    pub fn format(region: Region) -> Heap {
        debug_assert_eq!(region.len(), FORMAT_SIZE);
        let mut heap = Heap { region };
        heap.clear_table();

        let padding = tags::header_offset(PROLOGUE) - WSIZE as u32;
        heap.region.write_word(padding, 0);
        heap.set_tags(Block(PROLOGUE), DSIZE, Status::Taken);
        heap.write_epilogue();
        heap
    }

    /// Forget every block: the table is emptied, and everything between the
    /// prologue and the epilogue becomes one unlisted free block, which is
    /// returned. Returns `None` if there is no such space.
    pub fn reset(&mut self) -> Option<FreeBlock> {
        self.clear_table();
        let span = self.region.len() - FORMAT_SIZE;
        if span == 0 {
            return None;
        }
        let block = Block(FORMAT_SIZE as u32);
        self.set_tags(block, span, Status::Free);
        Some(FreeBlock(block))
    }

    /// Tag `additional` bytes, just appended to the region, as one free
    /// block in place of the old epilogue, and write a new epilogue after it.
    ///
    /// The block is not coalesced and not listed.
    ///
    /// # Safety
    ///
    /// The bytes must directly follow the region and be owned by the
    /// allocator.
    pub unsafe fn append(&mut self, additional: usize) -> FreeBlock {
        debug_assert!(additional % DSIZE == 0 && additional >= OVERHEAD);
        // The old epilogue header becomes the new block's header.
        let block = Block(self.region.len() as u32);
        self.region.grow(additional);
        self.set_tags(block, additional, Status::Free);
        self.write_epilogue();
        FreeBlock(block)
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    fn clear_table(&mut self) {
        for class in 0..NUM_SIZE_CLASSES {
            self.region.write_word(TABLE_OFFSET + (class * WSIZE) as u32, 0);
        }
    }

    fn write_epilogue(&mut self) {
        let offset = (self.region.len() - WSIZE) as u32;
        self.region.write_word(offset, tags::pack(0, Status::Taken));
    }

    ////////////////////////////////////////////////////////////
    // Boundary tags

    pub fn size(&self, block: Block) -> usize {
        tags::size_of(self.region.read_word(tags::header_offset(block.0)))
    }

    pub fn status(&self, block: Block) -> Status {
        tags::status_of(self.region.read_word(tags::header_offset(block.0)))
    }

    /// Write matching header and footer tags.
    pub(crate) fn set_tags(&mut self, block: Block, size: usize, status: Status) {
        let tag = tags::pack(size, status);
        self.region.write_word(tags::header_offset(block.0), tag);
        self.region.write_word(tags::footer_offset(block.0, size), tag);
    }

    /// The block physically after `block`. For the last block this is the
    /// epilogue.
    pub fn next_block(&self, block: Block) -> Block {
        Block(tags::next_offset(block.0, self.size(block)))
    }

    /// The block physically before `block`, found through its footer. For the
    /// first block this is the prologue.
    pub fn prev_block(&self, block: Block) -> Block {
        let footer = self.region.read_word(tags::prev_footer_offset(block.0));
        Block(block.0 - tags::size_of(footer) as u32)
    }

    /// Reinterpret `block` as free, if its tags say so.
    pub fn as_free(&self, block: Block) -> Option<FreeBlock> {
        match self.status(block) {
            Status::Free => Some(FreeBlock(block)),
            Status::Taken => None,
        }
    }

    pub(crate) fn mark_free(&mut self, block: TakenBlock) -> FreeBlock {
        let size = self.size(block.0);
        self.set_tags(block.0, size, Status::Free);
        FreeBlock(block.0)
    }

    #[cfg(test)]
    pub(crate) fn mark_taken(&mut self, block: FreeBlock) -> TakenBlock {
        let size = self.size(block.0);
        self.set_tags(block.0, size, Status::Taken);
        TakenBlock(block.0)
    }

    /// Wrap a block we have just tagged ourselves.
    pub(crate) fn free_unchecked(block: Block) -> FreeBlock {
        FreeBlock(block)
    }

    pub(crate) fn taken_unchecked(block: Block) -> TakenBlock {
        TakenBlock(block)
    }

    ////////////////////////////////////////////////////////////
    // Payloads

    pub fn payload(&self, block: TakenBlock) -> NonNull<u8> {
        self.region.ptr_at(block.offset())
    }

    /// Payload capacity of a block in bytes.
    pub fn capacity(&self, block: TakenBlock) -> usize {
        self.size(block.0) - OVERHEAD
    }

    /// Recover the block handed out as `ptr`.
    ///
    /// `ptr` must be a payload pointer this heap returned and that has not
    /// been released; this is checked only in debug builds.
    pub fn block_of(&self, ptr: NonNull<u8>) -> TakenBlock {
        let offset = self.region.offset_of(ptr);
        debug_assert!(offset.is_some(), "{:?} is not in the heap", ptr);
        let block = Block(offset.unwrap_or(0));
        debug_assert_eq!(self.status(block), Status::Taken, "double free?");
        TakenBlock(block)
    }

    /// Iterate over every block between the sentinels, in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            next: Block(FORMAT_SIZE as u32),
        }
    }

    /// The raw header and footer of `block`, for auditing.
    pub(crate) fn raw_tags(&self, block: Block) -> (u32, u32) {
        let header = self.region.read_word(tags::header_offset(block.0));
        let footer = self
            .region
            .read_word(tags::footer_offset(block.0, tags::size_of(header)));
        (header, footer)
    }
}

/// Address-order walk over the blocks of a [`Heap`].
pub struct Blocks<'heap> {
    heap: &'heap Heap,
    next: Block,
}

impl<'heap> Iterator for Blocks<'heap> {
    type Item = (Block, usize, Status);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next;
        if block.0 as usize >= self.heap.len() {
            return None;
        }
        let size = self.heap.size(block);
        if size == 0 {
            // The epilogue.
            return None;
        }
        self.next = Block(block.0 + size as u32);
        Some((block, size, self.heap.status(block)))
    }
}
