//! Segregated free lists.
//!
//! There is one doubly linked list per size class. Each list head lives in
//! the size-class table at the start of the region, and the links live in
//! the first two payload words of each free block: the predecessor at +0, the
//! successor at +4, both as region offsets with 0 meaning "none".
//!
//! Lists are kept sorted by descending block size, so a search can stop at
//! the smallest block in a bucket that still fits, which approximates best
//! fit without scanning the whole bucket.
//!
//! This module also holds the heap audit: [`Heap::stats`] walks the region
//! and every list and reports anything that breaks the allocator's
//! invariants.

use core::fmt;

use crate::heap::{Block, FreeBlock, Heap, FORMAT_SIZE, TABLE_OFFSET};
use crate::size_class::{class_of_size, NUM_SIZE_CLASSES};
use crate::tags::{self, Status, MIN_BLOCK_SIZE, WSIZE};

impl Heap {
    fn head(&self, class: usize) -> Option<FreeBlock> {
        self.link(TABLE_OFFSET + (class * WSIZE) as u32)
    }

    fn set_head(&mut self, class: usize, block: Option<FreeBlock>) {
        self.set_link(TABLE_OFFSET + (class * WSIZE) as u32, block)
    }

    fn pred(&self, block: FreeBlock) -> Option<FreeBlock> {
        self.link(block.offset())
    }

    fn succ(&self, block: FreeBlock) -> Option<FreeBlock> {
        self.link(block.offset() + WSIZE as u32)
    }

    fn set_pred(&mut self, block: FreeBlock, pred: Option<FreeBlock>) {
        self.set_link(block.offset(), pred)
    }

    fn set_succ(&mut self, block: FreeBlock, succ: Option<FreeBlock>) {
        self.set_link(block.offset() + WSIZE as u32, succ)
    }

    fn link(&self, at: u32) -> Option<FreeBlock> {
        match self.region.read_word(at) {
            0 => None,
            offset => Some(Heap::free_unchecked(Block::from_offset(offset))),
        }
    }

    fn set_link(&mut self, at: u32, block: Option<FreeBlock>) {
        self.region.write_word(at, block.map_or(0, FreeBlock::offset));
    }

    /// Put `block` on the list for its size class, keeping the list sorted
    /// by descending size. It goes before the first member that is no larger
    /// than it.
    pub fn insert(&mut self, block: FreeBlock) {
        let size = self.size(block.block());
        let class = class_of_size(size);

        let mut pred = None;
        let mut cursor = self.head(class);
        while let Some(member) = cursor {
            if self.size(member.block()) <= size {
                break;
            }
            pred = Some(member);
            cursor = self.succ(member);
        }

        self.set_pred(block, pred);
        self.set_succ(block, cursor);
        match pred {
            Some(p) => self.set_succ(p, Some(block)),
            None => self.set_head(class, Some(block)),
        }
        if let Some(s) = cursor {
            self.set_pred(s, Some(block));
        }
    }

    /// Unlink `block` from its size-class list. Removing a zero-size
    /// sentinel is a no-op.
    pub fn remove(&mut self, block: FreeBlock) {
        let size = self.size(block.block());
        if size == 0 {
            return;
        }

        let pred = self.pred(block);
        let succ = self.succ(block);
        match pred {
            Some(p) => self.set_succ(p, succ),
            None => self.set_head(class_of_size(size), succ),
        }
        if let Some(s) = succ {
            self.set_pred(s, pred);
        }
    }

    /// Find a free block of at least `size` bytes, leaving it on its list.
    ///
    /// Buckets are tried from the class of `size` upward. In the first
    /// bucket whose largest block fits, we walk down the list to the
    /// smallest block that still fits.
    pub fn find(&self, size: usize) -> Option<FreeBlock> {
        for class in class_of_size(size)..NUM_SIZE_CLASSES {
            let mut best = match self.head(class) {
                Some(head) if self.size(head.block()) >= size => head,
                _ => continue,
            };
            while let Some(next) = self.succ(best) {
                if self.size(next.block()) < size {
                    break;
                }
                best = next;
            }
            return Some(best);
        }
        None
    }

    /// Iterate over the members of one size class, head first.
    pub fn class_members(&self, class: usize) -> ClassIter<'_> {
        ClassIter {
            heap: self,
            next: self.head(class),
            // A list can never hold more blocks than fit in the region; this
            // bounds the walk even if the links are corrupt.
            remaining: self.len() / MIN_BLOCK_SIZE,
        }
    }

    /// Audit the heap.
    ///
    /// Walks every block in address order and every size-class list, and
    /// counts each way the two views disagree.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats {
            heap_size: self.len(),
            ..Default::default()
        };

        let mut prev_status = Status::Taken;
        for (block, size, status) in self.blocks() {
            let (header, footer) = self.raw_tags(block);
            if header != footer {
                validity.tag_mismatches += 1;
            }
            if size % tags::DSIZE != 0 || size < MIN_BLOCK_SIZE {
                validity.bad_sizes += 1;
            }

            match status {
                Status::Taken => {
                    stats.taken_blocks += 1;
                    stats.taken_bytes += size;
                }
                Status::Free => {
                    stats.free_blocks += 1;
                    stats.free_bytes += size;
                    if prev_status == Status::Free {
                        validity.adjacent_free += 1;
                    }
                    let class = class_of_size(size);
                    if !self.class_members(class).any(|b| b.block() == block) {
                        validity.unlisted += 1;
                    }
                }
            }
            prev_status = status;
        }

        let mut listed = 0;
        for class in 0..NUM_SIZE_CLASSES {
            let mut pred: Option<FreeBlock> = None;
            let mut pred_size = usize::MAX;
            for member in self.class_members(class) {
                listed += 1;
                let block = member.block();
                let in_bounds =
                    block.offset() as usize >= FORMAT_SIZE && (block.offset() as usize) < self.len();
                if !in_bounds || self.status(block) != Status::Free {
                    validity.listed_taken += 1;
                    // The tags can't be trusted; don't read further.
                    break;
                }
                let size = self.size(block);
                if class_of_size(size) != class {
                    validity.misfiled += 1;
                }
                if size > pred_size {
                    validity.out_of_order += 1;
                }
                if self.pred(member) != pred {
                    validity.broken_links += 1;
                }
                pred = Some(member);
                pred_size = size;
            }
        }

        // Every free block was found on its list; any surplus entries are
        // duplicates.
        let found = stats.free_blocks - validity.unlisted;
        if listed > found + validity.listed_taken {
            validity.duplicates = listed - found - validity.listed_taken;
        }

        (validity, stats)
    }
}

/// Walks one size-class list.
pub struct ClassIter<'heap> {
    heap: &'heap Heap,
    next: Option<FreeBlock>,
    remaining: usize,
}

impl<'heap> Iterator for ClassIter<'heap> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let block = self.next.take()?;
        let offset = block.offset() as usize;
        if offset >= FORMAT_SIZE && offset < self.heap.len() {
            self.next = self.heap.succ(block);
        }
        Some(block)
    }
}

impl fmt::Display for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SizeClasses(")?;
        let mut start = true;
        for class in 0..NUM_SIZE_CLASSES {
            if self.head(class).is_none() {
                continue;
            }
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}: [", class)?;
            for (i, block) in self.class_members(class).enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "FreeBlock({}, {})", block.offset(), self.size(block.block()))?;
            }
            write!(f, "]")?;
        }
        write!(f, ")")
    }
}

/// Validity contains a count of every broken invariant found in a heap.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose header and footer disagree.
    pub tag_mismatches: usize,
    /// Blocks whose size is unaligned or below the minimum.
    pub bad_sizes: usize,
    /// Free blocks directly after another free block. These should have been
    /// coalesced.
    pub adjacent_free: usize,
    /// Free blocks missing from the list for their class.
    pub unlisted: usize,
    /// List entries that are not free blocks at all.
    ///
    /// This likely indicates corruption.
    pub listed_taken: usize,
    /// Free blocks sitting in the list of the wrong class.
    pub misfiled: usize,
    /// List entries larger than their predecessor.
    pub out_of_order: usize,
    /// List entries whose predecessor link doesn't match the walk.
    pub broken_links: usize,
    /// Free blocks listed more than once.
    pub duplicates: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.tag_mismatches == 0
            && self.bad_sizes == 0
            && self.adjacent_free == 0
            && self.unlisted == 0
            && self.listed_taken == 0
            && self.misfiled == 0
            && self.out_of_order == 0
            && self.broken_links == 0
            && self.duplicates == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Total bytes in the managed region, sentinels and table included.
    pub heap_size: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub taken_blocks: usize,
    pub taken_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::grower::ToyHeap;
    use crate::heap::tests::{append_blocks, empty_heap};

    fn free(heap: &Heap, block: Block) -> FreeBlock {
        heap.as_free(block).unwrap()
    }

    fn members(heap: &Heap, class: usize) -> ([u32; 8], usize) {
        let mut offsets = [0; 8];
        let mut count = 0;
        for block in heap.class_members(class) {
            offsets[count] = block.offset();
            count += 1;
        }
        (offsets, count)
    }

    #[test]
    fn insert_keeps_descending_order() {
        let mut toy = ToyHeap::default();
        let mut heap = empty_heap(&mut toy);
        // Class 5 holds 128..256 bytes. Separate them with taken blocks so
        // nothing is adjacent.
        let sizes = [144, 16, 200, 16, 136, 16, 200];
        let blocks = append_blocks(&mut toy, &mut heap, &sizes);
        for i in [1, 3, 5] {
            heap.mark_taken(free(&heap, blocks[i]));
        }

        heap.insert(free(&heap, blocks[0]));
        heap.insert(free(&heap, blocks[2]));
        heap.insert(free(&heap, blocks[4]));
        // Equal sizes: the newcomer goes in front.
        heap.insert(free(&heap, blocks[6]));

        let (offsets, count) = members(&heap, 5);
        assert_eq!(count, 4);
        assert_eq!(
            &offsets[..4],
            &[
                blocks[6].offset(),
                blocks[2].offset(),
                blocks[0].offset(),
                blocks[4].offset()
            ]
        );
        let (validity, stats) = heap.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.free_blocks, 4);
        assert_eq!(stats.free_bytes, 144 + 200 + 136 + 200);
        log::info!("{}", heap);
    }

    #[test]
    fn remove_head_middle_tail() {
        let mut toy = ToyHeap::default();
        let mut heap = empty_heap(&mut toy);
        let blocks = append_blocks(&mut toy, &mut heap, &[160, 16, 152, 16, 144, 16]);
        for i in [1, 3, 5] {
            heap.mark_taken(free(&heap, blocks[i]));
        }
        for i in [0, 2, 4] {
            heap.insert(free(&heap, blocks[i]));
        }

        heap.remove(free(&heap, blocks[2]));
        let (offsets, count) = members(&heap, 5);
        assert_eq!(&offsets[..count], &[blocks[0].offset(), blocks[4].offset()]);

        heap.remove(free(&heap, blocks[0]));
        let (offsets, count) = members(&heap, 5);
        assert_eq!(&offsets[..count], &[blocks[4].offset()]);
        assert_eq!(heap.pred(free(&heap, blocks[4])), None);

        heap.remove(free(&heap, blocks[4]));
        assert_eq!(members(&heap, 5).1, 0);
    }

    #[test]
    fn find_smallest_fit_in_first_bucket() {
        let mut toy = ToyHeap::default();
        let mut heap = empty_heap(&mut toy);
        // 48 and 56 are class 3, 240 and 136 are class 5.
        let blocks = append_blocks(&mut toy, &mut heap, &[48, 16, 56, 16, 240, 16, 136, 16]);
        for i in [1, 3, 5, 7] {
            heap.mark_taken(free(&heap, blocks[i]));
        }
        for i in [0, 2, 4, 6] {
            heap.insert(free(&heap, blocks[i]));
        }

        assert_eq!(heap.find(40).map(|b| b.block()), Some(blocks[0]));
        assert_eq!(heap.find(48).map(|b| b.block()), Some(blocks[0]));
        assert_eq!(heap.find(56).map(|b| b.block()), Some(blocks[2]));
        // Nothing in class 3 fits 64 bytes (class 4 is empty), so class 5
        // gives up its smallest fitting block.
        assert_eq!(heap.find(64).map(|b| b.block()), Some(blocks[6]));
        assert_eq!(heap.find(144).map(|b| b.block()), Some(blocks[4]));
        assert_eq!(heap.find(248), None);
        // find leaves the list alone.
        assert_eq!(members(&heap, 5).1, 2);
    }

    #[test]
    fn stats_catch_broken_invariants() {
        let mut toy = ToyHeap::default();
        let mut heap = empty_heap(&mut toy);
        let blocks = append_blocks(&mut toy, &mut heap, &[32, 32]);

        // Two adjacent free blocks, neither listed.
        let (validity, stats) = heap.stats();
        assert!(!validity.is_valid());
        assert_eq!(validity.adjacent_free, 1);
        assert_eq!(validity.unlisted, 2);
        assert_eq!(stats.free_bytes + stats.taken_bytes + FORMAT_SIZE, stats.heap_size);

        heap.insert(free(&heap, blocks[0]));
        heap.insert(free(&heap, blocks[1]));
        let (validity, _) = heap.stats();
        assert_eq!(validity.unlisted, 0);
        assert_eq!(validity.adjacent_free, 1);

        // A listed block that someone marked taken.
        heap.mark_taken(free(&heap, blocks[1]));
        let (validity, _) = heap.stats();
        assert_eq!(validity.listed_taken, 1);
        assert!(!bool::from(validity));
    }

    #[test]
    fn remove_sentinel_is_noop() {
        let mut toy = ToyHeap::default();
        let mut heap = empty_heap(&mut toy);
        let blocks = append_blocks(&mut toy, &mut heap, &[32]);
        heap.insert(free(&heap, blocks[0]));

        // The epilogue has size 0. Pretend it is free to get a handle.
        let epilogue = heap.next_block(blocks[0]);
        heap.remove(Heap::free_unchecked(epilogue));
        assert_eq!(members(&heap, class_of_size(32)).1, 1);
    }
}
