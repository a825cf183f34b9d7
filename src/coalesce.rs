//! Merging a free block with its free physical neighbours.

use crate::heap::{FreeBlock, Heap};
use crate::tags::Status;

impl Heap {
    /// Merge `block`, whose tags already say FREE and which is on no list,
    /// with whichever of its physical neighbours are free.
    ///
    /// Absorbed neighbours are taken off their lists. The merged block is
    /// returned unlisted; the caller decides where it goes next.
    pub fn coalesce(&mut self, block: FreeBlock) -> FreeBlock {
        let prev = self.as_free(self.prev_block(block.block()));
        let next = self.as_free(self.next_block(block.block()));
        let mut size = self.size(block.block());

        let merged = match (prev, next) {
            (None, None) => return block,
            (None, Some(next)) => {
                self.remove(next);
                size += self.size(next.block());
                block
            }
            (Some(prev), None) => {
                self.remove(prev);
                size += self.size(prev.block());
                prev
            }
            (Some(prev), Some(next)) => {
                self.remove(prev);
                self.remove(next);
                size += self.size(prev.block()) + self.size(next.block());
                prev
            }
        };

        log::trace!(
            "coalesced {} into {}:{}",
            block.offset(),
            merged.offset(),
            size
        );
        self.set_tags(merged.block(), size, Status::Free);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::grower::ToyHeap;
    use crate::heap::tests::{append_blocks, empty_heap};
    use crate::heap::Block;

    /// Blocks of 32, 48, 64 and 80 bytes, all taken.
    fn four_taken(toy: &mut ToyHeap) -> (Heap, [Block; 4]) {
        let mut heap = empty_heap(toy);
        let all = append_blocks(toy, &mut heap, &[32, 48, 64, 80]);
        let blocks = [all[0], all[1], all[2], all[3]];
        for &b in &blocks {
            let free = heap.as_free(b).unwrap();
            heap.mark_taken(free);
        }
        (heap, blocks)
    }

    fn release(heap: &mut Heap, block: Block) -> FreeBlock {
        let taken = Heap::taken_unchecked(block);
        heap.mark_free(taken)
    }

    #[test]
    fn both_taken() {
        let mut toy = ToyHeap::default();
        let (mut heap, blocks) = four_taken(&mut toy);

        let freed = release(&mut heap, blocks[1]);
        let merged = heap.coalesce(freed);
        assert_eq!(merged, freed);
        assert_eq!(heap.size(merged.block()), 48);
    }

    #[test]
    fn next_free() {
        let mut toy = ToyHeap::default();
        let (mut heap, blocks) = four_taken(&mut toy);

        let next = release(&mut heap, blocks[2]);
        heap.insert(next);

        let freed = release(&mut heap, blocks[1]);
        let merged = heap.coalesce(freed);
        assert_eq!(merged.block(), blocks[1]);
        assert_eq!(heap.size(merged.block()), 48 + 64);
        heap.insert(merged);

        let (validity, stats) = heap.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn prev_free() {
        let mut toy = ToyHeap::default();
        let (mut heap, blocks) = four_taken(&mut toy);

        let prev = release(&mut heap, blocks[0]);
        heap.insert(prev);

        let freed = release(&mut heap, blocks[1]);
        let merged = heap.coalesce(freed);
        assert_eq!(merged.block(), blocks[0]);
        assert_eq!(heap.size(merged.block()), 32 + 48);
        // The old boundary between them is now internal; the merged footer
        // sits where the freed block's footer was.
        let (header, footer) = heap.raw_tags(merged.block());
        assert_eq!(header, footer);
        assert_eq!(heap.next_block(merged.block()), blocks[2]);
        assert_eq!(heap.prev_block(blocks[2]), blocks[0]);
        heap.insert(merged);

        let (validity, _) = heap.stats();
        assert!(validity.is_valid(), "{:?}", validity);
    }

    #[test]
    fn both_free() {
        let mut toy = ToyHeap::default();
        let (mut heap, blocks) = four_taken(&mut toy);

        for i in [0, 2] {
            let free = release(&mut heap, blocks[i]);
            heap.insert(free);
        }

        let freed = release(&mut heap, blocks[1]);
        let merged = heap.coalesce(freed);
        assert_eq!(merged.block(), blocks[0]);
        assert_eq!(heap.size(merged.block()), 32 + 48 + 64);
        heap.insert(merged);

        let (validity, stats) = heap.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.taken_blocks, 1);
    }

    #[test]
    fn sentinels_stop_merging() {
        let mut toy = ToyHeap::default();
        let (mut heap, blocks) = four_taken(&mut toy);

        // First and last blocks sit against the prologue and epilogue.
        let first = release(&mut heap, blocks[0]);
        assert_eq!(heap.coalesce(first), first);
        let last = release(&mut heap, blocks[3]);
        assert_eq!(heap.coalesce(last), last);
    }
}
