//! Mapping block sizes onto power-of-two size classes.

use static_assertions::const_assert;

use crate::tags::{MAX_BLOCK_SIZE, WSIZE};

/// Number of segregated free lists.
pub const NUM_SIZE_CLASSES: usize = 32;

/// The highest class index; anything larger is clamped here.
pub const MAX_CLASS: usize = NUM_SIZE_CLASSES - 1;

// Every representable block must land in a real class without clamping.
const_assert!((MAX_BLOCK_SIZE / WSIZE) >> MAX_CLASS == 0);

/// The size class for a block of `words` words: `floor(log2(words))`, clamped
/// to `0..=MAX_CLASS`.
///
/// Class `i` holds blocks of `2^i .. 2^(i + 1)` words.
pub fn class_of(words: usize) -> usize {
    if words == 0 {
        return 0;
    }
    let log2 = (usize::BITS - 1 - words.leading_zeros()) as usize;
    log2.min(MAX_CLASS)
}

/// The size class of a block of `size` bytes.
pub fn class_of_size(size: usize) -> usize {
    class_of(size / WSIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tags::MIN_BLOCK_SIZE;

    use test_log::test;

    #[test]
    fn powers_of_two() {
        assert_eq!(class_of(0), 0);
        assert_eq!(class_of(1), 0);
        assert_eq!(class_of(2), 1);
        assert_eq!(class_of(3), 1);
        assert_eq!(class_of(4), 2);
        assert_eq!(class_of(1023), 9);
        assert_eq!(class_of(1024), 10);
        assert_eq!(class_of(usize::MAX), MAX_CLASS);
    }

    #[test]
    fn block_sizes() {
        // The smallest block lands in class 2.
        assert_eq!(class_of_size(MIN_BLOCK_SIZE), 2);
        assert_eq!(class_of_size(136), 5);
        assert_eq!(class_of_size(4096), 10);
        assert_eq!(class_of_size(MAX_BLOCK_SIZE), 29);
    }
}
