//! Boundary tags: the one-word header and footer every block carries.
//!
//! A tag packs the total size of a block (header, payload and footer, in
//! bytes) together with its allocation status. Sizes are always multiples of
//! [`DSIZE`], so the low three bits are free and bit 0 holds the status.
//!
//! Everything here is pure arithmetic over offsets; reading and writing the
//! tags is done by [`Heap`](../heap/struct.Heap.html).

use static_assertions::const_assert;

/// Size of a word, and of a single header or footer tag, in bytes.
pub const WSIZE: usize = 4;

/// Double word size in bytes. Payloads are aligned to this, and every block
/// size is a multiple of it.
pub const DSIZE: usize = 8;

/// Bytes of bookkeeping per block: one header and one footer.
pub const OVERHEAD: usize = 2 * WSIZE;

/// The smallest block that can be free: a header, a footer, and room in the
/// payload for the two free-list links.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// The largest size a tag can represent.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & SIZE_MASK) as usize;

const SIZE_MASK: u32 = !0x7;
const TAKEN_BIT: u32 = 0x1;

const_assert!(OVERHEAD == DSIZE);
const_assert!(MIN_BLOCK_SIZE >= OVERHEAD + 2 * WSIZE);
const_assert!(core::mem::size_of::<u32>() == WSIZE);

/// Whether a block is on a free list or handed out to a caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Free,
    Taken,
}

/// Pack a block size and status into a tag.
///
/// `size` must already be rounded to a multiple of [`DSIZE`] and be at most
/// [`MAX_BLOCK_SIZE`].
pub fn pack(size: usize, status: Status) -> u32 {
    debug_assert!(size % DSIZE == 0, "unaligned block size {}", size);
    debug_assert!(size <= MAX_BLOCK_SIZE, "block size {} too large", size);

    let bit = match status {
        Status::Free => 0,
        Status::Taken => TAKEN_BIT,
    };
    (size as u32) | bit
}

/// The total block size stored in a tag.
pub fn size_of(tag: u32) -> usize {
    (tag & SIZE_MASK) as usize
}

/// The status stored in a tag.
pub fn status_of(tag: u32) -> Status {
    if tag & TAKEN_BIT == 0 {
        Status::Free
    } else {
        Status::Taken
    }
}

/// Offset of the header of the block whose payload starts at `bp`.
pub fn header_offset(bp: u32) -> u32 {
    bp - WSIZE as u32
}

/// Offset of the footer of a block of `size` bytes with payload at `bp`.
pub fn footer_offset(bp: u32, size: usize) -> u32 {
    bp + size as u32 - DSIZE as u32
}

/// Payload offset of the block physically after a block of `size` bytes.
pub fn next_offset(bp: u32, size: usize) -> u32 {
    bp + size as u32
}

/// Offset of the footer of the block physically before `bp`.
pub fn prev_footer_offset(bp: u32) -> u32 {
    bp - DSIZE as u32
}

/// Round `bytes` up to the next multiple of [`DSIZE`], or `None` on overflow.
pub fn align_up(bytes: usize) -> Option<usize> {
    Some(bytes.checked_add(DSIZE - 1)? & !(DSIZE - 1))
}

/// The total block size needed to hold a payload of `bytes`, or `None` if
/// that is beyond what a tag can describe.
pub fn block_size_for(bytes: usize) -> Option<usize> {
    let size = align_up(bytes.checked_add(OVERHEAD)?)?.max(MIN_BLOCK_SIZE);
    if size > MAX_BLOCK_SIZE {
        return None;
    }
    Some(size)
}
