//! The managed region as an offset-indexed byte buffer.
//!
//! All raw pointer arithmetic in the allocator is confined to this module.
//! Everything above it talks about `u32` offsets from the (8-aligned) base of
//! the region, which keeps the free-list and placement logic free of unsafe
//! code and makes an out-of-bounds offset a debug assertion rather than a
//! stray write.

use core::ptr::{self, NonNull};

use crate::tags::{DSIZE, WSIZE};

/// A contiguous, growable run of memory starting at an 8-aligned base.
///
/// Invariants:
///
/// - `base` is aligned to [`DSIZE`].
/// - `base..base + len` is memory exclusively owned by the allocator.
/// - `len` never exceeds `u32::MAX`, so every byte has a `u32` offset.
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// The region is plain memory owned by the allocator; moving it to another
// thread along with the allocator is fine.
unsafe impl Send for Region {}

impl Region {
    /// The longest region we can describe with `u32` offsets.
    pub const MAX_LEN: usize = u32::MAX as usize;

    /// Take ownership of `len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to [`DSIZE`], and `base..base + len` must be
    /// valid for reads and writes and not accessible to any other code.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Region {
        debug_assert_eq!(base.as_ptr() as usize % DSIZE, 0);
        debug_assert!(len <= Self::MAX_LEN);
        Region { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The address one past the last byte of the region.
    pub fn end(&self) -> NonNull<u8> {
        self.ptr_at(self.len as u32)
    }

    /// Extend the region by `additional` bytes.
    ///
    /// # Safety
    ///
    /// The `additional` bytes directly following [`end`](#method.end) must be
    /// valid for reads and writes and owned by the allocator.
    pub unsafe fn grow(&mut self, additional: usize) {
        debug_assert!(self.len + additional <= Self::MAX_LEN);
        self.len += additional;
    }

    /// Whether `len + additional` still fits in a `u32` offset space.
    pub fn can_grow(&self, additional: usize) -> bool {
        match self.len.checked_add(additional) {
            Some(total) => total <= Self::MAX_LEN,
            None => false,
        }
    }

    pub fn read_word(&self, offset: u32) -> u32 {
        self.check_word(offset);
        // check_word guarantees the word is in bounds and aligned.
        unsafe { ptr::read(self.base.as_ptr().add(offset as usize) as *const u32) }
    }

    pub fn write_word(&mut self, offset: u32, value: u32) {
        self.check_word(offset);
        unsafe { ptr::write(self.base.as_ptr().add(offset as usize) as *mut u32, value) }
    }

    /// The address of the byte at `offset`.
    pub fn ptr_at(&self, offset: u32) -> NonNull<u8> {
        debug_assert!(offset as usize <= self.len);
        // Adding an in-bounds offset to a non-null base can't produce null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) }
    }

    /// The offset of `ptr`, if it points inside the region.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<u32> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.len {
            return None;
        }
        Some((addr - base) as u32)
    }

    /// Copy `count` bytes from `src` to `dst`. The ranges may overlap.
    pub fn copy_within(&mut self, src: u32, dst: u32, count: usize) {
        debug_assert!(src as usize + count <= self.len);
        debug_assert!(dst as usize + count <= self.len);
        unsafe {
            ptr::copy(
                self.base.as_ptr().add(src as usize),
                self.base.as_ptr().add(dst as usize),
                count,
            )
        }
    }

    fn check_word(&self, offset: u32) {
        debug_assert_eq!(offset as usize % WSIZE, 0, "unaligned word at {}", offset);
        debug_assert!(
            offset as usize + WSIZE <= self.len,
            "word at {} outside region of {} bytes",
            offset,
            self.len
        );
    }
}
