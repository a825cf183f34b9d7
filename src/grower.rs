//! Sources of heap memory.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts over the call that makes the heap bigger, in the
//! style of `sbrk`: every successful call returns memory directly after the
//! memory returned by the previous one.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap. It is mainly
//! useful for testing.
//!
//! ### [`LibcHeapGrower`](struct.LibcHeapGrower.html)
//!
//! With the `use_libc` feature, `LibcHeapGrower` moves the program break with
//! `sbrk`.

use core::fmt;
use core::ptr::{self, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;

/// Something that can hand out more contiguous memory on request.
///
/// # Safety
///
/// For the allocator to function properly, implementors must guarantee:
///
/// - A successful `grow_heap(size)` returns a pointer to `size` bytes that
///   are readable, writable, and not used by any other code, including the
///   grower itself.
/// - Each successful call returns memory starting exactly where the memory
///   from the previous successful call ended.
/// - A failed call changes nothing.
pub unsafe trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by exactly `size` bytes and return where the new bytes
    /// start.
    fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Write a default grower into `slot`.
    ///
    /// Growers with large inline storage override this so they can be set up
    /// inside a static without passing through the stack.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes and aligned. Any value already there is
    /// overwritten without being dropped.
    unsafe fn write_default(slot: *mut Self)
    where
        Self: Default + Sized,
    {
        slot.write(Self::default())
    }
}

/// Bytes available in a [`ToyHeap`].
pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed array that hands itself out in order, like a tiny `sbrk`.
///
/// A `ToyHeap` must not be moved once it has handed out memory; keep it
/// inside the allocator that owns it.
#[repr(C, align(16))]
pub struct ToyHeap {
    pub heap: [u8; TOY_HEAP_SIZE],
    /// Bytes handed out so far.
    pub size: usize,
    /// Growth beyond this many bytes fails.
    pub limit: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
            limit: TOY_HEAP_SIZE,
        }
    }
}

impl ToyHeap {
    /// A toy heap that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: limit.min(TOY_HEAP_SIZE),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyHeapOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy heap exhausted: requested {} bytes with {} available",
            self.requested, self.available
        )
    }
}

unsafe impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self.limit - self.size;
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        let ptr = unsafe { self.heap.as_mut_ptr().add(self.size) };
        self.size += size;
        // A pointer into an array is never null.
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    // A default ToyHeap is all zeroes apart from its limit.
    unsafe fn write_default(slot: *mut Self) {
        ptr::addr_of_mut!((*slot).heap).write_bytes(0, 1);
        ptr::addr_of_mut!((*slot).size).write(0);
        ptr::addr_of_mut!((*slot).limit).write(TOY_HEAP_SIZE);
    }
}

/// LibcHeapGrower moves the program break to grow the heap.
///
/// The break is only contiguous as long as nothing else in the process
/// calls `brk`/`sbrk`; if something does, the allocator notices and treats
/// the growth as a failure.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcHeapGrower {
    // Just for tracking, not really needed
    bytes: usize,
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl LibcHeapGrower {
    /// Total bytes obtained so far, and in how many calls.
    pub fn grown(&self) -> (usize, usize) {
        (self.bytes, self.growths)
    }
}

#[cfg(feature = "use_libc")]
unsafe impl HeapGrower for LibcHeapGrower {
    type Err = Errno;

    fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        if size > libc::intptr_t::MAX as usize {
            return Err(Errno(libc::ENOMEM));
        }

        let ptr = unsafe { libc::sbrk(size as libc::intptr_t) };
        if ptr as isize == -1 {
            return Err(errno::errno());
        }

        self.bytes += size;
        self.growths += 1;

        NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn toy_heap_is_contiguous() {
        let mut toy = ToyHeap::default();
        let first = toy.grow_heap(24).unwrap();
        let second = toy.grow_heap(40).unwrap();
        assert_eq!(first.as_ptr() as usize % 16, 0);
        assert_eq!(unsafe { first.as_ptr().add(24) }, second.as_ptr());
        assert_eq!(toy.size, 64);
    }

    #[test]
    fn toy_heap_limit() {
        let mut toy = ToyHeap::with_limit(100);
        assert!(toy.grow_heap(64).is_ok());
        let err = toy.grow_heap(64).unwrap_err();
        assert_eq!(
            err,
            ToyHeapOverflowError {
                requested: 64,
                available: 36
            }
        );
        // A failed growth changes nothing.
        assert_eq!(toy.size, 64);
        assert!(toy.grow_heap(36).is_ok());
        log::info!("{}", toy.grow_heap(1).unwrap_err());
    }

    #[test]
    fn toy_heap_written_in_place() {
        let layout = std::alloc::Layout::new::<ToyHeap>();
        unsafe {
            let slot = std::alloc::alloc(layout) as *mut ToyHeap;
            assert!(!slot.is_null());
            // Garbage that the default must overwrite.
            ptr::write_bytes(slot as *mut u8, 0xAB, layout.size());

            ToyHeap::write_default(slot);
            let toy = &mut *slot;
            assert_eq!(toy.size, 0);
            assert_eq!(toy.limit, TOY_HEAP_SIZE);
            assert!(toy.heap.iter().all(|&b| b == 0));
            assert!(toy.grow_heap(TOY_HEAP_SIZE).is_ok());

            std::alloc::dealloc(slot as *mut u8, layout);
        }
    }
}
