#![cfg_attr(not(test), no_std)]

//! A segregated free-list memory allocator.
//!
//! The allocator manages one contiguous region that only ever grows, obtained
//! piece by piece from a [`HeapGrower`](grower/trait.HeapGrower.html) in the
//! manner of `sbrk`. Every block in the region carries a boundary tag at each
//! end, so a freed block can find and merge with its free neighbours in
//! constant time. Free blocks are kept in one list per power-of-two size
//! class, each sorted by descending size, so finding a fit is a short walk
//! from the class of the request upward.
//!
//! The main entry point is [`RawAlloc`](allocators/struct.RawAlloc.html), a
//! single-threaded allocator with `init`, `allocate`, `release` and `resize`.
//! [`GenericAllocator`](allocators/struct.GenericAllocator.html) puts it
//! behind a spin lock and implements `GlobalAlloc`.
//!
//! ```
//! use seglist_allocator::{RawAlloc, ToyHeap};
//!
//! let mut allocator = RawAlloc::new(ToyHeap::default());
//! allocator.init().unwrap();
//!
//! let ptr = allocator.allocate(100).unwrap();
//! assert_eq!(ptr.as_ptr() as usize % 8, 0);
//! unsafe { allocator.release(ptr) };
//!
//! let (validity, stats) = allocator.stats();
//! assert!(validity.is_valid());
//! assert_eq!(stats.taken_blocks, 0);
//! ```

pub mod allocators;
pub mod grower;
pub mod heap;
pub mod region;
pub mod resize;
pub mod size_class;
pub mod tags;

mod coalesce;
mod freelist;
mod place;

pub use crate::allocators::{GenericAllocator, OutOfMemory, RawAlloc, RawGuard, CHUNK_SIZE};
#[cfg(feature = "use_libc")]
pub use crate::allocators::UnixAllocator;
pub use crate::freelist::{ClassIter, Stats, Validity};
#[cfg(feature = "use_libc")]
pub use crate::grower::LibcHeapGrower;
pub use crate::grower::{HeapGrower, ToyHeap, ToyHeapOverflowError};
pub use crate::resize::ResizePolicy;
