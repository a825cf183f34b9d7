//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager: it grows one contiguous
//! region through a [`HeapGrower`](../grower/trait.HeapGrower.html), and
//! serves `allocate`, `release` and `resize` from segregated free lists.
//! Because it is not thread-safe, it cannot be used as a global allocator on
//! its own.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` with a spin lock to make it
//! thread-safe, and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! With the `use_libc` feature, a `UnixAllocator` is a `GenericAllocator`
//! backed by `sbrk`, ready to be used as `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::fmt;
use core::mem::MaybeUninit;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, MutexGuard};

use crate::freelist::{Stats, Validity};
#[cfg(feature = "use_libc")]
use crate::grower::LibcHeapGrower;
use crate::grower::HeapGrower;
use crate::heap::{FreeBlock, Heap, TakenBlock, FORMAT_SIZE};
use crate::region::Region;
use crate::resize::ResizePolicy;
use crate::tags::{self, Status, DSIZE, OVERHEAD, WSIZE};

/// Bytes the heap grows by at least, whenever it grows.
pub const CHUNK_SIZE: usize = 1 << 12;

/// The heap could not be grown. Carries the grower's error, if it gave one.
#[derive(Debug)]
pub struct OutOfMemory<E>(pub Option<E>);

impl<E: fmt::Debug> fmt::Display for OutOfMemory<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(err) => write!(f, "out of memory: {:?}", err),
            None => write!(f, "out of memory"),
        }
    }
}

/// A segregated free-list allocator over a single growable region.
///
/// Note: It never returns memory to the grower; the region only grows.
pub struct RawAlloc<G> {
    pub grower: G,
    heap: Option<Heap>,
    policy: ResizePolicy,
    // The byte count of the last resize request, for the resize heuristic.
    last_resize: usize,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc`. Nothing is requested from `grower` until the
    /// first call to [`init`](#method.init) or
    /// [`allocate`](#method.allocate).
    pub fn new(grower: G) -> Self {
        RawAlloc {
            grower,
            heap: None,
            policy: ResizePolicy::default(),
            last_resize: 0,
        }
    }

    /// Create a new `RawAlloc` with the given resize heuristic.
    pub fn with_policy(grower: G, policy: ResizePolicy) -> Self {
        RawAlloc {
            policy,
            ..RawAlloc::new(grower)
        }
    }

    pub fn set_resize_policy(&mut self, policy: ResizePolicy) {
        self.policy = policy;
    }

    pub fn resize_policy(&self) -> ResizePolicy {
        self.policy
    }

    /// Bytes currently managed, including the size-class table and
    /// sentinels. Zero before initialization.
    pub fn heap_size(&self) -> usize {
        self.heap.as_ref().map_or(0, Heap::len)
    }

    /// Audit the heap, and get statistics on it.
    pub fn stats(&self) -> (Validity, Stats) {
        match &self.heap {
            Some(heap) => heap.stats(),
            None => (Validity::default(), Stats::default()),
        }
    }

    /// The formatted heap, if initialized.
    pub fn heap(&self) -> Option<&Heap> {
        self.heap.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn heap_mut(&mut self) -> Option<&mut Heap> {
        self.heap.as_mut()
    }

    ////////////////////////////////////////////////////////////
    // Setup and growth

    /// Set up the heap: size-class table, prologue and epilogue, and a first
    /// free chunk of [`CHUNK_SIZE`] bytes.
    ///
    /// Calling `init` again resets the allocator: every block, including any
    /// still handed out, goes back to the free lists. The region is reused,
    /// never shrunk.
    ///
    /// If the first chunk can't be obtained the heap is still usable, but
    /// empty; later allocations will try to grow it again.
    pub fn init(&mut self) -> Result<(), OutOfMemory<G::Err>> {
        self.last_resize = 0;

        if let Some(heap) = self.heap.as_mut() {
            log::debug!("resetting heap of {} bytes", heap.len());
            if let Some(block) = heap.reset() {
                heap.insert(block);
                self.check();
                return Ok(());
            }
        } else {
            self.heap = Some(self.format()?);
        }

        let block = self.extend(CHUNK_SIZE)?;
        if let Some(heap) = self.heap.as_mut() {
            let block = heap.coalesce(block);
            heap.insert(block);
        }
        self.check();
        Ok(())
    }

    // Get the first bytes from the grower and lay out an empty heap in them.
    fn format(&mut self) -> Result<Heap, OutOfMemory<G::Err>> {
        let start = self
            .grower
            .grow_heap(FORMAT_SIZE)
            .map_err(|e| OutOfMemory(Some(e)))?;

        // Payloads need a double-word aligned base. If the grower didn't give
        // us one, grow a little more and slide the whole layout up.
        let misalignment = start.as_ptr().align_offset(DSIZE);
        if misalignment != 0 {
            log::debug!("heap start {:?} is misaligned by {}", start, misalignment);
            let tail = self
                .grower
                .grow_heap(misalignment)
                .map_err(|e| OutOfMemory(Some(e)))?;
            debug_assert_eq!(tail.as_ptr(), unsafe { start.as_ptr().add(FORMAT_SIZE) });
        }

        // The base is inside the memory just handed to us, so not null.
        let base = unsafe { NonNull::new_unchecked(start.as_ptr().add(misalignment)) };
        log::debug!("formatting heap at {:?}", base);
        Ok(Heap::format(unsafe { Region::from_raw(base, FORMAT_SIZE) }))
    }

    /// Grow the heap by at least `size` bytes, rounded up to an even number
    /// of words, and return the new space as one free block.
    ///
    /// The block is neither coalesced nor listed: the block before the old
    /// epilogue may be free, and merging with it is up to the caller.
    fn extend(&mut self, size: usize) -> Result<FreeBlock, OutOfMemory<G::Err>> {
        let heap = self.heap.as_mut().ok_or(OutOfMemory(None))?;

        let words = (size + WSIZE - 1) / WSIZE;
        let words = words + words % 2;
        let bytes = words * WSIZE;
        if bytes > tags::MAX_BLOCK_SIZE || !heap.region.can_grow(bytes) {
            log::warn!("can't grow heap of {} bytes by {}", heap.len(), bytes);
            return Err(OutOfMemory(None));
        }

        let expected = heap.region.end();
        let start = match self.grower.grow_heap(bytes) {
            Ok(start) => start,
            Err(e) => {
                log::warn!("failed to grow heap by {} bytes: {:?}", bytes, e);
                return Err(OutOfMemory(Some(e)));
            }
        };
        if start != expected {
            log::error!(
                "heap grower returned {:?}, expected {:?}; the heap can't grow",
                start,
                expected
            );
            return Err(OutOfMemory(None));
        }

        log::debug!("grew heap of {} bytes by {}", heap.len(), bytes);
        // The grower promised us these bytes right after the region.
        Ok(unsafe { heap.append(bytes) })
    }

    /// Initialize on first use.
    fn ensure_init(&mut self) -> bool {
        if self.heap.is_some() {
            return true;
        }
        // A failed first chunk still leaves a formatted heap behind.
        let _ = self.init();
        self.heap.is_some()
    }

    /// The block size that serves a request for `bytes`.
    ///
    /// Requests up to a chunk are rounded up to a power of two first, which
    /// keeps freed blocks reusable by the power-of-two size classes. Returns
    /// `None` for requests no block can hold.
    pub fn block_size(bytes: usize) -> Option<usize> {
        let bytes = if bytes <= CHUNK_SIZE {
            bytes.next_power_of_two()
        } else {
            bytes
        };
        tags::block_size_for(bytes)
    }

    ////////////////////////////////////////////////////////////
    // The allocator interface

    /// Allocate at least `bytes` bytes, aligned to 8.
    ///
    /// Returns `None` if `bytes` is zero, larger than any block can be, or if
    /// the heap can't grow enough. A request for zero bytes touches nothing.
    pub fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        let size = match RawAlloc::<G>::block_size(bytes) {
            Some(size) => size,
            None => {
                log::warn!("refusing oversized allocation of {} bytes", bytes);
                return None;
            }
        };
        if !self.ensure_init() {
            return None;
        }

        let ptr = self.allocate_block(size);
        log::trace!("allocate({}) = {:?}", bytes, ptr);
        self.check();
        ptr
    }

    fn allocate_block(&mut self, size: usize) -> Option<NonNull<u8>> {
        let heap = self.heap.as_mut()?;
        if let Some(block) = heap.find(size) {
            heap.remove(block);
            let taken = heap.place(block, size);
            return Some(heap.payload(taken));
        }

        let block = self.extend(cmp::max(size, CHUNK_SIZE)).ok()?;
        let heap = self.heap.as_mut()?;
        let block = heap.coalesce(block);
        let taken = heap.place(block, size);
        Some(heap.payload(taken))
    }

    /// Release an allocation, merging it with free neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` or `resize` on this
    /// allocator, and not released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        log::trace!("release({:?})", ptr);
        let heap = match self.heap.as_mut() {
            Some(heap) => heap,
            None => return,
        };
        let block = heap.block_of(ptr);
        let block = heap.mark_free(block);
        let block = heap.coalesce(block);
        heap.insert(block);
        self.check();
    }

    /// Resize an allocation to `bytes`, keeping its contents up to the
    /// smaller of the old and new sizes.
    ///
    /// A `None` pointer makes this an [`allocate`](#method.allocate); zero
    /// bytes makes it a [`release`](#method.release) and returns `None`.
    /// Shrinks always happen in place. Growth absorbs a free neighbour when
    /// one is big enough, and otherwise moves the data to a new allocation.
    /// If that allocation fails, `None` is returned and the old one is left
    /// untouched.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by `allocate` or `resize` on
    /// this allocator, and not released since.
    pub unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, bytes: usize) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            None => return self.allocate(bytes),
            Some(ptr) => ptr,
        };
        if bytes == 0 {
            self.release(ptr);
            return None;
        }

        let previous = self.last_resize;
        self.last_resize = bytes;

        let result = self.resize_block(ptr, bytes, previous);
        log::trace!("resize({:?}, {}) = {:?}", ptr, bytes, result);
        self.check();
        result
    }

    unsafe fn resize_block(
        &mut self,
        ptr: NonNull<u8>,
        bytes: usize,
        previous: usize,
    ) -> Option<NonNull<u8>> {
        let heap = self.heap.as_mut()?;
        let block = heap.block_of(ptr);
        let capacity = heap.capacity(block);

        if bytes < capacity {
            let size = tags::block_size_for(bytes)?;
            heap.shrink(block, size);
            return Some(ptr);
        }

        let target = self.policy.target(bytes, previous);
        let size = tags::block_size_for(target).or_else(|| tags::block_size_for(bytes))?;
        if size <= heap.size(block.block()) {
            return Some(ptr);
        }

        if let Some(grown) = heap.grow_in_place(block, size) {
            return Some(heap.payload(grown));
        }

        let new_ptr = self.allocate(bytes)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), cmp::min(capacity, bytes));
        self.release(ptr);
        Some(new_ptr)
    }

    // With `extra_assertions`, audit the whole heap after every operation.
    fn check(&self) {
        #[cfg(feature = "extra_assertions")]
        {
            let (validity, stats) = self.stats();
            assert!(
                validity.is_valid(),
                "heap corrupted: {:?} {:?}",
                validity,
                stats
            );
        }
    }
}

impl Heap {
    /// Grow a taken block to `size` bytes using free neighbours, if they are
    /// big enough.
    ///
    /// A free right neighbour alone is preferred, since the payload stays
    /// put. Otherwise a free left neighbour (plus the right one, if free) is
    /// absorbed and the payload moves down to the new start.
    pub(crate) fn grow_in_place(&mut self, block: TakenBlock, size: usize) -> Option<TakenBlock> {
        let current = self.size(block.block());
        let prev = self.as_free(self.prev_block(block.block()));
        let next = self.as_free(self.next_block(block.block()));
        let prev_size = prev.map_or(0, |b| self.size(b.block()));
        let next_size = next.map_or(0, |b| self.size(b.block()));

        if let Some(next) = next {
            if current + next_size >= size {
                self.remove(next);
                self.set_tags(block.block(), current + next_size, Status::Taken);
                return Some(self.carve(block.block(), size));
            }
        }

        let prev = prev?;
        let merged = prev_size + current + next_size;
        if merged < size {
            return None;
        }

        self.remove(prev);
        if let Some(next) = next {
            self.remove(next);
        }
        // Neither new tag overlaps the old payload: the header is before
        // `prev`'s payload and the footer is at or past the old footer.
        self.set_tags(prev.block(), merged, Status::Taken);
        self.region
            .copy_within(block.offset(), prev.offset(), current - OVERHEAD);
        Some(self.carve(prev.block(), size))
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global allocator,
/// so that was easy to add with a spin lock.
///
/// The `RawAlloc` is built in place on first use, so a grower with large
/// inline storage (like [`ToyHeap`](../grower/struct.ToyHeap.html)) never has
/// to fit on the stack.
///
/// The allocator logs through the `log` facade while holding its lock. If it
/// is the global allocator, any installed logger must not allocate.
pub struct GenericAllocator<G> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: Mutex<MaybeUninit<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: Mutex::new(MaybeUninit::uninit()),
        }
    }
}

impl<G: HeapGrower + Default> RawAlloc<G> {
    /// Write a new, uninitialized `RawAlloc` with a default grower into
    /// `slot`, field by field.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes and aligned.
    unsafe fn write_default(slot: *mut RawAlloc<G>) {
        G::write_default(ptr::addr_of_mut!((*slot).grower));
        ptr::addr_of_mut!((*slot).heap).write(None);
        ptr::addr_of_mut!((*slot).policy).write(ResizePolicy::default());
        ptr::addr_of_mut!((*slot).last_resize).write(0);
    }
}

/// Exclusive access to the `RawAlloc` inside a [`GenericAllocator`]. The lock
/// is released when this is dropped.
pub struct RawGuard<'a, G> {
    guard: MutexGuard<'a, MaybeUninit<RawAlloc<G>>>,
}

impl<'a, G> Deref for RawGuard<'a, G> {
    type Target = RawAlloc<G>;

    fn deref(&self) -> &RawAlloc<G> {
        // A RawGuard is only handed out once the slot is written.
        unsafe { self.guard.assume_init_ref() }
    }
}

impl<'a, G> DerefMut for RawGuard<'a, G> {
    fn deref_mut(&mut self) -> &mut RawAlloc<G> {
        unsafe { self.guard.assume_init_mut() }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is in
    /// place.
    pub unsafe fn get_raw(&self) -> RawGuard<'_, G> {
        // The plan:
        // - Check if initialization hasn't started (0)
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {}
            Ok(0) => {
                let mut guard = self.raw.lock();
                RawAlloc::write_default(guard.as_mut_ptr());

                // Let other threads know that the raw allocator is now
                // initialized, and they are free to lock and use it
                self.init.store(2, Ordering::SeqCst);
                return RawGuard { guard };
            }
            Err(1) => loop {
                core::hint::spin_loop();
                match self.init.load(Ordering::SeqCst) {
                    1 => continue,
                    2 => break,
                    state => panic!("Unexpected state {}", state),
                }
            },
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        RawGuard {
            guard: self.raw.lock(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }
}

// Payloads are only ever aligned to a double word.
fn supported(layout: &Layout) -> bool {
    layout.align() <= DSIZE
}

unsafe impl<G: HeapGrower + Default + Send> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !supported(&layout) {
            return null_mut();
        }
        self.get_raw()
            .allocate(layout.size())
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.get_raw().release(ptr)
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !supported(&layout) {
            return null_mut();
        }
        self.get_raw()
            .resize(NonNull::new(ptr), new_size)
            .map_or(null_mut(), NonNull::as_ptr)
    }
}

#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<LibcHeapGrower>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}
