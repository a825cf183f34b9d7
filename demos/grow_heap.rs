//! A minimal example of growing the heap by hand with a `HeapGrower`, then
//! handing the grower to an allocator.

use seglist_allocator::{HeapGrower, LibcHeapGrower, RawAlloc};

fn main() {
    // LibcHeapGrower moves the program break with sbrk.
    let mut grower = LibcHeapGrower::default();
    let first = grower.grow_heap(64).unwrap();
    let second = grower.grow_heap(64).unwrap();
    println!("Grew: {:p}, then {:p}", first, second);
    println!(
        "Contiguous: {}",
        second.as_ptr() as usize == first.as_ptr() as usize + 64
    );

    let mut allocator = RawAlloc::new(grower);
    allocator.init().unwrap();
    let ptr = allocator.allocate(1000).unwrap();
    println!("Allocated 1000 bytes at {:p}", ptr);
    println!("Heap size: {}", allocator.heap_size());
    println!("Grower: (bytes, calls) = {:?}", allocator.grower.grown());

    let (validity, stats) = allocator.stats();
    println!("Stats: {:?}", stats);
    assert!(validity.is_valid());
}
