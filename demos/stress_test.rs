//! Runs the allocator as the global allocator under a resize-heavy workload.
//!
//! A pool of byte buffers is grown, shrunk, and dropped at random. Growth
//! mixes small steps with large jumps so both branches of the resize slack
//! heuristic get used. Every buffer is filled with a pattern derived from
//! its id, and checked before it changes. Every so often the free-list shape
//! is reported.

use seglist_allocator::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Buffers alive at once
const BUFFERS: usize = 256;
// Total resize / drop operations
const STEPS: usize = 64 * 1024;
// Largest single jump in bytes
const MAX_JUMP: usize = 64 * 1024;

struct Buffer {
    id: u8,
    bytes: Vec<u8>,
}

impl Buffer {
    fn new(id: u8) -> Self {
        Buffer {
            id,
            bytes: Vec::new(),
        }
    }

    fn pattern(&self, i: usize) -> u8 {
        self.id.wrapping_mul(31).wrapping_add(i as u8)
    }

    fn resize(&mut self, len: usize) {
        let old = self.bytes.len();
        self.bytes.resize(len, 0);
        for i in old..len {
            let b = self.pattern(i);
            self.bytes[i] = b;
        }
        if len < old / 4 {
            // Give the tail back, through an in-place shrink.
            self.bytes.shrink_to_fit();
        }
    }

    fn check(&self) {
        for (i, &b) in self.bytes.iter().enumerate() {
            assert_eq!(b, self.pattern(i), "buffer {} corrupted at {}", self.id, i);
        }
    }
}

#[derive(Default)]
struct Counts {
    small_steps: usize,
    jumps: usize,
    shrinks: usize,
    drops: usize,
}

fn report(step: usize, buffers: &[Buffer], counts: &Counts) {
    let (validity, stats) = ALLOCATOR.stats();
    assert!(validity.is_valid(), "{:?}", validity);

    let live: usize = buffers.iter().map(|b| b.bytes.capacity()).sum();
    let mean_free = stats.free_bytes.checked_div(stats.free_blocks).unwrap_or(0);
    println!("Step {}", step);
    println!(
        "    small steps {}, jumps {}, shrinks {}, drops {}",
        counts.small_steps, counts.jumps, counts.shrinks, counts.drops
    );
    println!(
        "    heap {} bytes, {} live in buffers",
        stats.heap_size, live
    );
    println!(
        "    free lists: {} blocks, {} bytes, mean block {} bytes",
        stats.free_blocks, stats.free_bytes, mean_free
    );
    println!(
        "    taken: {} blocks, {} bytes",
        stats.taken_blocks, stats.taken_bytes
    );
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [STEPS] [SEED]", args[0]);
        return;
    }
    let steps: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(STEPS);
    let seed: u64 = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| rand::thread_rng().next_u64());

    // No logger: the allocator logs while holding its lock, and most loggers
    // allocate.
    println!("Running resize stress test: {} steps, seed {}", steps, seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut buffers: Vec<Buffer> = (0..BUFFERS).map(|i| Buffer::new(i as u8)).collect();
    let mut counts = Counts::default();
    let pick = Uniform::new(0, BUFFERS);
    let small = Uniform::new_inclusive(1usize, 256);
    let jump = Uniform::new_inclusive(1024usize, MAX_JUMP);

    for step in 1..=steps {
        let buffer = &mut buffers[pick.sample(&mut rng)];
        buffer.check();

        let len = buffer.bytes.len();
        match rng.gen_range(0..10) {
            0..=5 => {
                buffer.resize(len + small.sample(&mut rng));
                counts.small_steps += 1;
            }
            6 => {
                buffer.resize(len + jump.sample(&mut rng));
                counts.jumps += 1;
            }
            7 | 8 => {
                buffer.resize(len / rng.gen_range(2..8));
                counts.shrinks += 1;
            }
            _ => {
                *buffer = Buffer::new(buffer.id);
                counts.drops += 1;
            }
        }

        if step % 4096 == 0 {
            report(step, &buffers, &counts);
        }
    }

    for buffer in &buffers {
        buffer.check();
    }
    drop(buffers);

    println!("\nFinished.");
    report(steps, &[], &counts);
}
