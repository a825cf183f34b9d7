//! How much room to reserve when a block is resized.
//!
//! Repeatedly growing a buffer by a little at a time would otherwise copy it
//! on almost every call. When a resize is not a shrink, the allocator asks
//! for a little more than the caller did, based on how far this request is
//! from the previous resize request:
//!
//! - a jump of [`LARGE_DELTA`] bytes or more rounds the request up to the
//!   next multiple of [`ROUND_STEP`];
//! - a smaller step rounds it up to the next power of two, so a buffer grown
//!   in small increments doubles its reservation.
//!
//! This is purely a performance heuristic; `ResizePolicy::Exact` turns it off.

/// Changes of at least this many bytes count as a jump.
pub const LARGE_DELTA: usize = 1 << 10;

/// Granularity of the slack added after a jump.
pub const ROUND_STEP: usize = 1000;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Reserve slack based on the size of the change.
    #[default]
    Buffered,
    /// Reserve exactly what was asked for.
    Exact,
}

impl ResizePolicy {
    /// The number of payload bytes to reserve for a resize to `bytes`, given
    /// the previous resize request.
    pub fn target(self, bytes: usize, previous: usize) -> usize {
        match self {
            ResizePolicy::Exact => bytes,
            ResizePolicy::Buffered => {
                let delta = if bytes > previous {
                    bytes - previous
                } else {
                    previous - bytes
                };
                let buffered = if delta >= LARGE_DELTA {
                    round_up(bytes, ROUND_STEP)
                } else {
                    bytes.checked_next_power_of_two()
                };
                buffered.unwrap_or(bytes)
            }
        }
    }
}

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}
