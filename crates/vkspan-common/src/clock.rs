//! Monotonic CPU clock for submission timestamps.
//!
//! All CPU-side timestamps the layer emits come from this one clock so they
//! are mutually comparable. The epoch is the first call in the process.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the process-local epoch. Monotonic, never goes back.
pub fn monotonic_ns() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}
