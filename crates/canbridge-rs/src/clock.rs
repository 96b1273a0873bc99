//! Monotonic time source for the protocol task.
//!
//! All timestamps handed around the core are offsets from process start, so
//! they order events within a gateway session but are not wall-clock times.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

fn start() -> Instant {
    *START.get_or_init(Instant::now)
}

/// Microseconds since the gateway started. `lastSeen` stamps are this
/// value divided down to milliseconds.
pub fn now_us() -> u64 {
    start().elapsed().as_micros() as u64
}
