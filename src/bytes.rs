//! Thread-safe accounting of bytes moved on the wire.

use portable_atomic::{AtomicU64, Ordering};

/// Byte counters shared by every I/O component of a run.
///
/// Counters wrap around on overflow; the totals are an estimate of traffic
/// on the wire, not an exact figure.
#[derive(Debug, Default)]
pub struct BytesInfo {
    bytes_down: AtomicU64,
    bytes_up: AtomicU64,
}

impl BytesInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_down(&self, count: u64) {
        self.bytes_down.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_up(&self, count: u64) {
        self.bytes_up.fetch_add(count, Ordering::Relaxed);
    }

    pub fn down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }
}
