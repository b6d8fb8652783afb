//! Concurrent, atomic-accumulator duration timers (observability only).
//!
//! Timer values never influence correctness; they exist so build phases can
//! be profiled without locking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// An atomic nanosecond accumulator, safe to update from multiple threads
/// without a lock.
#[derive(Debug, Default)]
pub struct ConcurrentTimer {
    nanos: AtomicU64,
}

impl ConcurrentTimer {
    /// Creates a zeroed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f`, adding its wall-clock duration to the accumulator, and
    /// returns `f`'s result.
    pub fn measure<R>(&self, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        self.nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        result
    }

    /// Total accumulated duration.
    pub fn total(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

impl Clone for ConcurrentTimer {
    fn clone(&self) -> Self {
        Self {
            nanos: AtomicU64::new(self.nanos.load(Ordering::Relaxed)),
        }
    }
}
