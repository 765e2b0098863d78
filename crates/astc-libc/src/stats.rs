//! Forwarding statistics
//!
//! Per-category call counters plus allocation accounting. The counters are
//! atomics: the core is single-threaded, but the module is process-global
//! and an embedder may call from its own threads.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ids::Category;

/// Live statistics for one libc module instance
#[derive(Debug, Default)]
pub struct LibcStats {
    calls: [AtomicU64; Category::COUNT],
    bytes_allocated: AtomicU64,
    bytes_freed: AtomicU64,
    peak_bytes: AtomicU64,
}

/// Point-in-time copy of the statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Call counts indexed by `Category::index`
    pub calls: [u64; Category::COUNT],
    /// Total bytes handed out by the allocation wrappers
    pub bytes_allocated: u64,
    /// Total bytes returned through `free`/`realloc`
    pub bytes_freed: u64,
    /// High-water mark of live bytes
    pub peak_bytes: u64,
}

impl StatsSnapshot {
    /// Live bytes at snapshot time
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated.saturating_sub(self.bytes_freed)
    }
}

impl LibcStats {
    /// Create zeroed statistics
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            calls: [ZERO; Category::COUNT],
            bytes_allocated: ZERO,
            bytes_freed: ZERO,
            peak_bytes: ZERO,
        }
    }

    /// Record one call in a category
    pub fn count(&self, category: Category) {
        self.calls[category.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record an allocation of `size` bytes
    pub fn add_allocated(&self, size: u64) {
        let allocated = self.bytes_allocated.fetch_add(size, Ordering::Relaxed) + size;
        let live = allocated.saturating_sub(self.bytes_freed.load(Ordering::Relaxed));
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
    }

    /// Record a release of `size` bytes
    pub fn add_freed(&self, size: u64) {
        self.bytes_freed.fetch_add(size, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut calls = [0u64; Category::COUNT];
        for (i, counter) in self.calls.iter().enumerate() {
            calls[i] = counter.load(Ordering::Relaxed);
        }
        StatsSnapshot {
            calls,
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in &self.calls {
            counter.store(0, Ordering::Relaxed);
        }
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.bytes_freed.store(0, Ordering::Relaxed);
        self.peak_bytes.store(0, Ordering::Relaxed);
    }
}
