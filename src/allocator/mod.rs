//! Managed heap accounting
//!
//! Design: Object storage itself comes from the global allocator (each object
//! is one `Arc` allocation). This module tracks what the managed heap costs:
//! 1. Byte and object counters (lock-free, hot path)
//! 2. Per-type live census (sharded map, rare reads)
//! 3. `MemoryMonitor` seam so a host allocator can drive adaptive collection

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};


/// Memory usage snapshot consumed by the adaptive trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub allocation_count: u64,
    pub deallocation_count: u64,
}

/// Source of memory statistics.
///
/// Hosts that route managed objects through their own allocator implement
/// this and hand it to the collector; otherwise the collector's built-in
/// `AllocationTracker` is used.
pub trait MemoryMonitor: Send + Sync {
    fn usage(&self) -> MemoryUsage;
}

/// Live object count and bytes for one concrete type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeCensus {
    pub live_objects: usize,
    pub live_bytes: usize,
}

/// Lock-free accounting of managed allocations
pub struct AllocationTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    census: DashMap<&'static str, TypeCensus>,
    limit: Option<usize>,
}

impl AllocationTracker {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            census: DashMap::with_capacity(32),
            limit,
        }
    }

    /// Reserve `size` bytes against the heap limit.
    ///
    /// Returns `false` (and reserves nothing) when the limit would be exceeded.
    #[inline]
    pub fn try_reserve(&self, size: usize) -> bool {
        let Some(limit) = self.limit else {
            self.record_reserve(size);
            return true;
        };

        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(size) {
                Some(n) if n <= limit => n,
                _ => return false,
            };
            match self.current.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    #[inline]
    fn record_reserve(&self, size: usize) {
        let now = self.current.fetch_add(size, Ordering::AcqRel) + size;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    /// Give back a reservation that never became an object
    #[inline]
    pub fn unreserve(&self, size: usize) {
        self.current.fetch_sub(size, Ordering::AcqRel);
    }

    /// Record a completed allocation (bytes must already be reserved)
    pub fn on_allocate(&self, type_name: &'static str, size: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.census.entry(type_name).or_default();
        entry.live_objects += 1;
        entry.live_bytes += size;
    }

    /// Record an object's destruction and release its bytes
    pub fn on_deallocate(&self, type_name: &'static str, size: usize) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.current.fetch_sub(size, Ordering::AcqRel);
        if let Some(mut entry) = self.census.get_mut(type_name) {
            entry.live_objects = entry.live_objects.saturating_sub(1);
            entry.live_bytes = entry.live_bytes.saturating_sub(size);
        }
    }

    /// Heap limit in bytes, if any
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Live census for one type
    pub fn census_for(&self, type_name: &str) -> TypeCensus {
        self.census.get(type_name).map(|e| *e.value()).unwrap_or_default()
    }

    /// Snapshot of every type that still has live objects
    pub fn census(&self) -> Vec<(&'static str, TypeCensus)> {
        let mut out: Vec<_> = self
            .census
            .iter()
            .filter(|e| e.value().live_objects > 0)
            .map(|e| (*e.key(), *e.value()))
            .collect();
        out.sort_by(|a, b| b.1.live_bytes.cmp(&a.1.live_bytes));
        out
    }
}

impl MemoryMonitor for AllocationTracker {
    fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            current_bytes: self.current.load(Ordering::Relaxed),
            peak_bytes: self.peak.load(Ordering::Relaxed),
            allocation_count: self.allocations.load(Ordering::Relaxed),
            deallocation_count: self.deallocations.load(Ordering::Relaxed),
        }
    }
}

impl Default for AllocationTracker {
    fn default() -> Self {
        Self::new(None)
    }
}
