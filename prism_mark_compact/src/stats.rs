//! Collector statistics and phase timing.
//!
//! Tracks allocation volume, pause times, reclaimed memory and the
//! effectiveness of evacuation and code flushing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics about collector activity.
#[derive(Debug)]
pub struct GcStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,

    // =========================================================================
    // Collection Statistics
    // =========================================================================
    /// Number of full mark-compact collections.
    pub full_collections: AtomicU64,
    /// Total time spent in full collections (nanoseconds).
    pub full_gc_time_ns: AtomicU64,
    /// Objects marked live in the last cycle.
    pub objects_marked: AtomicU64,
    /// Bytes returned to free lists by sweeping.
    pub bytes_swept: AtomicU64,
    /// Times the marking deque overflowed.
    pub deque_overflows: AtomicU64,

    // =========================================================================
    // Evacuation Statistics
    // =========================================================================
    /// Pages evacuated and released.
    pub pages_evacuated: AtomicU64,
    /// Candidate pages evicted because their slots buffer overflowed.
    pub candidates_evicted: AtomicU64,
    /// Objects relocated by evacuation (including nursery survivors).
    pub objects_moved: AtomicU64,
    /// Total bytes promoted from the nursery.
    pub bytes_promoted: AtomicU64,
    /// Total objects promoted from the nursery.
    pub objects_promoted: AtomicU64,

    // =========================================================================
    // Code Flushing
    // =========================================================================
    /// Functions whose code was replaced by the lazy-compile stub.
    pub code_flushed: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicU64::new(0),
            objects_allocated: AtomicU64::new(0),
            full_collections: AtomicU64::new(0),
            full_gc_time_ns: AtomicU64::new(0),
            objects_marked: AtomicU64::new(0),
            bytes_swept: AtomicU64::new(0),
            deque_overflows: AtomicU64::new(0),
            pages_evacuated: AtomicU64::new(0),
            candidates_evicted: AtomicU64::new(0),
            objects_moved: AtomicU64::new(0),
            bytes_promoted: AtomicU64::new(0),
            objects_promoted: AtomicU64::new(0),
            code_flushed: AtomicU64::new(0),
        }
    }

    /// Record an allocation.
    #[inline]
    pub fn record_allocation(&self, size: usize) {
        self.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a full collection.
    pub fn record_full_gc(&self, duration: Duration) {
        self.full_collections.fetch_add(1, Ordering::Relaxed);
        self.full_gc_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record promotion from the nursery to an old space.
    #[inline]
    pub fn record_promotion(&self, bytes: usize) {
        self.bytes_promoted.fetch_add(bytes as u64, Ordering::Relaxed);
        self.objects_promoted.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter.
    #[inline]
    pub fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter.
    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Get total collection time.
    pub fn total_gc_time(&self) -> Duration {
        Duration::from_nanos(self.full_gc_time_ns.load(Ordering::Relaxed))
    }

    /// Get average full collection pause.
    pub fn avg_full_pause(&self) -> Duration {
        let count = self.full_collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.full_gc_time_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / count)
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        for counter in [
            &self.bytes_allocated,
            &self.objects_allocated,
            &self.full_collections,
            &self.full_gc_time_ns,
            &self.objects_marked,
            &self.bytes_swept,
            &self.deque_overflows,
            &self.pages_evacuated,
            &self.candidates_evicted,
            &self.objects_moved,
            &self.bytes_promoted,
            &self.objects_promoted,
            &self.code_flushed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Human-readable summary of the statistics.
    pub fn summary(&self) -> String {
        format!(
            "allocations: {} objects, {}; collections: {} ({:?} total, {:?} avg); \
             swept: {}; evacuated pages: {} ({} evicted); moved: {} objects; \
             promoted: {} objects, {}; code flushed: {}; deque overflows: {}",
            self.objects_allocated.load(Ordering::Relaxed),
            format_bytes(self.bytes_allocated.load(Ordering::Relaxed)),
            self.full_collections.load(Ordering::Relaxed),
            self.total_gc_time(),
            self.avg_full_pause(),
            format_bytes(self.bytes_swept.load(Ordering::Relaxed)),
            self.pages_evacuated.load(Ordering::Relaxed),
            self.candidates_evicted.load(Ordering::Relaxed),
            self.objects_moved.load(Ordering::Relaxed),
            self.objects_promoted.load(Ordering::Relaxed),
            format_bytes(self.bytes_promoted.load(Ordering::Relaxed)),
            self.code_flushed.load(Ordering::Relaxed),
            self.deque_overflows.load(Ordering::Relaxed),
        )
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes in human-readable form.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Timer for measuring collector phases.
pub struct GcTimer {
    start: Instant,
    label: &'static str,
}

impl GcTimer {
    /// Start a new timer with the given label.
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Stop the timer and return the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        log::debug!("gc phase {}: {:?}", self.label, elapsed);
        elapsed
    }
}
