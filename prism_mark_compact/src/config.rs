//! Collector configuration parameters.
//!
//! All sizes and thresholds are tunable for different workloads.
//! Default values favour short pauses on small to medium heaps.

use crate::value::WORD_SIZE;

/// Configuration for the heap and the mark-compact collector.
///
/// # Example
///
/// ```ignore
/// use prism_mark_compact::GcConfig;
///
/// // Compact aggressively and flush code after two idle cycles
/// let config = GcConfig {
///     compaction_threshold: 10,
///     code_age_threshold: 2,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Geometry
    // =========================================================================
    /// Size of one page in bytes.
    ///
    /// Pages are the unit of allocation, sweeping and evacuation for the
    /// paged spaces. Must be a power of two so that the page owning an
    /// address can be found by masking.
    ///
    /// Default: 16KB
    pub page_size: usize,

    /// Size of each nursery semispace in bytes.
    ///
    /// Total nursery memory is 2x this value. Lazy sweeping stops once it
    /// has freed this many bytes.
    ///
    /// Default: 256KB
    pub nursery_size: usize,

    /// Soft limit on the combined size of the old paged spaces.
    ///
    /// Allocation beyond the limit fails unless the heap is in
    /// always-allocate mode, which the collector enters while evacuating.
    ///
    /// Default: 0 (unlimited)
    pub max_old_space_size: usize,

    /// Objects at least this large go to the large object space.
    ///
    /// Default: half a page
    pub large_object_threshold: usize,

    // =========================================================================
    // Marking
    // =========================================================================
    /// Number of entries in the marking deque.
    ///
    /// Must be a power of two. A small deque overflows more often and
    /// falls back to rescanning the heap for grey objects.
    ///
    /// Default: 4096
    pub marking_deque_capacity: usize,

    /// Treat map transitions as weak edges.
    ///
    /// When enabled, a map reachable only as a transition target dies and
    /// the transition is cleared after marking.
    ///
    /// Default: true
    pub collect_maps: bool,

    /// Collapse flat cons strings while marking.
    ///
    /// Default: true
    pub cons_string_shortcut: bool,

    // =========================================================================
    // Code Flushing
    // =========================================================================
    /// Discard the code of functions that have not run for a while.
    ///
    /// Default: true
    pub flush_code: bool,

    /// Number of cycles a function's code must survive unused before it is
    /// replaced by the lazy-compile stub.
    ///
    /// Default: 5
    pub code_age_threshold: u8,

    // =========================================================================
    // Compaction
    // =========================================================================
    /// Allow evacuation of fragmented pages.
    ///
    /// Default: true
    pub compact: bool,

    /// Percentage of a page's area that must be free before the page
    /// becomes an evacuation candidate.
    ///
    /// Default: 30
    pub compaction_threshold: u8,

    /// Upper bound on evacuation candidates per space and cycle.
    ///
    /// Set to 0 to derive the bound from the page count.
    ///
    /// Default: 0
    pub max_evacuation_candidates: usize,

    /// Pick candidates by alternation instead of fragmentation.
    ///
    /// Every other page is evacuated, with the parity flipping each cycle.
    /// Only useful for testing the evacuation paths.
    ///
    /// Default: false
    pub stress_compaction: bool,

    /// Maximum number of chained slots-buffer blocks per candidate page.
    ///
    /// A candidate whose buffer would grow past this is evicted from the
    /// candidate set.
    ///
    /// Default: 15
    pub slots_buffer_chain_limit: usize,

    // =========================================================================
    // Sweeping
    // =========================================================================
    /// Defer sweeping of old-space pages once enough memory was freed.
    ///
    /// Default: true
    pub lazy_sweeping: bool,

    /// Sweep the old spaces precisely instead of conservatively.
    ///
    /// Default: false
    pub sweep_precisely: bool,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Log a one-line summary of every collection.
    ///
    /// Default: false
    pub trace_gc: bool,

    /// Log the fragmentation of every evacuation candidate.
    ///
    /// Default: false
    pub trace_fragmentation: bool,

    /// Verify heap integrity after marking and after each collection.
    ///
    /// Expensive but useful for debugging collector bugs.
    ///
    /// Default: false (enabled in debug builds)
    pub verify_heap: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            // Geometry
            page_size: 16 * 1024,     // 16KB
            nursery_size: 256 * 1024, // 256KB
            max_old_space_size: 0,    // Unlimited
            large_object_threshold: 8 * 1024,

            // Marking
            marking_deque_capacity: 4096,
            collect_maps: true,
            cons_string_shortcut: true,

            // Code flushing
            flush_code: true,
            code_age_threshold: 5,

            // Compaction
            compact: true,
            compaction_threshold: 30,
            max_evacuation_candidates: 0,
            stress_compaction: false,
            slots_buffer_chain_limit: 15,

            // Sweeping
            lazy_sweeping: true,
            sweep_precisely: false,

            // Debugging
            trace_gc: false,
            trace_fragmentation: false,
            verify_heap: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// Create a configuration optimized for low memory usage.
    pub fn low_memory() -> Self {
        Self {
            nursery_size: 64 * 1024, // 64KB
            compaction_threshold: 15,
            code_age_threshold: 2,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for high throughput.
    pub fn high_throughput() -> Self {
        Self {
            page_size: 64 * 1024,         // 64KB
            nursery_size: 1024 * 1024,    // 1MB
            large_object_threshold: 32 * 1024,
            marking_deque_capacity: 16 * 1024,
            compaction_threshold: 50,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for low latency.
    pub fn low_latency() -> Self {
        Self {
            nursery_size: 128 * 1024, // 128KB (less to sweep before deferring)
            lazy_sweeping: true,
            max_evacuation_candidates: 2,
            ..Default::default()
        }
    }

    /// Create a configuration that exercises every slow path.
    pub fn stress() -> Self {
        Self {
            marking_deque_capacity: 16,
            stress_compaction: true,
            sweep_precisely: true,
            lazy_sweeping: false,
            verify_heap: true,
            ..Default::default()
        }
    }

    /// Size of a page in words.
    #[inline]
    pub fn page_size_in_words(&self) -> usize {
        self.page_size / WORD_SIZE
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < 4096 || !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSizeInvalid);
        }
        if self.nursery_size < self.page_size {
            return Err(ConfigError::NurseryTooSmall);
        }
        if self.nursery_size % self.page_size != 0 {
            return Err(ConfigError::NurseryNotPageMultiple);
        }
        if self.large_object_threshold > self.page_size {
            return Err(ConfigError::LargeObjectThresholdTooLarge);
        }
        if self.marking_deque_capacity < 8 || !self.marking_deque_capacity.is_power_of_two() {
            return Err(ConfigError::DequeCapacityInvalid);
        }
        if self.compaction_threshold == 0 || self.compaction_threshold > 100 {
            return Err(ConfigError::CompactionThresholdInvalid);
        }
        if self.code_age_threshold == 0 {
            return Err(ConfigError::CodeAgeThresholdInvalid);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Page size must be a power of two, minimum 4KB.
    PageSizeInvalid,
    /// Nursery must hold at least one page.
    NurseryTooSmall,
    /// Nursery size must be a multiple of the page size.
    NurseryNotPageMultiple,
    /// Large object threshold must fit in a page.
    LargeObjectThresholdTooLarge,
    /// Deque capacity must be a power of two, minimum 8.
    DequeCapacityInvalid,
    /// Compaction threshold must be a percentage in 1..=100.
    CompactionThresholdInvalid,
    /// Code age threshold must be at least 1.
    CodeAgeThresholdInvalid,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::PageSizeInvalid => {
                write!(f, "page size must be a power of two, minimum 4KB")
            }
            ConfigError::NurseryTooSmall => write!(f, "nursery must hold at least one page"),
            ConfigError::NurseryNotPageMultiple => {
                write!(f, "nursery size must be a multiple of the page size")
            }
            ConfigError::LargeObjectThresholdTooLarge => {
                write!(f, "large object threshold must not exceed the page size")
            }
            ConfigError::DequeCapacityInvalid => {
                write!(f, "marking deque capacity must be a power of two, minimum 8")
            }
            ConfigError::CompactionThresholdInvalid => {
                write!(f, "compaction threshold must be a percentage between 1 and 100")
            }
            ConfigError::CodeAgeThresholdInvalid => {
                write!(f, "code age threshold must be at least 1")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(GcConfig::low_memory().validate().is_ok());
        assert!(GcConfig::high_throughput().validate().is_ok());
        assert!(GcConfig::low_latency().validate().is_ok());
        assert!(GcConfig::stress().validate().is_ok());
    }

    #[test]
    fn test_default_code_age_threshold() {
        assert_eq!(GcConfig::default().code_age_threshold, 5);
    }

    #[test]
    fn test_invalid_page_size() {
        let config = GcConfig {
            page_size: 12 * 1024, // Not power of two
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PageSizeInvalid));
    }

    #[test]
    fn test_invalid_nursery_size() {
        let config = GcConfig {
            nursery_size: 1024,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NurseryTooSmall));

        let config = GcConfig {
            nursery_size: 40 * 1024,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NurseryNotPageMultiple));
    }

    #[test]
    fn test_invalid_deque_capacity() {
        let config = GcConfig {
            marking_deque_capacity: 100,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::DequeCapacityInvalid));
    }

    #[test]
    fn test_invalid_thresholds() {
        let config = GcConfig {
            compaction_threshold: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CompactionThresholdInvalid));

        let config = GcConfig {
            code_age_threshold: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CodeAgeThresholdInvalid));
    }

    #[test]
    fn test_page_size_in_words() {
        let config = GcConfig::default();
        assert_eq!(config.page_size_in_words() * WORD_SIZE, config.page_size);
    }
}
