//! Configuration Module - GC Tuning Parameters
//!
//! Central home for every tunable named in the collector specification:
//! generation count, generational trigger factor, promotion fill ratio,
//! and the page-allocation thresholds that schedule a GC cycle.

use std::time::Duration;

/// Number of bits making up a machine word on this target.
#[cfg(target_pointer_width = "64")]
pub const SIZE_BIT: u32 = 64;
#[cfg(target_pointer_width = "32")]
pub const SIZE_BIT: u32 = 32;

/// Cell size in bytes: 32 on 64-bit systems, 16 on 32-bit.
#[cfg(target_pointer_width = "64")]
pub const CELL_SIZE: usize = 32;
#[cfg(target_pointer_width = "32")]
pub const CELL_SIZE: usize = 16;

/// Logical page size in bytes: 4 KiB on 64-bit systems, 1 KiB on 32-bit.
#[cfg(target_pointer_width = "64")]
pub const PAGE_SIZE: usize = 4096;
#[cfg(target_pointer_width = "32")]
pub const PAGE_SIZE: usize = 1024;

/// Number of cells per logical page (`PAGE_SIZE / CELL_SIZE`).
pub const CELLS_PER_PAGE: usize = PAGE_SIZE / CELL_SIZE;

/// Cell 0 of every page is reserved for page metadata (§3 invariant 8).
pub const RESERVED_CELLS: usize = 1;

/// Cells available to the mutator within one logical page.
pub const AVAILABLE_CELLS_PER_PAGE: usize = CELLS_PER_PAGE - RESERVED_CELLS;

/// Number of logical pages above which a cell group is allocated in its
/// own dedicated address range (no free cells remain after allocation).
/// 128 logical pages is 512 KiB on a 64-bit build.
pub const LARGE_PAGE_SIZE: usize = 128;

/// Maximum number of generations tracked by a group (0 reserved, 1 eden,
/// 2..GC_MAX_GENERATIONS-1 older generations).
pub const GC_MAX_GENERATIONS: u8 = 6;

/// Generation index for newly allocated cells. Generation 0 is
/// reserved and never populated, matching the reference
/// implementation's generation numbering.
pub const EDEN_GENERATION: u8 = 1;

/// Default generational factor: generation `k+1` is collected once every
/// `GC_GEN_FACTOR` collections of generation `k`.
pub const GC_GEN_FACTOR: u32 = 10;

/// Default fill-ratio threshold above which a generation's pool is
/// promoted via compaction instead of whole-page splicing.
pub const PROMOTE_PAGE_FILL_RATIO: f64 = 0.90;

/// Lower clamp for the page-allocation GC trigger.
pub const GC_MIN_PAGE_ALLOC: u32 = 64;

/// Upper clamp for the page-allocation GC trigger.
pub const GC_MAX_PAGE_ALLOC: u32 = 1024;

/// The page-allocation count a pool must reach since its last GC
/// before a new cycle triggers, per spec §4.7 "Trigger": the previous
/// cycle's allocation volume clamped into the group's own configured
/// `[gc_min_page_alloc, gc_max_page_alloc]` window, rather than the
/// module-level defaults, so a config built with a tighter window (as
/// tests do, to force deterministic cycles) actually takes effect. A
/// quiet group whose last cycle allocated nothing still gets at least
/// `min`; a bursty one is capped at `max` instead of letting a single
/// large cycle push the next trigger arbitrarily far out.
pub fn gc_threshold(prev_alloc: u32, min: u32, max: u32) -> u32 {
    prev_alloc.clamp(min.min(max), min.max(max))
}

/// Minimum size (in system pages) of the first general address range.
pub const INITIAL_RANGE_PAGES: usize = 1024;

/// Cap on general address-range growth (in system pages), beyond which
/// new ranges stop doubling and are allocated at this fixed size.
pub const MAX_RANGE_PAGES: usize = 1 << 20;

/// Threading model selected per thread at [`crate::thread::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingModel {
    /// No other threads share the group; no synchronisation primitives
    /// are created and `resume_gc` runs the collector inline.
    Single,
    /// One mutator thread plus a dedicated collector thread per group.
    Async,
    /// Multiple mutator threads per group, mutex-protected registries,
    /// and a dedicated collector thread.
    Shared,
}

/// Top-level configuration for the collector core.
///
/// Most fields have sensible defaults grounded in the reference
/// implementation's compile-time constants; all are safe to override
/// for testing (e.g. to force GC on every allocation).
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Generational factor: see [`GC_GEN_FACTOR`].
    pub gen_factor: u32,

    /// Fill-ratio threshold for promotion-compaction: see
    /// [`PROMOTE_PAGE_FILL_RATIO`].
    pub promote_fill_ratio: f64,

    /// Lower clamp for the GC trigger threshold.
    pub gc_min_page_alloc: u32,

    /// Upper clamp for the GC trigger threshold.
    pub gc_max_page_alloc: u32,

    /// Number of logical pages above which an allocation gets a
    /// dedicated address range: see [`LARGE_PAGE_SIZE`].
    pub large_page_size: usize,

    /// Threading model for the calling thread's group.
    pub threading_model: ThreadingModel,

    /// Enable verbose `log` output for GC cycles and page/range churn.
    pub verbose: bool,

    /// If set, forces a collector handshake timeout instead of blocking
    /// forever; intended for tests only (spec §5 has no GC-layer
    /// timeout in production).
    pub test_handshake_timeout: Option<Duration>,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            gen_factor: GC_GEN_FACTOR,
            promote_fill_ratio: PROMOTE_PAGE_FILL_RATIO,
            gc_min_page_alloc: GC_MIN_PAGE_ALLOC,
            gc_max_page_alloc: GC_MAX_PAGE_ALLOC,
            large_page_size: LARGE_PAGE_SIZE,
            threading_model: ThreadingModel::Single,
            verbose: false,
            test_handshake_timeout: None,
        }
    }
}

impl GcConfig {
    /// Validate configuration, returning a descriptive error for any
    /// out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gen_factor == 0 {
            return Err(ConfigError::InvalidGenFactor(
                "gen_factor must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.promote_fill_ratio) {
            return Err(ConfigError::InvalidFillRatio(
                "promote_fill_ratio must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.gc_min_page_alloc == 0 {
            return Err(ConfigError::InvalidThreshold(
                "gc_min_page_alloc must be > 0".to_string(),
            ));
        }
        if self.gc_min_page_alloc > self.gc_max_page_alloc {
            return Err(ConfigError::InvalidThreshold(
                "gc_min_page_alloc cannot exceed gc_max_page_alloc".to_string(),
            ));
        }
        if self.large_page_size == 0 {
            return Err(ConfigError::InvalidThreshold(
                "large_page_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build configuration from environment variables, overriding
    /// defaults: `COLGC_VERBOSE`, `COLGC_GEN_FACTOR`, `COLGC_FILL_RATIO`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("COLGC_GEN_FACTOR") {
            if let Ok(f) = val.parse::<u32>() {
                config.gen_factor = f;
            }
        }
        if let Ok(val) = std::env::var("COLGC_FILL_RATIO") {
            if let Ok(f) = val.parse::<f64>() {
                config.promote_fill_ratio = f;
            }
        }
        if let Ok(val) = std::env::var("COLGC_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }
}

/// Error type for invalid [`GcConfig`] values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid generational factor: {0}")]
    InvalidGenFactor(String),
    #[error("invalid fill ratio: {0}")]
    InvalidFillRatio(String),
    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_gen_factor_is_invalid() {
        let config = GcConfig {
            gen_factor: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cells_per_page_matches_spec() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(CELLS_PER_PAGE, 128);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(CELLS_PER_PAGE, 64);
        assert_eq!(AVAILABLE_CELLS_PER_PAGE, CELLS_PER_PAGE - 1);
    }

    #[test]
    fn gc_threshold_clamps_previous_allocation_into_the_configured_window() {
        // Below the window: clamped up to the minimum.
        assert_eq!(gc_threshold(0, GC_MIN_PAGE_ALLOC, GC_MAX_PAGE_ALLOC), GC_MIN_PAGE_ALLOC);
        // Above the window: clamped down to the maximum.
        assert_eq!(
            gc_threshold(GC_MAX_PAGE_ALLOC * 2, GC_MIN_PAGE_ALLOC, GC_MAX_PAGE_ALLOC),
            GC_MAX_PAGE_ALLOC
        );
        // Inside the window: passed through unchanged.
        assert_eq!(gc_threshold(100, GC_MIN_PAGE_ALLOC, GC_MAX_PAGE_ALLOC), 100);
        // A single-page window always triggers after exactly one page.
        assert_eq!(gc_threshold(5, 1, 1), 1);
    }
}
