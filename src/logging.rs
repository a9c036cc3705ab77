//! Logging Module - thin wrapper over the `log` crate.
//!
//! The core does not install a subscriber; it only emits records at GC
//! cycle boundaries and page/range churn points, gated behind
//! [`crate::config::GcConfig::verbose`] so a quiet default build does
//! not pay for string formatting on hot allocation paths.

use crate::config::GcConfig;

/// Emit a `debug`-level record if `config.verbose` is set, else a
/// `trace`-level record unconditionally (cheap, usually filtered out by
/// the installed logger).
macro_rules! gc_log {
    ($config:expr, $($arg:tt)+) => {
        if $config.verbose {
            log::debug!($($arg)+);
        } else {
            log::trace!($($arg)+);
        }
    };
}

pub(crate) use gc_log;

/// Log the start of a GC cycle.
pub(crate) fn log_cycle_start(config: &GcConfig, max_collected_generation: u8) {
    gc_log!(config, "gc: cycle start, max_collected_generation={max_collected_generation}");
}

/// Log the end of a GC cycle with summary counters.
pub(crate) fn log_cycle_end(config: &GcConfig, cells_freed: usize, pages_freed: usize) {
    gc_log!(config, "gc: cycle end, cells_freed={cells_freed}, pages_freed={pages_freed}");
}

/// Log a write fault converted into a parent-tracking event.
pub(crate) fn log_write_fault(config: &GcConfig, page_addr: usize) {
    gc_log!(config, "gc: write fault on page {page_addr:#x}, marking dirty");
}

/// Log growth of the general address-range list.
pub(crate) fn log_range_growth(config: &GcConfig, pages: usize) {
    gc_log!(config, "gc: reserving new address range of {pages} pages");
}
