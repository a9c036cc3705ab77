//! `colgc`: a page-based, generational, write-barriered, tracing
//! garbage collector core for immutable rope/list/vector/string-buffer
//! data structures.
//!
//! The crate owns memory management only — cell layout, page
//! protection, root tracking, and collection scheduling. It knows
//! nothing about the shape of a rope or a vector; external
//! collaborators describe their types to the collector once, via
//! [`object::register_type`], and the collector calls back into them
//! through [`object::TypeHandlers`] during marking and sweeping.
//!
//! A process using `colgc` calls [`init`] once, joins each mutator
//! thread with [`enter`], and otherwise only touches [`alloc_cells`],
//! [`preserve`]/[`release`], and [`pause_gc`]/[`resume_gc`]. Everything
//! else in this crate exists to make those five calls correct and fast.

pub mod cell;
pub mod collector;
pub mod config;
pub mod error;
pub(crate) mod logging;
pub mod object;
pub mod parent;
pub mod platform;
pub mod pool;
pub mod range;
pub mod root;
pub mod stats;
pub mod thread;
pub mod word;

use std::sync::Arc;
use std::sync::OnceLock;

pub use config::GcConfig;
pub use error::{Domain, ErrorProc, GcError, Result};
pub use object::{TypeHandlers, MAX_USER_TYPE_ID};
pub use stats::{CycleStats, GroupStats};
pub use word::Word;

use thread::{GroupData, ThreadGuard};

static DEFAULT_GROUP: OnceLock<Arc<GroupData>> = OnceLock::new();

thread_local! {
    static MEMBERSHIP: std::cell::RefCell<Option<ThreadGuard>> = std::cell::RefCell::new(None);
}

/// Initialise the default process-wide group with `config`, installing
/// the write-fault handler. Idempotent: a second call is a no-op and
/// does not change an already-running group's configuration. Must run
/// before [`enter`] on any thread.
pub fn init(config: GcConfig) -> Result<()> {
    config.validate().map_err(|e| {
        GcError::InvariantViolated(format!("invalid GcConfig: {e}"))
    })?;
    platform::set_fault_callback(range::on_write_fault);
    platform::install_fault_handler();
    let _ = DEFAULT_GROUP.get_or_init(|| GroupData::new(config));
    Ok(())
}

fn default_group() -> Arc<GroupData> {
    DEFAULT_GROUP
        .get_or_init(|| GroupData::new(GcConfig::default()))
        .clone()
}

/// Join the calling thread to the default group. Must be called once
/// per thread before any other per-thread API in this module. Returns
/// without effect if the thread has already joined.
pub fn enter() {
    MEMBERSHIP.with(|cell| {
        let mut membership = cell.borrow_mut();
        if membership.is_none() {
            *membership = Some(default_group().enter());
        }
    });
}

/// Leave the default group, releasing this thread's membership. Safe
/// to call even if [`enter`] was never called.
pub fn cleanup() {
    MEMBERSHIP.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Allocate `n_cells` contiguous cells in the calling thread's group,
/// triggering a GC cycle first if the allocation-count trigger has
/// fired. A request larger than [`config::AVAILABLE_CELLS_PER_PAGE`]
/// spans a dedicated multi-page group instead of failing.
pub fn alloc_cells(n_cells: usize) -> Result<Word> {
    let addr = default_group().alloc_cells(n_cells)?;
    Ok(Word::from_cell_addr(addr))
}

/// Mark `word` as a root: it and everything reachable from it survives
/// collection regardless of generation, until a matching [`release`].
/// A no-op for immediate words.
pub fn preserve(word: Word) {
    default_group().preserve(word);
}

/// Undo one [`preserve`] of `word`. A no-op for immediate words or for
/// a word not currently preserved.
pub fn release(word: Word) {
    default_group().release(word);
}

/// Disable automatic collection on the calling thread; nests with
/// [`resume_gc`].
pub fn pause_gc() {
    default_group().pause_gc();
}

/// Non-blocking variant of [`pause_gc`]: returns `false` instead of
/// waiting out an in-progress cycle.
pub fn try_pause_gc() -> bool {
    default_group().try_pause_gc()
}

/// Re-enable automatic collection; runs a deferred cycle immediately
/// if the nesting depth has returned to zero and one was pending.
pub fn resume_gc() {
    default_group().resume_gc();
}

/// Register the per-type table (length, child enumeration, optional
/// free hook) the collector needs for `type_id` (spec §6, "the core
/// consumes from external collaborators"). `type_id` must not be
/// [`object::TYPE_FORWARDED`].
pub fn register_type(type_id: u8, handlers: TypeHandlers) {
    object::register_type(type_id, handlers);
}

/// Add `word`'s cell to its pool's sweepable list (spec §6
/// `register_sweepable`): `free_proc` is invoked exactly once, at
/// sweep time, just before the cell is freed. A no-op for immediate
/// words, which the collector never sweeps.
pub fn register_sweepable(word: Word, free_proc: fn(usize)) {
    default_group().register_sweepable(word, free_proc);
}

/// Install a new error hook for the calling thread. See
/// [`error::set_error_proc`].
pub fn set_error_proc(proc: ErrorProc) {
    error::set_error_proc(proc);
}

/// Retrieve the calling thread's current error hook.
pub fn get_error_proc() -> ErrorProc {
    error::get_error_proc()
}

/// Statistics accumulated by the default group across every cycle it
/// has run so far.
pub fn stats() -> GroupStats {
    default_group().stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_enter_alloc_preserve_release_round_trip() {
        init(GcConfig {
            threading_model: config::ThreadingModel::Single,
            ..Default::default()
        })
        .expect("init");
        enter();
        let word = alloc_cells(2).expect("alloc");
        preserve(word);
        release(word);
        cleanup();
    }
}
