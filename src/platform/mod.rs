//! Platform Page Primitives (spec §4.1).
//!
//! Reserves/releases virtual address ranges, commits/decommits pages,
//! toggles read-only protection, and installs the write-fault handler
//! that converts a store into a protected page into a parent-tracking
//! event. Everything above this module is OS-agnostic; this is the
//! only place `cfg(unix)`/`cfg(windows)` appears.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

use crate::error::{GcError, Result};
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

lazy_static! {
    static ref SYSTEM_PAGE_SIZE: usize = page_size::get();
}

/// The OS's native page size, queried once at first use.
pub fn system_page_size() -> usize {
    *SYSTEM_PAGE_SIZE
}

/// The OS's reservation granularity: a multiple of [`system_page_size`]
/// that `reserve_range` requests must respect. On most Unix targets
/// this equals the page size; on Windows it is typically 64 KiB.
pub fn alloc_granularity() -> usize {
    sys::alloc_granularity()
}

/// `log2(system_page_size())`, used to convert between addresses and
/// page indices without a division.
pub fn shift_page() -> u32 {
    system_page_size().trailing_zeros()
}

/// Reserve (and optionally commit) `n_pages` of contiguous virtual
/// address space, in units of [`system_page_size`]. Returns the base
/// address.
pub fn reserve_range(n_pages: usize, commit: bool) -> Result<usize> {
    sys::reserve(n_pages * system_page_size(), commit)
        .map_err(|e| GcError::RangeReservationFailed(e.to_string()))
}

/// Release a reservation made by [`reserve_range`]. The caller
/// guarantees no live cells remain in the range.
pub fn release_range(base: usize, n_pages: usize) -> Result<()> {
    sys::release(base, n_pages * system_page_size())
        .map_err(|e| GcError::PageOperationFailed(e.to_string()))
}

/// Make a sub-range of a reservation readable and writable.
pub fn commit_pages(addr: usize, n_pages: usize) -> Result<()> {
    sys::commit(addr, n_pages * system_page_size())
        .map_err(|e| GcError::PageOperationFailed(e.to_string()))
}

/// Return a sub-range of a reservation to an unbacked state.
pub fn decommit_pages(addr: usize, n_pages: usize) -> Result<()> {
    sys::decommit(addr, n_pages * system_page_size())
        .map_err(|e| GcError::PageOperationFailed(e.to_string()))
}

/// Set a sub-range of a reservation read-only (`protect = true`) or
/// read-write (`protect = false`).
pub fn protect_pages(addr: usize, n_pages: usize, protect: bool) -> Result<()> {
    sys::protect(addr, n_pages * system_page_size(), protect)
        .map_err(|e| GcError::PageOperationFailed(e.to_string()))
}

/// Callback invoked by the fault handler with the faulting address.
/// Returns `true` if the address belonged to a known protected range
/// and has been unprotected (the faulting store should be retried);
/// `false` if the address is unknown and the fault should propagate.
pub type FaultCallback = fn(fault_addr: usize) -> bool;

static FAULT_CALLBACK: AtomicUsize = AtomicUsize::new(0);
static HANDLER_INSTALLED: AtomicU32 = AtomicU32::new(0);

/// Register the callback the fault handler invokes. Must be called
/// before [`install_fault_handler`] (or again to replace it).
pub fn set_fault_callback(cb: FaultCallback) {
    FAULT_CALLBACK.store(cb as usize, Ordering::SeqCst);
}

pub(crate) fn dispatch_fault(addr: usize) -> bool {
    let ptr = FAULT_CALLBACK.load(Ordering::SeqCst);
    if ptr == 0 {
        return false;
    }
    // SAFETY: only ever stored from `set_fault_callback`, which takes a
    // `FaultCallback` value, so the bit pattern is a valid fn pointer
    // of that type.
    let cb: FaultCallback = unsafe { std::mem::transmute(ptr) };
    cb(addr)
}

/// Install the write-fault handler for this process. Idempotent: a
/// second call is a no-op. Must be called once before any page is
/// protected via [`protect_pages`].
pub fn install_fault_handler() {
    if HANDLER_INSTALLED
        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        sys::install_handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_page_size_is_positive_power_of_two() {
        let sz = system_page_size();
        assert!(sz > 0);
        assert_eq!(sz & (sz - 1), 0);
    }

    #[test]
    fn reserve_commit_protect_release_round_trip() {
        let base = reserve_range(4, true).expect("reserve");
        protect_pages(base, 4, true).expect("protect");
        protect_pages(base, 4, false).expect("unprotect");
        decommit_pages(base, 4).expect("decommit");
        release_range(base, 4).expect("release");
    }
}
