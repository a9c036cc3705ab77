//! Error Module - taxonomy and the error-hook dispatch (spec §7).
//!
//! The core never panics or unwinds across its public API. Every
//! recoverable error path goes through [`report`], which calls the
//! thread-local error hook; callers then receive a sentinel value
//! (nil word, zero length) unless the hook opts to continue as if the
//! check had passed. Fatal errors always abort after the hook runs.

use std::cell::RefCell;
use thiserror::Error;

/// One of the four error classes spec §7 defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Address-range reservation, page commit/decommit/protect, or an
    /// invariant-check failure. The process aborts after the hook runs.
    Fatal,
    /// Recoverable at the API layer but not at the core's layer (e.g.
    /// releasing a word that was never preserved).
    Error,
    /// An API consumed a word of the wrong kind.
    TypeCheck,
    /// An API was passed an out-of-range index or overflowing length.
    ValueCheck,
}

/// Structured error code paired with a human-readable message, passed
/// to the error hook and also carried by [`GcError`] for callers that
/// want to match on it directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcError {
    #[error("address-range reservation failed: {0}")]
    RangeReservationFailed(String),
    #[error("page operation failed: {0}")]
    PageOperationFailed(String),
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
    #[error("unknown root word")]
    UnknownRoot,
    #[error("word is not of the expected kind")]
    TypeMismatch,
    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: usize, length: usize },
    #[error("requested length {0} would overflow")]
    LengthOverflow(usize),
    #[error("no free range could satisfy an allocation of {0} pages")]
    OutOfAddressSpace(usize),
}

impl GcError {
    /// Which error-taxonomy domain this error belongs to.
    pub fn domain(&self) -> Domain {
        match self {
            GcError::RangeReservationFailed(_)
            | GcError::PageOperationFailed(_)
            | GcError::InvariantViolated(_) => Domain::Fatal,
            GcError::UnknownRoot => Domain::Error,
            GcError::TypeMismatch => Domain::TypeCheck,
            GcError::IndexOutOfBounds { .. } | GcError::LengthOverflow(_) => Domain::ValueCheck,
            GcError::OutOfAddressSpace(_) => Domain::Fatal,
        }
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, GcError>;

/// A hook invoked for every reportable event. Returning `true` tells the
/// core to proceed as if the check had passed (useful only for testing
/// a stricter hook); returning `false` (the default) makes the caller
/// receive a sentinel.
pub type ErrorProc = fn(domain: Domain, error: &GcError) -> bool;

fn default_error_proc(domain: Domain, error: &GcError) -> bool {
    eprintln!("colgc: [{domain:?}] {error}");
    if matches!(domain, Domain::Fatal) {
        std::process::abort();
    }
    false
}

thread_local! {
    static ERROR_PROC: RefCell<ErrorProc> = RefCell::new(default_error_proc);
}

/// Install a new error hook for the calling thread.
pub fn set_error_proc(proc: ErrorProc) {
    ERROR_PROC.with(|cell| *cell.borrow_mut() = proc);
}

/// Retrieve the calling thread's current error hook.
pub fn get_error_proc() -> ErrorProc {
    ERROR_PROC.with(|cell| *cell.borrow())
}

/// Report an error through the calling thread's hook. Returns `true` if
/// the caller should proceed as though the check had passed.
///
/// Fatal errors call the hook and then abort regardless of its return
/// value; [`default_error_proc`] already aborts, but a custom hook that
/// does not abort on `Fatal` is still followed by an abort here so a
/// user-installed hook cannot accidentally turn a fatal condition into a
/// silent continuation.
pub fn report(error: GcError) -> bool {
    let domain = error.domain();
    let proceed = ERROR_PROC.with(|cell| (cell.borrow())(domain, &error));
    if matches!(domain, Domain::Fatal) {
        std::process::abort();
    }
    proceed
}
