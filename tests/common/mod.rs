//! Shared test harness: a minimal "cons cell" type (one `Word` field)
//! registered with the collector so integration tests can exercise
//! marking, sweeping, and the write barrier without needing a real
//! rope/list/vector implementation.

use colgc::config::{GcConfig, ThreadingModel};
use colgc::object::TypeHandlers;
use colgc::word::Word;

pub const CONS_TYPE: u8 = 1;

/// Offset of the single `Word` field within a cons cell, past the
/// one-byte type id. Aligned well within `CELL_SIZE` on every
/// supported target.
const FIELD_OFFSET: usize = 8;

fn cons_cell_count(_header_addr: usize) -> usize {
    1
}

fn cons_children(header_addr: usize, visit: &mut dyn FnMut(Word)) {
    let raw = unsafe { std::ptr::read_unaligned((header_addr + FIELD_OFFSET) as *const usize) };
    visit(Word::from_raw(raw));
}

pub fn register_cons_type() {
    colgc::register_type(
        CONS_TYPE,
        TypeHandlers {
            cell_count: cons_cell_count,
            children: cons_children,
            length: None,
            free_hook: None,
        },
    );
}

/// Initialise a cons cell at `addr` (as returned by `alloc_cells`)
/// with `field` as its single reference.
///
/// # Safety
/// `addr` must be a live, writable cell at least `FIELD_OFFSET +
/// size_of::<usize>()` bytes long.
pub unsafe fn init_cons(addr: usize, field: Word) {
    colgc::object::set_type_id(addr, CONS_TYPE);
    std::ptr::write_unaligned((addr + FIELD_OFFSET) as *mut usize, field.raw());
}

/// Read back a cons cell's field.
///
/// # Safety
/// Same as [`init_cons`].
pub unsafe fn read_cons(addr: usize) -> Word {
    let raw = std::ptr::read_unaligned((addr + FIELD_OFFSET) as *const usize);
    Word::from_raw(raw)
}

/// A deterministic single-threaded config suitable for assertions that
/// need a predictable generational schedule.
pub fn deterministic_config() -> GcConfig {
    GcConfig {
        threading_model: ThreadingModel::Single,
        ..Default::default()
    }
}
