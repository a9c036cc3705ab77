//! Object Model (spec §4.5, §4.6, §9 "Forwarding during compaction").
//!
//! The allocator itself is type-agnostic: it only sees cells. A global
//! table of per-type handlers, indexed by the one-byte type id stored
//! in a heap object's first cell, lets the collector find a live
//! object's extent (in cells) and its outgoing references without
//! knowing anything about ropes, lists, vectors, or string buffers.

use crate::word::Word;
use parking_lot::RwLock;
use std::ptr;

/// Type id reserved to mark a cell that has been relocated during
/// promotion-compaction. No external collaborator may register this id.
pub const TYPE_FORWARDED: u8 = 255;

/// Highest type id an external collaborator may register.
pub const MAX_USER_TYPE_ID: u8 = 254;

/// Per-type function table consumed by the collector (spec §6, "The
/// core consumes from external collaborators").
#[derive(Clone, Copy)]
pub struct TypeHandlers {
    /// Number of consecutive cells this object occupies, including its
    /// header cell. Required so the sweeper knows how many bitmap bits
    /// to clear for an unmarked object.
    pub cell_count: fn(header_addr: usize) -> usize,
    /// Invoke `visit` once per outgoing [`Word`] reference, used by the
    /// marker to recurse into an object's children.
    pub children: fn(header_addr: usize, visit: &mut dyn FnMut(Word)),
    /// Element/character count, if this type exposes one. Not used by
    /// the collector; stored for external traversal code.
    pub length: Option<fn(header_addr: usize) -> usize>,
    /// Cleanup hook run immediately before a sweepable cell's bits are
    /// cleared (spec §3 "Lifecycle: Cell").
    pub free_hook: Option<fn(header_addr: usize)>,
}

const NO_HANDLERS: Option<TypeHandlers> = None;
static TYPE_TABLE: RwLock<[Option<TypeHandlers>; 256]> = RwLock::new([NO_HANDLERS; 256]);

/// Register handlers for a type id. Overwrites any previous
/// registration for the same id. Panics if `id` is [`TYPE_FORWARDED`].
pub fn register_type(id: u8, handlers: TypeHandlers) {
    assert_ne!(id, TYPE_FORWARDED, "type id 255 is reserved for forwarding");
    TYPE_TABLE.write()[id as usize] = Some(handlers);
}

/// Look up the handlers registered for a type id.
pub fn lookup_type(id: u8) -> Option<TypeHandlers> {
    TYPE_TABLE.read()[id as usize]
}

/// Read the type id stored in a header cell's first byte.
///
/// # Safety
/// `header_addr` must be the address of a live cell's header, readable
/// for at least one byte.
pub unsafe fn type_id_of(header_addr: usize) -> u8 {
    ptr::read(header_addr as *const u8)
}

/// Write a type id into a header cell's first byte.
///
/// # Safety
/// `header_addr` must be the address of a writable cell.
pub unsafe fn set_type_id(header_addr: usize, id: u8) {
    ptr::write(header_addr as *mut u8, id);
}

/// True if the cell at `header_addr` currently holds a forwarding
/// record rather than live object data.
///
/// # Safety
/// Same as [`type_id_of`].
pub unsafe fn is_forwarded(header_addr: usize) -> bool {
    type_id_of(header_addr) == TYPE_FORWARDED
}

/// Overwrite a cell's header with a forwarding record pointing at
/// `new_addr`. The first byte becomes [`TYPE_FORWARDED`] (a value no
/// registered type may use); the pointer-sized forwarding address is
/// written starting at the next byte, unaligned, since cell layouts
/// reserve no aligned slot for it in the common (non-forwarded) case.
///
/// # Safety
/// `header_addr` must be writable for `1 + size_of::<usize>()` bytes
/// and the cell must not be read as live object data again.
pub unsafe fn forward_to(header_addr: usize, new_addr: usize) {
    set_type_id(header_addr, TYPE_FORWARDED);
    ptr::write_unaligned((header_addr + 1) as *mut usize, new_addr);
}

/// Read a forwarding record previously written by [`forward_to`].
///
/// # Safety
/// `header_addr` must satisfy [`is_forwarded`] and be readable for
/// `1 + size_of::<usize>()` bytes.
pub unsafe fn forwarding_target(header_addr: usize) -> usize {
    ptr::read_unaligned((header_addr + 1) as *const usize)
}

/// Resolve a word, following a forwarding record if its cell has been
/// relocated. Immediates and non-forwarded cell words are returned
/// unchanged.
///
/// # Safety
/// If `word` is a cell reference, its cell must currently be live or
/// hold a valid forwarding record (i.e. not freed/reused memory).
pub unsafe fn resolve(word: Word) -> Word {
    match word.as_cell_addr() {
        Some(addr) if is_forwarded(addr) => Word::from_cell_addr(forwarding_target(addr)),
        _ => word,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_children(_addr: usize, _visit: &mut dyn FnMut(Word)) {}
    fn one_cell(_addr: usize) -> usize {
        1
    }

    #[test]
    fn register_and_lookup_roundtrip() {
        register_type(
            7,
            TypeHandlers {
                cell_count: one_cell,
                children: no_children,
                length: None,
                free_hook: None,
            },
        );
        let handlers = lookup_type(7).expect("registered");
        assert_eq!((handlers.cell_count)(0), 1);
    }

    #[test]
    #[should_panic]
    fn cannot_register_forwarded_id() {
        register_type(
            TYPE_FORWARDED,
            TypeHandlers {
                cell_count: one_cell,
                children: no_children,
                length: None,
                free_hook: None,
            },
        );
    }

    #[test]
    fn forwarding_roundtrips() {
        let mut buf = [0u8; 64];
        let addr = buf.as_mut_ptr() as usize;
        unsafe {
            set_type_id(addr, 3);
            assert!(!is_forwarded(addr));
            forward_to(addr, 0xdead_beef);
            assert!(is_forwarded(addr));
            assert_eq!(forwarding_target(addr), 0xdead_beef);
        }
    }
}
