//! Parent Descriptor List (spec §4.6 `update_parents`).
//!
//! At the start of a cycle, every page group whose write-tracking bit
//! is set (i.e. the mutator has stored into it since the last cycle)
//! is rebuilt into a list of "parent" addresses: roots the marker must
//! treat as live regardless of generation, since an older page may now
//! hold a reference into the generation being collected. The list is
//! rebuilt from scratch each cycle rather than incrementally
//! maintained, mirroring `original_source/colAlloc.c`'s
//! `UpdateParents`.

use crate::range::{with_registry, GroupId};

/// One dirty page group discovered since the previous cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentDescriptor {
    pub page_addr: usize,
}

/// Drain `group`'s page groups out of the range registry's
/// write-tracking bits into a fresh list of parent descriptors,
/// clearing each bit as it is collected. Called once at the start of
/// every GC cycle, scoped to the calling group so one group's cycle
/// never consumes another group's dirty bits.
pub fn collect_parents(group: GroupId) -> Vec<ParentDescriptor> {
    with_registry(|reg| reg.drain_dirty_pages(group))
        .into_iter()
        .map(|page_addr| ParentDescriptor { page_addr })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn collect_parents_picks_up_pages_marked_dirty_by_write_faults() {
        let page_addr = with_registry(|reg| {
            let base = reg
                .alloc_pages(1, false, config::LARGE_PAGE_SIZE, 0, 1)
                .unwrap();
            reg.protect(base, true).unwrap();
            reg.handle_write_fault(base);
            base
        });

        let parents = collect_parents(1);
        assert!(parents.iter().any(|p| p.page_addr == page_addr));

        // Bits were cleared on collection: a second call finds nothing
        // new unless another fault occurs.
        let parents_again = collect_parents(1);
        assert!(!parents_again.iter().any(|p| p.page_addr == page_addr));

        with_registry(|reg| reg.free_pages(page_addr).unwrap());
    }

    #[test]
    fn collect_parents_ignores_another_groups_dirty_pages() {
        let page_addr = with_registry(|reg| {
            let base = reg
                .alloc_pages(1, false, config::LARGE_PAGE_SIZE, 0, 7)
                .unwrap();
            reg.protect(base, true).unwrap();
            reg.handle_write_fault(base);
            base
        });

        let other_groups_view = collect_parents(8);
        assert!(!other_groups_view.iter().any(|p| p.page_addr == page_addr));

        let owning_groups_view = collect_parents(7);
        assert!(owning_groups_view.iter().any(|p| p.page_addr == page_addr));

        with_registry(|reg| reg.free_pages(page_addr).unwrap());
    }
}
