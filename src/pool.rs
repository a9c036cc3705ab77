//! Memory Pool (spec §4.4).
//!
//! A pool owns the pages belonging to one generation of one thread
//! group: a singly-linked list of pages (oldest first) plus a
//! best-effort "last free run" hint so repeated same-size allocations
//! don't rescan from the front of the list every time.
//!
//! Page metadata (generation, occupancy bitmap) is not literally
//! overlaid on cell 0 of the mapped page the way the reference
//! implementation packs its `Page` struct there. Nothing outside this
//! module ever derives a page header's address from a bare cell
//! address (only [`crate::collector`] walks pages, always through this
//! pool), so the header lives in an ordinary side table instead;
//! `CellBitmap`'s cell-0 reservation still accounts for the metadata
//! cell in the free/used count so the arithmetic matches the spec.
//!
//! A cell request larger than one page's worth of cells spans a
//! dedicated, freshly allocated run of contiguous logical pages (one
//! [`Page`] entry holding one [`CellBitmap`] per physical page). Only
//! the group's very first cell is a reserved header; continuation
//! pages have no header of their own, since they're never addressed
//! except as part of this one multi-page object.

use crate::cell::CellBitmap;
use crate::config::{self, AVAILABLE_CELLS_PER_PAGE, CELLS_PER_PAGE, PAGE_SIZE, RESERVED_CELLS};
use crate::error::{GcError, Result};
use crate::range::{with_registry, GroupId};
use std::collections::HashMap;

/// One (possibly multi-page) logical allocation unit belonging to a
/// pool: a run of `n_pages` contiguous logical pages sharing a single
/// reserved header cell at the very start of the run.
pub struct Page {
    pub addr: usize,
    pub generation: u8,
    bitmaps: Vec<CellBitmap>,
}

impl Page {
    fn new(addr: usize, generation: u8, n_pages: usize) -> Self {
        let mut bitmaps = vec![CellBitmap::empty(); n_pages];
        bitmaps[0] = CellBitmap::new();
        Page {
            addr,
            generation,
            bitmaps,
        }
    }

    /// Number of contiguous logical pages this group spans.
    pub fn n_pages(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn free_cells(&self) -> usize {
        self.bitmaps.iter().map(|b| b.count_free_cells()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.iter().enumerate().all(|(i, b)| {
            if i == 0 {
                b.count_set_cells() <= RESERVED_CELLS
            } else {
                b.count_set_cells() == 0
            }
        })
    }

    pub fn fill_ratio(&self) -> f64 {
        let total_cells = self.n_pages() * CELLS_PER_PAGE;
        let total_available = total_cells - RESERVED_CELLS;
        let used = total_cells - self.free_cells() - RESERVED_CELLS;
        used as f64 / total_available as f64
    }

    /// Addresses of every occupied, non-header cell across the group.
    pub fn occupied_cells(&self) -> Vec<usize> {
        let mut cells = Vec::new();
        for (i, bitmap) in self.bitmaps.iter().enumerate() {
            let first = if i == 0 { RESERVED_CELLS } else { 0 };
            for cell in first..CELLS_PER_PAGE {
                if bitmap.test_cell(cell) {
                    cells.push(self.addr + i * PAGE_SIZE + cell * config::CELL_SIZE);
                }
            }
        }
        cells
    }

    fn locate(&self, addr: usize) -> (usize, usize) {
        let offset = addr - self.addr;
        (offset / PAGE_SIZE, (offset % PAGE_SIZE) / config::CELL_SIZE)
    }

    pub fn clear_cell_addr(&mut self, addr: usize) {
        let (page_idx, cell) = self.locate(addr);
        if let Some(bitmap) = self.bitmaps.get_mut(page_idx) {
            bitmap.clear_cells(cell, 1);
        }
    }

    /// Clear every non-header cell across the group, for reuse after
    /// compaction has copied every live cell elsewhere.
    pub fn clear_all_cells(&mut self) {
        for (i, bitmap) in self.bitmaps.iter_mut().enumerate() {
            if i == 0 {
                bitmap.clear_all_cells();
            } else {
                *bitmap = CellBitmap::empty();
            }
        }
    }
}

/// Bookkeeping for a single generation within a pool.
#[derive(Default)]
struct Generation {
    /// Page-group base addresses, oldest-allocated first.
    pages: Vec<usize>,
    /// Allocations (in pages) since this generation's pages were last
    /// swept, used to schedule the next cycle (spec §4.7 "Trigger").
    pages_alloc_since_gc: u32,
    /// What `pages_alloc_since_gc` held just before the most recent
    /// call to [`MemoryPool::take_alloc_count`] reset it — the
    /// previous cycle's allocation volume, which `config::gc_threshold`
    /// clamps into `[gc_min_page_alloc, gc_max_page_alloc]` to pick the
    /// next cycle's trigger.
    prev_cycle_alloc: u32,
    /// Hint: (page address, cell index) of the last cell run handed
    /// out, so a run of same-size allocations doesn't always rescan
    /// from the first page.
    last_alloc_hint: Option<(usize, usize)>,
}

/// A generation-indexed set of pages, owned by one thread group.
pub struct MemoryPool {
    generations: Vec<Generation>,
    pages: HashMap<usize, Page>,
    /// Maps every physical logical-page address to the base address of
    /// the (possibly multi-page) group it belongs to.
    page_index: HashMap<usize, usize>,
    /// The owning group's id, so every page this pool allocates can be
    /// attributed to it in the range registry (spec §4.6
    /// `update_parents` must never drain another group's dirty pages).
    group: GroupId,
    /// This pool's sweepable list (spec §6 `register_sweepable`): cells
    /// explicitly registered for a one-off cleanup call the moment a
    /// sweep finds them unmarked, independent of any free hook their
    /// type table carries.
    sweepable: HashMap<usize, fn(usize)>,
}

impl MemoryPool {
    pub fn new(group: GroupId) -> Self {
        let mut generations = Vec::with_capacity(config::GC_MAX_GENERATIONS as usize);
        generations.resize_with(config::GC_MAX_GENERATIONS as usize, Generation::default);
        MemoryPool {
            generations,
            pages: HashMap::new(),
            page_index: HashMap::new(),
            group,
            sweepable: HashMap::new(),
        }
    }

    /// Add `addr`'s cell to this pool's sweepable list (spec §6
    /// `register_sweepable`). `free_proc` runs exactly once, the next
    /// time a sweep finds the cell unmarked, immediately before its
    /// bits are cleared.
    pub fn register_sweepable(&mut self, addr: usize, free_proc: fn(usize)) {
        self.sweepable.insert(addr, free_proc);
    }

    /// Remove and return `addr`'s sweepable hook, if it has one.
    /// Consulted by the collector just before a cell's bits are
    /// cleared during sweep.
    pub fn take_sweepable(&mut self, addr: usize) -> Option<fn(usize)> {
        self.sweepable.remove(&addr)
    }

    /// Look up a page group by its exact base address.
    pub fn page(&self, addr: usize) -> Option<&Page> {
        self.pages.get(&addr)
    }

    pub fn page_mut(&mut self, addr: usize) -> Option<&mut Page> {
        self.pages.get_mut(&addr)
    }

    /// Look up the page group containing an arbitrary cell address,
    /// whether or not it happens to be a group's base.
    pub fn page_for_addr(&self, addr: usize) -> Option<&Page> {
        let aligned = addr & !(PAGE_SIZE - 1);
        let base = self.page_index.get(&aligned)?;
        self.pages.get(base)
    }

    pub fn pages_in_generation(&self, generation: u8) -> &[usize] {
        &self.generations[generation as usize].pages
    }

    /// Pages allocated into `generation` since its counter was last
    /// reset by [`Self::take_alloc_count`], used to schedule the next
    /// GC cycle (spec §4.7 "Trigger").
    pub fn alloc_count_since_gc(&self, generation: u8) -> u32 {
        self.generations[generation as usize].pages_alloc_since_gc
    }

    /// The allocation volume (in pages) the most recent completed cycle
    /// saw for `generation`, for use by [`config::gc_threshold`] when
    /// picking the next cycle's trigger.
    pub fn prev_cycle_alloc(&self, generation: u8) -> u32 {
        self.generations[generation as usize].prev_cycle_alloc
    }

    /// Allocate `n_pages` fresh contiguous logical pages as one group
    /// for `generation`, committing them via the range registry.
    /// Returns the group's base address.
    pub fn alloc_pages(&mut self, generation: u8, n_pages: usize) -> Result<usize> {
        let base = with_registry(|reg| {
            reg.alloc_pages(n_pages, false, config::LARGE_PAGE_SIZE, 0, self.group)
        })?;
        self.pages.insert(base, Page::new(base, generation, n_pages));
        for i in 0..n_pages {
            self.page_index.insert(base + i * PAGE_SIZE, base);
        }
        let gen = &mut self.generations[generation as usize];
        gen.pages.push(base);
        gen.pages_alloc_since_gc += n_pages as u32;
        Ok(base)
    }

    /// Allocate a contiguous run of `n_cells` within `generation`. A
    /// request within one page's capacity reuses the last-touched page
    /// or scans for room before growing; a larger request spans a
    /// fresh dedicated multi-page group (see [`Self::alloc_multi_page_cells`]).
    pub fn alloc_cells(&mut self, generation: u8, n_cells: usize) -> Result<usize> {
        if n_cells == 0 {
            return Err(GcError::InvariantViolated(
                "alloc_cells: n_cells must be > 0".to_string(),
            ));
        }
        if n_cells > AVAILABLE_CELLS_PER_PAGE {
            return self.alloc_multi_page_cells(generation, n_cells);
        }

        if let Some((hint_addr, hint_cell)) = self.generations[generation as usize].last_alloc_hint
        {
            if let Some(page) = self.pages.get_mut(&hint_addr) {
                if let Some(start) = page.bitmaps[0].find_run(hint_cell, n_cells) {
                    page.bitmaps[0].set_cells(start, n_cells);
                    self.generations[generation as usize].last_alloc_hint =
                        Some((hint_addr, start + n_cells));
                    return Ok(hint_addr + start * config::CELL_SIZE);
                }
            }
        }

        let page_addrs = self.generations[generation as usize].pages.clone();
        for addr in page_addrs {
            let page = self.pages.get_mut(&addr).expect("tracked page");
            if page.n_pages() != 1 {
                continue;
            }
            if let Some(start) = page.bitmaps[0].find_run(0, n_cells) {
                page.bitmaps[0].set_cells(start, n_cells);
                self.generations[generation as usize].last_alloc_hint =
                    Some((addr, start + n_cells));
                return Ok(addr + start * config::CELL_SIZE);
            }
        }

        let page_addr = self.alloc_pages(generation, 1)?;
        let page = self.pages.get_mut(&page_addr).expect("just inserted");
        let start = page.bitmaps[0]
            .find_run(0, n_cells)
            .expect("fresh page always has room");
        page.bitmaps[0].set_cells(start, n_cells);
        self.generations[generation as usize].last_alloc_hint = Some((page_addr, start + n_cells));
        Ok(page_addr + start * config::CELL_SIZE)
    }

    /// Allocate `n_cells` (more than one page can hold) as a fresh,
    /// dedicated run of contiguous pages. Only the group's first cell
    /// is a header; every other cell in the span, including cell 0 of
    /// every page after the first, is available to the mutator.
    fn alloc_multi_page_cells(&mut self, generation: u8, n_cells: usize) -> Result<usize> {
        let n_pages = (n_cells + RESERVED_CELLS + CELLS_PER_PAGE - 1) / CELLS_PER_PAGE;
        let base = self.alloc_pages(generation, n_pages)?;
        let page = self.pages.get_mut(&base).expect("just inserted");
        let mut remaining = n_cells;
        for (i, bitmap) in page.bitmaps.iter_mut().enumerate() {
            if remaining == 0 {
                break;
            }
            let first = if i == 0 { RESERVED_CELLS } else { 0 };
            let take = remaining.min(CELLS_PER_PAGE - first);
            bitmap.set_cells(first, take);
            remaining -= take;
        }
        Ok(base + RESERVED_CELLS * config::CELL_SIZE)
    }

    /// Move a page group from `from` to `to` generation's list without
    /// touching its contents, used by whole-page-splice promotion.
    pub fn splice_page(&mut self, addr: usize, from: u8, to: u8) {
        let from_gen = &mut self.generations[from as usize];
        if let Some(pos) = from_gen.pages.iter().position(|&a| a == addr) {
            from_gen.pages.remove(pos);
        }
        self.generations[to as usize].pages.push(addr);
        if let Some(page) = self.pages.get_mut(&addr) {
            page.generation = to;
        }
    }

    /// Release every page group in `generation` that is fully empty
    /// after a sweep, returning the number of groups freed.
    pub fn free_empty_pages(&mut self, generation: u8) -> Result<usize> {
        let candidates = self.generations[generation as usize].pages.clone();
        let mut still_alive = Vec::with_capacity(candidates.len());
        let mut freed = 0;

        for addr in candidates {
            let empty = self.pages.get(&addr).map(|p| p.is_empty()).unwrap_or(false);
            if !empty {
                still_alive.push(addr);
                continue;
            }
            if let Some(page) = self.pages.remove(&addr) {
                for i in 0..page.n_pages() {
                    self.page_index.remove(&(addr + i * PAGE_SIZE));
                }
            }
            let _ = with_registry(|reg| reg.free_pages(addr));
            freed += 1;
        }

        let gen = &mut self.generations[generation as usize];
        gen.pages = still_alive;
        gen.last_alloc_hint = None;
        Ok(freed)
    }

    /// Reset the "allocations since last GC" counter for `generation`
    /// after a cycle completes, returning the value it held. The
    /// returned value is also recorded as the generation's previous
    /// cycle allocation volume (see [`Self::prev_cycle_alloc`]).
    pub fn take_alloc_count(&mut self, generation: u8) -> u32 {
        let gen = &mut self.generations[generation as usize];
        let taken = std::mem::take(&mut gen.pages_alloc_since_gc);
        gen.prev_cycle_alloc = taken;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_cells_grows_a_fresh_page_on_demand() {
        let mut pool = MemoryPool::new(1);
        let addr = pool.alloc_cells(1, 4).expect("alloc");
        assert_ne!(addr, 0);
        assert_eq!(pool.pages_in_generation(1).len(), 1);
    }

    #[test]
    fn alloc_cells_reuses_hint_before_rescanning() {
        let mut pool = MemoryPool::new(1);
        let first = pool.alloc_cells(0, 2).unwrap();
        let second = pool.alloc_cells(0, 2).unwrap();
        assert_eq!(pool.pages_in_generation(0).len(), 1);
        assert!(second > first);
    }

    #[test]
    fn alloc_cells_rejects_zero() {
        let mut pool = MemoryPool::new(1);
        assert!(pool.alloc_cells(0, 0).is_err());
    }

    #[test]
    fn alloc_cells_spans_multiple_pages_for_oversized_request() {
        let mut pool = MemoryPool::new(1);
        let n_cells = AVAILABLE_CELLS_PER_PAGE + 73;
        let addr = pool.alloc_cells(1, n_cells).expect("multi-page alloc");
        assert_eq!(pool.pages_in_generation(1).len(), 1);
        let page_addr = addr - RESERVED_CELLS * config::CELL_SIZE;
        let page = pool.page(page_addr).expect("group registered");
        assert_eq!(page.n_pages(), 2);
        assert_eq!(page.occupied_cells().len(), n_cells);
        assert!(pool.page_for_addr(page_addr + PAGE_SIZE).is_some());
    }

    #[test]
    fn free_empty_pages_removes_fully_unused_pages() {
        let mut pool = MemoryPool::new(1);
        let addr = pool.alloc_cells(2, 4).unwrap();
        let page_addr = addr - (addr % config::PAGE_SIZE);
        pool.page_mut(page_addr).unwrap().clear_all_cells();
        let freed = pool.free_empty_pages(2).unwrap();
        assert_eq!(freed, 1);
        assert!(pool.pages_in_generation(2).is_empty());
        assert!(pool.page_for_addr(page_addr).is_none());
    }

    #[test]
    fn splice_page_moves_between_generations() {
        let mut pool = MemoryPool::new(1);
        let addr = pool.alloc_cells(1, 2).unwrap();
        let page_addr = addr - (addr % config::PAGE_SIZE);
        pool.splice_page(page_addr, 1, 2);
        assert!(pool.pages_in_generation(1).is_empty());
        assert_eq!(pool.pages_in_generation(2), &[page_addr]);
    }
}
