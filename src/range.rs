//! Address-Range Registry (spec §4.2).
//!
//! Maintains the two range lists: general ranges (geometrically grown,
//! hosting single- or small-multi-page allocations tracked by a
//! per-page `alloc_info` table) and dedicated ranges (one per
//! large/huge allocation, with a single write-tracking scalar).
//!
//! The registry is process-global and serialised by a single lock. The
//! write-fault handler (installed by [`crate::platform`]) also needs
//! this lock, and may run on a thread that already holds it (the
//! handler fires synchronously on whichever thread faulted, which can
//! be a thread in the middle of, say, allocating a new parent
//! descriptor page). [`parking_lot::ReentrantMutex`] makes that safe:
//! a second lock from the same thread succeeds instead of deadlocking,
//! which is the language-agnostic "re-entrant depth counter" spec §5
//! describes, provided for us by the crate instead of hand-rolled.

use crate::config::{self, PAGE_SIZE};
use crate::error::{GcError, Result};
use crate::logging;
use crate::platform;
use lazy_static::lazy_static;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies the `GroupData` that owns a page group, so dirty-page
/// draining (spec §4.6 `update_parents`) never crosses group
/// boundaries. `0` is never issued and means "unowned".
pub type GroupId = u64;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh, process-wide unique group id.
pub fn next_group_id() -> GroupId {
    NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed)
}

/// A page's slot in a general range's `alloc_info` table.
///
/// `Free` = unallocated; `GroupStart(n)` = first page of an n-page
/// group; `GroupMember(k)` = the k-th page (k >= 1) of a group that
/// started `k` pages earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocInfo {
    Free,
    GroupStart(u32),
    GroupMember(u32),
}

impl AllocInfo {
    fn is_free(self) -> bool {
        matches!(self, AllocInfo::Free)
    }
}

struct GeneralRange {
    base: usize,
    size: usize,
    free: usize,
    first_free: usize,
    alloc_info: Vec<AllocInfo>,
    /// One write-tracking bit per page group (indexed by the group's
    /// first page).
    write_bits: Vec<bool>,
    /// The owning group's id per page group (indexed by the group's
    /// first page); `0` where the slot is free.
    owners: Vec<GroupId>,
}

impl GeneralRange {
    fn new(base: usize, size: usize) -> Self {
        GeneralRange {
            base,
            size,
            free: size,
            first_free: 0,
            alloc_info: vec![AllocInfo::Free; size],
            write_bits: vec![false; size],
            owners: vec![0; size],
        }
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size * PAGE_SIZE
    }

    fn index_of(&self, addr: usize) -> usize {
        (addr - self.base) / PAGE_SIZE
    }

    /// Locate the first page of the group containing page `index`.
    fn group_start(&self, index: usize) -> usize {
        match self.alloc_info[index] {
            AllocInfo::GroupStart(_) => index,
            AllocInfo::GroupMember(k) => index - k as usize,
            AllocInfo::Free => index,
        }
    }

    fn group_size(&self, start: usize) -> usize {
        match self.alloc_info[start] {
            AllocInfo::GroupStart(n) => n as usize,
            _ => 0,
        }
    }

    fn find_free_run(&self, n: usize) -> Option<usize> {
        if n == 1 && self.alloc_info[self.first_free].is_free() {
            return Some(self.first_free);
        }
        let mut run_start = None;
        let mut run_len = 0usize;
        for i in self.first_free..self.size {
            if self.alloc_info[i].is_free() {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == n {
                    return run_start;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    fn allocate(&mut self, start: usize, n: usize, dirty: bool, group: GroupId) {
        self.alloc_info[start] = AllocInfo::GroupStart(n as u32);
        for k in 1..n {
            self.alloc_info[start + k] = AllocInfo::GroupMember(k as u32);
        }
        self.free -= n;
        self.write_bits[start] = dirty;
        self.owners[start] = group;
        if start == self.first_free {
            while self.first_free < self.size && !self.alloc_info[self.first_free].is_free() {
                self.first_free += 1;
            }
        }
    }

    fn free_group(&mut self, start: usize) -> usize {
        let n = self.group_size(start);
        for i in start..start + n {
            self.alloc_info[i] = AllocInfo::Free;
        }
        self.owners[start] = 0;
        self.free += n;
        if start < self.first_free {
            self.first_free = start;
        }
        n
    }

    fn trim_group(&mut self, start: usize) -> usize {
        let n = self.group_size(start);
        for i in start + 1..start + n {
            self.alloc_info[i] = AllocInfo::Free;
        }
        self.alloc_info[start] = AllocInfo::GroupStart(1);
        self.free += n - 1;
        if start + 1 < self.first_free {
            self.first_free = start + 1;
        }
        n
    }
}

struct DedicatedRange {
    base: usize,
    size: usize,
    dirty: bool,
    owner: GroupId,
}

impl DedicatedRange {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size * PAGE_SIZE
    }
}

/// The process-wide address-range registry.
pub struct RangeRegistry {
    ranges: Vec<GeneralRange>,
    dedicated: Vec<DedicatedRange>,
    next_range_size: usize,
}

impl RangeRegistry {
    fn new() -> Self {
        RangeRegistry {
            ranges: Vec::new(),
            dedicated: Vec::new(),
            next_range_size: config::INITIAL_RANGE_PAGES,
        }
    }

    fn grow_ranges(&mut self, min_size: usize) -> Result<()> {
        let size = min_size.max(self.next_range_size);
        let base = platform::reserve_range(size, false)?;
        self.ranges.push(GeneralRange::new(base, size));
        self.next_range_size = (self.next_range_size * 2).min(config::MAX_RANGE_PAGES);
        Ok(())
    }

    /// Allocate `n` logical pages. Dedicated ranges are used when `n`
    /// exceeds `large_page_threshold` or is a multiple of the
    /// reservation granularity (in logical pages).
    pub fn alloc_pages(
        &mut self,
        n: usize,
        dirty: bool,
        large_page_threshold: usize,
        granularity_pages: usize,
        group: GroupId,
    ) -> Result<usize> {
        let needs_dedicated =
            n >= large_page_threshold || (granularity_pages > 0 && n % granularity_pages == 0);

        if needs_dedicated {
            let base = platform::reserve_range(n, true)?;
            self.dedicated.push(DedicatedRange {
                base,
                size: n,
                dirty,
                owner: group,
            });
            return Ok(base);
        }

        for range in self.ranges.iter_mut() {
            if range.free < n {
                continue;
            }
            if let Some(start) = range.find_free_run(n) {
                platform::commit_pages(range.base + start * PAGE_SIZE, n)?;
                range.allocate(start, n, dirty, group);
                return Ok(range.base + start * PAGE_SIZE);
            }
        }

        self.grow_ranges(n)?;
        let range = self.ranges.last_mut().expect("just grown");
        let start = range
            .find_free_run(n)
            .ok_or(GcError::OutOfAddressSpace(n))?;
        platform::commit_pages(range.base + start * PAGE_SIZE, n)?;
        range.allocate(start, n, dirty, group);
        Ok(range.base + start * PAGE_SIZE)
    }

    /// Free the page group starting at `base`. Returns the number of
    /// pages freed.
    pub fn free_pages(&mut self, base: usize) -> Result<usize> {
        if let Some(pos) = self.dedicated.iter().position(|r| r.base == base) {
            let range = self.dedicated.remove(pos);
            platform::release_range(range.base, range.size)?;
            return Ok(range.size);
        }
        for range in self.ranges.iter_mut() {
            if range.contains(base) {
                let index = range.index_of(base);
                let n = range.free_group(index);
                platform::decommit_pages(base, n)?;
                return Ok(n);
            }
        }
        Err(GcError::InvariantViolated(format!(
            "free_pages: address {base:#x} not found in any range"
        )))
    }

    /// Trim a multi-page group back to a single page, decommitting the
    /// rest. Not valid for dedicated ranges.
    pub fn trim_pages(&mut self, base: usize) -> Result<()> {
        for range in self.ranges.iter_mut() {
            if range.contains(base) {
                let index = range.index_of(base);
                let start = range.group_start(index);
                let n = range.trim_group(start);
                if n > 1 {
                    platform::decommit_pages(base + PAGE_SIZE, n - 1)?;
                }
                return Ok(());
            }
        }
        Err(GcError::InvariantViolated(format!(
            "trim_pages: address {base:#x} not found in a general range"
        )))
    }

    /// Set or clear read-only protection for the page group containing
    /// `addr`, updating the group's write-tracking bit.
    pub fn protect(&mut self, addr: usize, protect: bool) -> Result<()> {
        if let Some(range) = self.dedicated.iter_mut().find(|r| r.contains(addr)) {
            platform::protect_pages(range.base, range.size, protect)?;
            range.dirty = !protect;
            return Ok(());
        }
        for range in self.ranges.iter_mut() {
            if range.contains(addr) {
                let index = range.index_of(addr);
                let start = range.group_start(index);
                let n = range.group_size(start);
                platform::protect_pages(range.base + start * PAGE_SIZE, n, protect)?;
                range.write_bits[start] = !protect;
                return Ok(());
            }
        }
        Err(GcError::InvariantViolated(format!(
            "protect: address {addr:#x} not found in any range"
        )))
    }

    /// Called from the write-fault handler: unprotect the page group
    /// containing `page_addr` and mark it dirty. Returns `true` if
    /// `page_addr` belonged to a known range.
    pub fn handle_write_fault(&mut self, page_addr: usize) -> bool {
        if let Some(range) = self.dedicated.iter_mut().find(|r| r.contains(page_addr)) {
            let _ = platform::protect_pages(range.base, range.size, false);
            range.dirty = true;
            return true;
        }
        for range in self.ranges.iter_mut() {
            if range.contains(page_addr) {
                let index = range.index_of(page_addr);
                let start = range.group_start(index);
                let n = range.group_size(start);
                let _ = platform::protect_pages(range.base + start * PAGE_SIZE, n, false);
                range.write_bits[start] = true;
                return true;
            }
        }
        false
    }

    /// Collect the base addresses of every page group (general or
    /// dedicated) owned by `group` whose write-tracking bit is
    /// currently set, clearing each bit as it is collected (spec §4.6
    /// `update_parents`: "the list is rebuilt every cycle"). Page
    /// groups owned by a different group are left untouched, so one
    /// group's cycle can never drain another's write-barrier state.
    pub fn drain_dirty_pages(&mut self, group: GroupId) -> Vec<usize> {
        let mut dirty = Vec::new();
        for range in self.ranges.iter_mut() {
            for i in 0..range.size {
                if matches!(range.alloc_info[i], AllocInfo::GroupStart(_))
                    && range.write_bits[i]
                    && range.owners[i] == group
                {
                    dirty.push(range.base + i * PAGE_SIZE);
                    range.write_bits[i] = false;
                }
            }
        }
        for range in self.dedicated.iter_mut() {
            if range.dirty && range.owner == group {
                dirty.push(range.base);
                range.dirty = false;
            }
        }
        dirty
    }
}

lazy_static! {
    static ref REGISTRY: ReentrantMutex<RefCell<RangeRegistry>> =
        ReentrantMutex::new(RefCell::new(RangeRegistry::new()));
}

/// Run `f` with exclusive (but re-entrant, same-thread-safe) access to
/// the global registry.
pub fn with_registry<R>(f: impl FnOnce(&mut RangeRegistry) -> R) -> R {
    let guard = REGISTRY.lock();
    f(&mut guard.borrow_mut())
}

/// Fault-handler entry point, registered with [`platform::set_fault_callback`].
pub fn on_write_fault(page_addr: usize) -> bool {
    let handled = with_registry(|reg| reg.handle_write_fault(page_addr));
    if handled {
        logging::log_write_fault(&crate::config::GcConfig::default(), page_addr);
    }
    handled
}
