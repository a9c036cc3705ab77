//! Thread/Group Coordinator (spec §4.8).
//!
//! A *group* is the unit of GC: every mutator thread that shares a
//! heap joins one `GroupData`. `ThreadingModel::Single` runs the
//! collector inline on the only mutator thread; `Async` hands
//! collection off to one dedicated collector thread the mutator never
//! waits on directly; `Shared` does the same but first barriers every
//! mutator thread in the group into a GC-safe region, since more than
//! one of them might be allocating concurrently.
//!
//! `pause_gc`/`resume_gc` let a mutator thread temporarily disable
//! automatic collection around a block of code that manipulates cells
//! in a way the write barrier cannot see (e.g. writing through a raw
//! pointer obtained earlier). The pair nests: collection resumes only
//! once every `pause_gc` has a matching `resume_gc`.

use crate::collector;
use crate::config::GcConfig;
use crate::pool::MemoryPool;
use crate::range::GroupId;
use crate::root::RootRegistry;
use crate::stats::{CycleStats, GroupStats};
use crate::word::Word;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

thread_local! {
    /// Nesting depth of `pause_gc` calls on the current thread. While
    /// nonzero, `resume_gc` only decrements; collection is only
    /// eligible to run again once it reaches zero.
    static PAUSE_DEPTH: Cell<u32> = Cell::new(0);
}

struct Heap {
    pool: MemoryPool,
    roots: RootRegistry,
    cycle_counts: Vec<u32>,
    stats: GroupStats,
}

/// Handshake state shared between mutator threads and a group's
/// dedicated collector thread (`Async`/`Shared` models only).
struct Handshake {
    mutex: Mutex<HandshakeState>,
    condvar: Condvar,
}

#[derive(Default)]
struct HandshakeState {
    /// Set by a mutator to ask the collector thread to run a cycle.
    gc_requested: bool,
    /// Set by the collector thread once the requested cycle finishes.
    gc_done: bool,
    /// `Shared` only: mutator threads still running unsafe (non-paused)
    /// code the collector must wait out before it may proceed.
    active_mutators: u32,
    shutdown: bool,
}

/// All state shared by the threads of one GC group.
pub struct GroupData {
    pub config: GcConfig,
    id: GroupId,
    heap: Mutex<Heap>,
    max_generation: u8,
    handshake: Option<Arc<Handshake>>,
    collector_busy: AtomicBool,
    member_count: AtomicU32,
}

impl GroupData {
    pub fn new(config: GcConfig) -> Arc<GroupData> {
        let max_generation = crate::config::GC_MAX_GENERATIONS;
        let id = crate::range::next_group_id();
        let heap = Heap {
            pool: MemoryPool::new(id),
            roots: RootRegistry::new(),
            cycle_counts: vec![0u32; max_generation as usize],
            stats: GroupStats::default(),
        };

        let handshake = match config.threading_model {
            crate::config::ThreadingModel::Single => None,
            _ => Some(Arc::new(Handshake {
                mutex: Mutex::new(HandshakeState::default()),
                condvar: Condvar::new(),
            })),
        };

        let group = Arc::new(GroupData {
            config,
            id,
            heap: Mutex::new(heap),
            max_generation,
            handshake,
            collector_busy: AtomicBool::new(false),
            member_count: AtomicU32::new(0),
        });

        if let Some(handshake) = group.handshake.clone() {
            let worker_group = group.clone();
            let _collector: JoinHandle<()> =
                std::thread::spawn(move || collector_thread_main(worker_group, handshake));
        }

        group
    }

    /// Register the calling thread as a member of this group. Returns
    /// a guard that deregisters it on drop.
    pub fn enter(self: &Arc<GroupData>) -> ThreadGuard {
        self.member_count.fetch_add(1, Ordering::SeqCst);
        if let Some(handshake) = &self.handshake {
            handshake.mutex.lock().active_mutators += 1;
        }
        ThreadGuard {
            group: self.clone(),
        }
    }

    fn leave(&self) {
        self.member_count.fetch_sub(1, Ordering::SeqCst);
        if let Some(handshake) = &self.handshake {
            let mut state = handshake.mutex.lock();
            state.active_mutators = state.active_mutators.saturating_sub(1);
            handshake.condvar.notify_all();
        }
    }

    /// Disable automatic collection on the calling thread. Nests.
    pub fn pause_gc(&self) {
        PAUSE_DEPTH.with(|d| d.set(d.get() + 1));
        if let Some(handshake) = &self.handshake {
            let mut state = handshake.mutex.lock();
            state.active_mutators = state.active_mutators.saturating_sub(1);
            handshake.condvar.notify_all();
        }
    }

    /// Like [`Self::pause_gc`], but never blocks: returns `false`
    /// instead of waiting out an in-progress cycle (`Async`/`Shared`
    /// only; `Single` always succeeds since it has no dedicated
    /// collector thread to be mid-cycle on).
    pub fn try_pause_gc(&self) -> bool {
        if self.collector_busy.load(Ordering::SeqCst) {
            return false;
        }
        self.pause_gc();
        true
    }

    /// Re-enable automatic collection, running a pending cycle if the
    /// nesting depth has returned to zero and a collection was
    /// deferred while paused.
    pub fn resume_gc(self: &Arc<GroupData>) {
        let depth = PAUSE_DEPTH.with(|d| {
            let next = d.get().saturating_sub(1);
            d.set(next);
            next
        });

        if let Some(handshake) = &self.handshake {
            handshake.mutex.lock().active_mutators += 1;
        }

        if depth == 0 {
            self.maybe_collect();
        }
    }

    /// Allocate `n_cells` in the eden generation, triggering a cycle
    /// first if the pool's allocation counters have crossed threshold
    /// and this thread is not inside a `pause_gc` region.
    pub fn alloc_cells(self: &Arc<GroupData>, n_cells: usize) -> crate::error::Result<usize> {
        if PAUSE_DEPTH.with(Cell::get) == 0 {
            self.maybe_collect();
        }
        let mut heap = self.heap.lock();
        heap.pool.alloc_cells(crate::config::EDEN_GENERATION, n_cells)
    }

    pub fn preserve(&self, word: Word) {
        if let Some(addr) = word.as_cell_addr() {
            let mut heap = self.heap.lock();
            let generation = heap
                .pool
                .page_for_addr(addr)
                .map(|p| p.generation)
                .unwrap_or(crate::config::EDEN_GENERATION);
            heap.roots.preserve(addr, generation, word);
        }
    }

    pub fn release(&self, word: Word) {
        if let Some(addr) = word.as_cell_addr() {
            self.heap.lock().roots.release(addr);
        }
    }

    /// Add `word`'s cell to this group's sweepable list (spec §6
    /// `register_sweepable`). A no-op for immediate words.
    pub fn register_sweepable(&self, word: Word, free_proc: fn(usize)) {
        if let Some(addr) = word.as_cell_addr() {
            self.heap.lock().pool.register_sweepable(addr, free_proc);
        }
    }

    pub fn stats(&self) -> GroupStats {
        self.heap.lock().stats
    }

    /// Number of pages currently held by `generation`. Exposed for
    /// diagnostics and tests; not part of the allocation fast path.
    pub fn generation_page_count(&self, generation: u8) -> usize {
        self.heap.lock().pool.pages_in_generation(generation).len()
    }

    /// Total occupied cells (including each group's reserved header
    /// cell) across `generation`. Exposed for diagnostics and tests.
    pub fn generation_live_cell_count(&self, generation: u8) -> usize {
        let heap = self.heap.lock();
        heap.pool
            .pages_in_generation(generation)
            .iter()
            .filter_map(|&addr| heap.pool.page(addr))
            .map(|page| page.n_pages() * crate::config::CELLS_PER_PAGE - page.free_cells())
            .sum()
    }

    fn maybe_collect(self: &Arc<GroupData>) {
        let should_collect = {
            let heap = self.heap.lock();
            let since_gc = heap.pool.alloc_count_since_gc(crate::config::EDEN_GENERATION);
            let prev_alloc = heap.pool.prev_cycle_alloc(crate::config::EDEN_GENERATION);
            since_gc
                >= crate::config::gc_threshold(
                    prev_alloc,
                    self.config.gc_min_page_alloc,
                    self.config.gc_max_page_alloc,
                )
        };
        if !should_collect {
            return;
        }

        match self.config.threading_model {
            crate::config::ThreadingModel::Single => {
                self.run_cycle_locked();
            }
            _ => self.request_cycle_and_wait(),
        }
    }

    fn run_cycle_locked(&self) {
        let mut heap = self.heap.lock();
        let Heap {
            pool,
            roots,
            cycle_counts,
            stats,
        } = &mut *heap;
        let cycle = collector::run_cycle(
            pool,
            roots,
            &self.config,
            cycle_counts,
            self.max_generation,
            self.id,
        );
        for generation in crate::config::EDEN_GENERATION..=cycle.max_collected_generation {
            pool.take_alloc_count(generation);
        }
        stats.record(&cycle);
    }

    fn request_cycle_and_wait(&self) {
        let Some(handshake) = &self.handshake else {
            return;
        };
        let mut state = handshake.mutex.lock();
        state.gc_requested = true;
        state.gc_done = false;
        handshake.condvar.notify_all();
        if let Some(timeout) = self.config.test_handshake_timeout {
            let deadline = std::time::Instant::now() + timeout;
            while !state.gc_done {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                handshake.condvar.wait_for(&mut state, remaining);
            }
        } else {
            handshake.condvar.wait_while(&mut state, |s| !s.gc_done);
        }
    }
}

fn collector_thread_main(group: Arc<GroupData>, handshake: Arc<Handshake>) {
    loop {
        let mut state = handshake.mutex.lock();
        handshake
            .condvar
            .wait_while(&mut state, |s| !s.gc_requested && !s.shutdown);
        if state.shutdown {
            return;
        }

        // Shared model: wait for every mutator to leave its unsafe
        // region (active_mutators counts threads NOT currently paused).
        if matches!(group.config.threading_model, crate::config::ThreadingModel::Shared) {
            handshake
                .condvar
                .wait_while(&mut state, |s| s.active_mutators > 0 && !s.shutdown);
            if state.shutdown {
                return;
            }
        }

        drop(state);
        group.collector_busy.store(true, Ordering::SeqCst);
        group.run_cycle_locked();
        group.collector_busy.store(false, Ordering::SeqCst);

        let mut state = handshake.mutex.lock();
        state.gc_requested = false;
        state.gc_done = true;
        handshake.condvar.notify_all();
    }
}

/// RAII membership token returned by [`GroupData::enter`].
pub struct ThreadGuard {
    group: Arc<GroupData>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.group.leave();
    }
}

/// Per-cycle summary for external callers (e.g. a test harness) that
/// want to assert on the most recent collection.
pub fn last_cycle_summary(group: &GroupData) -> GroupStats {
    group.stats()
}

#[allow(dead_code)]
fn _assert_stats_type(_s: CycleStats) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, ThreadingModel};

    #[test]
    fn single_threaded_group_allocates_without_a_collector_thread() {
        let group = GroupData::new(GcConfig {
            threading_model: ThreadingModel::Single,
            ..Default::default()
        });
        let _member = group.enter();
        let addr = group.alloc_cells(2).expect("alloc");
        assert_ne!(addr, 0);
    }

    #[test]
    fn pause_resume_nests_without_triggering_collection_mid_region() {
        let group = GroupData::new(GcConfig {
            threading_model: ThreadingModel::Single,
            ..Default::default()
        });
        let _member = group.enter();
        group.pause_gc();
        group.pause_gc();
        group.resume_gc();
        assert_eq!(PAUSE_DEPTH.with(Cell::get), 1);
        group.resume_gc();
        assert_eq!(PAUSE_DEPTH.with(Cell::get), 0);
    }

    #[test]
    fn preserve_and_release_round_trip_through_group_roots() {
        let group = GroupData::new(GcConfig {
            threading_model: ThreadingModel::Single,
            ..Default::default()
        });
        let _member = group.enter();
        let addr = group.alloc_cells(1).expect("alloc");
        let word = Word::from_cell_addr(addr);
        group.preserve(word);
        group.release(word);
    }
}
