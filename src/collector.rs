//! Collector (spec §4.7): one GC cycle — scope, mark, sweep, promote,
//! write-barrier reset.
//!
//! A cycle never collects an arbitrary subset of generations: it
//! always collects every generation from eden up through
//! `max_collected_generation`, and
//! `max_collected_generation` only grows when the youngest generation
//! has been collected `gen_factor` times since the next generation up
//! was last touched (spec §4.7 "Generational schedule"). Promotion
//! only ever compacts `max_collected_generation` itself — not an
//! arbitrary generation — per Open Question resolution 1 in
//! `SPEC_FULL.md`.

use crate::config::GcConfig;
use crate::object::{self, TypeHandlers};
use crate::parent::{self, ParentDescriptor};
use crate::pool::MemoryPool;
use crate::range::GroupId;
use crate::root::RootRegistry;
use crate::stats::CycleStats;
use crate::word::Word;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Which generations this cycle collects and, among those, which one
/// (if any) is promoted via compaction rather than whole-page splice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub max_collected_generation: u8,
    pub compact_generation: u8,
}

/// Decide this cycle's scope and advance the per-generation collection
/// counters. `cycle_counts[g]` counts collections of generation `g`
/// since generation `g` last rolled over into `g+1`.
pub fn determine_scope(config: &GcConfig, cycle_counts: &mut [u32], max_generation: u8) -> Scope {
    let mut g: u8 = crate::config::EDEN_GENERATION;
    loop {
        cycle_counts[g as usize] += 1;
        let rolled_over = cycle_counts[g as usize] % config.gen_factor == 0;
        if !rolled_over || g + 1 >= max_generation {
            break;
        }
        cycle_counts[g as usize] = 0;
        g += 1;
    }
    Scope {
        max_collected_generation: g,
        compact_generation: g,
    }
}

/// The set of header addresses mark found reachable this cycle.
/// Returned by [`mark`] for [`sweep`] and [`compact_page`] to consult.
struct MarkResult {
    marked: HashSet<usize>,
}

fn mark(
    pool: &MemoryPool,
    roots: &RootRegistry,
    parents: &[ParentDescriptor],
    scope: Scope,
) -> MarkResult {
    let mut marked = HashSet::new();
    let mut stack: Vec<Word> = Vec::new();

    // Per spec step 3: only roots registered while at a generation this
    // cycle actually collects are pushed as starting points. A root's
    // stored generation never changes after registration (it tracks the
    // page's generation *at that moment*, not its current one), so an
    // old root promoted out of scope stays visible to every later cycle
    // that still covers its original generation.
    roots.for_each_ascending(|addr, _refcount, generation| {
        if generation <= scope.max_collected_generation {
            stack.push(Word::from_cell_addr(addr));
        }
    });

    // Conservative: every live cell on a dirty ("parent") page is
    // treated as a root. The page-level write bit tells us the page
    // was stored into, not which cell; scanning every occupied cell on
    // it over-approximates liveness but never under-approximates it.
    for descriptor in parents {
        if let Some(page) = pool.page(descriptor.page_addr) {
            for cell in page.occupied_cells() {
                stack.push(Word::from_cell_addr(cell));
            }
        }
    }

    while let Some(word) = stack.pop() {
        // A word pushed as a root or a conservative parent-page
        // reference may point at the old address of an object a prior
        // cycle's compaction already relocated; follow the forwarding
        // record to the live copy before marking, or the live object
        // is never reached and gets swept on the next cycle.
        let word = unsafe { object::resolve(word) };
        let Some(addr) = word.as_cell_addr() else {
            continue;
        };
        if !marked.insert(addr) {
            continue;
        }
        let Some(handlers) = type_handlers_for(addr) else {
            continue;
        };
        push_children(addr, handlers, &mut stack);

        // Only descend further into cells that belong to a generation
        // this cycle is actually collecting; older live data is
        // trusted without rescanning.
        if let Some(page) = pool.page_for_addr(addr) {
            if page.generation > scope.max_collected_generation {
                continue;
            }
        }
    }

    MarkResult { marked }
}

fn type_handlers_for(header_addr: usize) -> Option<TypeHandlers> {
    // SAFETY: `header_addr` is a live cell reference discovered either
    // from the root registry or from an occupied-cell scan of a
    // tracked page, both of which only ever hold addresses the pool
    // allocator handed out and has not since freed within this cycle.
    let id = unsafe { object::type_id_of(header_addr) };
    object::lookup_type(id)
}

fn push_children(header_addr: usize, handlers: TypeHandlers, stack: &mut Vec<Word>) {
    (handlers.children)(header_addr, &mut |child| stack.push(child));
}

/// Sweep every collected generation's pages: clear occupancy bits for
/// unmarked cells, running each freed cell's `free_hook` first.
fn sweep(pool: &mut MemoryPool, scope: Scope, result: &MarkResult) -> (usize, usize) {
    let mut cells_freed = 0;
    let mut pages_swept = 0;

    for generation in crate::config::EDEN_GENERATION..=scope.max_collected_generation {
        let page_addrs: Vec<usize> = pool.pages_in_generation(generation).to_vec();
        pages_swept += page_addrs.len();
        for page_addr in page_addrs {
            sweep_page(pool, page_addr, result, &mut cells_freed);
        }
    }

    (cells_freed, pages_swept)
}

fn sweep_page(pool: &mut MemoryPool, page_addr: usize, result: &MarkResult, cells_freed: &mut usize) {
    let Some(page) = pool.page(page_addr) else {
        return;
    };
    let to_clear: Vec<usize> = page
        .occupied_cells()
        .into_iter()
        .filter(|addr| !result.marked.contains(addr))
        .collect();

    for &addr in &to_clear {
        if let Some(handlers) = type_handlers_for(addr) {
            if let Some(free_hook) = handlers.free_hook {
                free_hook(addr);
            }
        }
        if let Some(free_proc) = pool.take_sweepable(addr) {
            free_proc(addr);
        }
    }
    if let Some(page) = pool.page_mut(page_addr) {
        for &addr in &to_clear {
            page.clear_cell_addr(addr);
        }
    }
    *cells_freed += to_clear.len();
}

/// Promote every collected generation's surviving pages into the next
/// generation up, youngest first. Eden (and any other non-oldest
/// generation in scope) is always spliced whole regardless of fill
/// ratio; only `scope.compact_generation` (the oldest generation this
/// cycle collected) is ever compacted by copying, per Open Question
/// resolution 1 in `SPEC_FULL.md`. A page below the fill-ratio
/// threshold is spliced in whole (cheap, leaves internal
/// fragmentation); a page at or above it is compacted by copying its
/// live cells into fresh pages and leaving a forwarding record behind,
/// per spec §4.7 "Promotion".
fn promote(pool: &mut MemoryPool, scope: Scope, config: &GcConfig) -> bool {
    let mut compacted = false;
    let mut from = crate::config::EDEN_GENERATION;

    while from <= scope.max_collected_generation {
        let Some(to) = from.checked_add(1) else {
            break;
        };
        if to as usize >= crate::config::GC_MAX_GENERATIONS as usize {
            break;
        }

        let page_addrs: Vec<usize> = pool.pages_in_generation(from).to_vec();
        let may_compact = from == scope.compact_generation;

        for page_addr in page_addrs {
            let fill_ratio = match pool.page(page_addr) {
                Some(page) if !page.is_empty() => page.fill_ratio(),
                _ => continue,
            };
            if may_compact && fill_ratio >= config.promote_fill_ratio {
                compact_page(pool, page_addr, to);
                compacted = true;
            } else {
                pool.splice_page(page_addr, from, to);
            }
        }

        from += 1;
    }

    compacted
}

/// Copy every live cell off `page_addr` into fresh pages of
/// `to_generation`, leaving a forwarding record behind each moved
/// header. The source page ends up fully unoccupied; the caller sweeps
/// it away via the normal empty-page reclamation path.
fn compact_page(pool: &mut MemoryPool, page_addr: usize, to_generation: u8) {
    let live_cells: Vec<(usize, usize)> = {
        let Some(page) = pool.page(page_addr) else {
            return;
        };
        page.occupied_cells()
            .into_iter()
            .map(|addr| {
                let cells = type_handlers_for(addr)
                    .map(|h| (h.cell_count)(addr))
                    .unwrap_or(1);
                (addr, cells)
            })
            .collect()
    };

    for (addr, n_cells) in live_cells {
        if let Ok(new_addr) = pool.alloc_cells(to_generation, n_cells) {
            // SAFETY: `addr` is a live header this cycle marked, and
            // `new_addr` is freshly allocated, writable storage of at
            // least the same cell count.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    addr as *const u8,
                    new_addr as *mut u8,
                    n_cells * crate::config::CELL_SIZE,
                );
                object::forward_to(addr, new_addr);
            }
        }
    }

    if let Some(page) = pool.page_mut(page_addr) {
        page.clear_all_cells();
    }
}

/// Run one full collection cycle against `pool`/`roots`, returning a
/// summary. `cycle_counts` persists across calls (owned by the calling
/// group's [`crate::thread::GroupData`]).
pub fn run_cycle(
    pool: &mut MemoryPool,
    roots: &RootRegistry,
    config: &GcConfig,
    cycle_counts: &mut [u32],
    max_generation: u8,
    group: GroupId,
) -> CycleStats {
    let start = Instant::now();
    let scope = determine_scope(config, cycle_counts, max_generation);
    crate::logging::log_cycle_start(config, scope.max_collected_generation);

    let parents = parent::collect_parents(group);
    let result = mark(pool, roots, &parents, scope);
    let (cells_freed, pages_swept) = sweep(pool, scope, &result);
    let compacted = promote(pool, scope, config);
    let pages_freed = (crate::config::EDEN_GENERATION..=scope.max_collected_generation)
        .map(|g| pool.free_empty_pages(g).unwrap_or(0))
        .sum();

    let pause: Duration = start.elapsed();
    crate::logging::log_cycle_end(config, cells_freed, pages_freed);

    CycleStats {
        max_collected_generation: scope.max_collected_generation,
        pages_swept,
        pages_freed,
        cells_freed,
        cells_marked: result.marked.len(),
        compacted,
        pause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GC_MAX_GENERATIONS;

    #[test]
    fn scope_stays_in_eden_until_gen_factor_collections() {
        let config = GcConfig {
            gen_factor: 3,
            ..Default::default()
        };
        let mut counts = vec![0u32; GC_MAX_GENERATIONS as usize];
        let mut scopes = Vec::new();
        for _ in 0..3 {
            scopes.push(determine_scope(&config, &mut counts, GC_MAX_GENERATIONS));
        }
        use crate::config::EDEN_GENERATION;
        assert_eq!(scopes[0].max_collected_generation, EDEN_GENERATION);
        assert_eq!(scopes[1].max_collected_generation, EDEN_GENERATION);
        assert_eq!(scopes[2].max_collected_generation, EDEN_GENERATION + 1);
    }

    #[test]
    fn empty_group_cycle_reports_zero_work() {
        let pool_roots = (MemoryPool::new(1), RootRegistry::new());
        let (mut pool, roots) = pool_roots;
        let config = GcConfig::default();
        let mut counts = vec![0u32; GC_MAX_GENERATIONS as usize];
        let stats = run_cycle(&mut pool, &roots, &config, &mut counts, GC_MAX_GENERATIONS, 1);
        assert_eq!(stats.cells_freed, 0);
        assert_eq!(stats.pages_swept, 0);
    }
}
