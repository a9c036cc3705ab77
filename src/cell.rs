//! Cell Allocator (spec §4.3).
//!
//! Tracks which cells of a single logical page are in use via a bitmap
//! stored in the page header (cell 0). `CELLS_PER_PAGE` is 128 on a
//! 64-bit build and 64 on 32-bit, so the bitmap is either two `u64`
//! words or one, per [`crate::config::CELLS_PER_PAGE`]. Bit `i`
//! represents cell `i`; bit order is unified LSB-first regardless of
//! target width (Open Question resolution 3 — see `SPEC_FULL.md`).

use crate::config::CELLS_PER_PAGE;

const WORD_BITS: usize = 64;
const WORDS: usize = (CELLS_PER_PAGE + WORD_BITS - 1) / WORD_BITS;

/// A fixed-size bitmap tracking cell occupancy within one page.
#[derive(Debug, Clone, Copy)]
pub struct CellBitmap {
    words: [u64; WORDS],
}

impl CellBitmap {
    /// An empty bitmap with the reserved header cell (cell 0) already
    /// marked set, per spec §3 invariant 8.
    pub fn new() -> Self {
        let mut bm = CellBitmap { words: [0; WORDS] };
        bm.set_cells(0, 1);
        bm
    }

    /// A bitmap with every cell marked free, including the header
    /// cell. Used only while rebuilding a page during compaction.
    pub fn empty() -> Self {
        CellBitmap { words: [0; WORDS] }
    }

    fn word_index(cell: usize) -> (usize, u32) {
        (cell / WORD_BITS, (cell % WORD_BITS) as u32)
    }

    pub fn test_cell(&self, cell: usize) -> bool {
        let (w, b) = Self::word_index(cell);
        self.words[w] & (1u64 << b) != 0
    }

    pub fn set_cells(&mut self, first: usize, count: usize) {
        for cell in first..first + count {
            let (w, b) = Self::word_index(cell);
            self.words[w] |= 1u64 << b;
        }
    }

    pub fn clear_cells(&mut self, first: usize, count: usize) {
        for cell in first..first + count {
            let (w, b) = Self::word_index(cell);
            self.words[w] &= !(1u64 << b);
        }
    }

    /// Clear every cell except the reserved header cell (cell 0).
    pub fn clear_all_cells(&mut self) {
        self.words = [0; WORDS];
        self.set_cells(0, 1);
    }

    /// Number of cells currently marked in-use, via `count_ones`
    /// rather than a hand-rolled popcount (Open Question resolution 2).
    pub fn count_set_cells(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn count_free_cells(&self) -> usize {
        CELLS_PER_PAGE - self.count_set_cells()
    }

    /// Find the first run of `count` consecutive free cells at or
    /// after `start`, by scanning whole words with `trailing_zeros`/
    /// `trailing_ones` instead of a precomputed per-byte lookup table.
    pub fn find_run(&self, start: usize, count: usize) -> Option<usize> {
        if count == 0 {
            return Some(start);
        }
        let mut cell = start;
        while cell + count <= CELLS_PER_PAGE {
            if self.test_cell(cell) {
                cell += 1;
                continue;
            }
            let run_end = self.free_run_end(cell);
            if run_end - cell >= count {
                return Some(cell);
            }
            cell = run_end;
        }
        None
    }

    /// Given that cell `from` is free, return the index one past the
    /// end of the maximal free run starting at `from`.
    fn free_run_end(&self, from: usize) -> usize {
        let mut cell = from;
        while cell < CELLS_PER_PAGE {
            let (w, b) = Self::word_index(cell);
            let word = self.words[w] >> b;
            if word == 0 {
                // every remaining bit in this word (from `b` on) is free
                cell += WORD_BITS - b as usize;
                continue;
            }
            let run = word.trailing_zeros() as usize;
            return (cell + run).min(CELLS_PER_PAGE);
        }
        CELLS_PER_PAGE
    }

    pub fn is_empty(&self) -> bool {
        // Only the reserved header cell set counts as "empty" of user data.
        self.count_set_cells() <= 1
    }

    pub fn is_full(&self) -> bool {
        self.count_set_cells() == CELLS_PER_PAGE
    }
}

impl Default for CellBitmap {
    fn default() -> Self {
        Self::new()
    }
}
