//! Cross-tile accumulation cache.
//!
//! An unbounded stream of per-tile partial sums is merged into one value per
//! keep-axis lane using a bounded amount of scratch: a base-256 positional
//! accumulator. Level 0 collects raw tile results; each time a level's bank
//! of 256 slots fills, the bank is tree-reduced into one slot of the level
//! above and reused. Three levels give 256^3 tiles of headroom, which the
//! host planner guarantees is never exceeded.
//!
//! The hierarchy must behave exactly as if every tile result were folded
//! into a flat accumulator in tile order, regardless of how the caller
//! chunked the tile sequence into main/fold/tail sub-loops; the only
//! reassociation permitted is the documented tree order within a bank.

use crate::reduce::binary_add_rows;

/// Slots per level; promotion to the next level happens when a bank fills.
pub const LEVEL_CAPACITY: usize = 256;

/// Number of hierarchy levels.
pub const LEVELS: usize = 3;

/// Capacity of the auxiliary fold cache.
pub const FOLD_CAPACITY: usize = 64;

/// Three-level partial-sum hierarchy, `width` lanes wide.
///
/// `width` is 1 for the per-channel scalar strategies and the keep-axis
/// tile width for the channel-last row strategies.
#[derive(Debug)]
pub struct SumCache {
    width: usize,
    levels: [Vec<f32>; LEVELS],
    counts: [usize; LEVELS],
    tiles: u64,
}

impl SumCache {
    pub fn new(width: usize) -> Self {
        assert!(width > 0, "cache width must be non-zero");
        Self {
            width,
            levels: std::array::from_fn(|_| vec![0.0; LEVEL_CAPACITY * width]),
            counts: [0; LEVELS],
            tiles: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Total tile results folded in so far.
    pub fn tiles_seen(&self) -> u64 {
        self.tiles
    }

    /// Fold one tile result (one row of `width` lane sums) into the
    /// hierarchy, promoting full banks upward.
    pub fn update(&mut self, row: &[f32]) {
        assert_eq!(row.len(), self.width, "tile result width mismatch");
        if self.counts[0] == LEVEL_CAPACITY {
            self.promote(0);
        }
        let at = self.counts[0] * self.width;
        self.levels[0][at..at + self.width].copy_from_slice(row);
        self.counts[0] += 1;
        self.tiles += 1;
    }

    /// Tree-reduce a full bank into the next level's open slot and reset it.
    fn promote(&mut self, level: usize) {
        debug_assert_eq!(self.counts[level], LEVEL_CAPACITY);
        assert!(
            level + 1 < LEVELS,
            "cache hierarchy overflow: more than 256^3 tiles; the tiling plan must prevent this"
        );
        if self.counts[level + 1] == LEVEL_CAPACITY {
            self.promote(level + 1);
        }
        // The bank is a full power of two, so the row tree is exact in shape.
        let (lower, upper) = {
            let (a, b) = self.levels.split_at_mut(level + 1);
            (&mut a[level], &mut b[0])
        };
        binary_add_rows(lower, LEVEL_CAPACITY, self.width);
        let at = self.counts[level + 1] * self.width;
        upper[at..at + self.width].copy_from_slice(&lower[..self.width]);
        self.counts[level + 1] += 1;
        self.counts[level] = 0;
        lower.fill(0.0);
    }

    /// Reduce every populated slot of every level exactly once, writing the
    /// grand total per lane into `out`. Leaves the cache empty.
    pub fn finalize(&mut self, out: &mut [f32]) {
        assert_eq!(out.len(), self.width, "finalize output width mismatch");
        out.fill(0.0);
        for level in 0..LEVELS {
            let populated = self.counts[level];
            if populated == 0 {
                continue;
            }
            binary_add_rows(&mut self.levels[level], populated, self.width);
            for c in 0..self.width {
                out[c] += self.levels[level][c];
            }
            self.levels[level].fill(0.0);
            self.counts[level] = 0;
        }
        self.tiles = 0;
    }
}

/// Auxiliary accumulator for the fold tiling policy.
///
/// Fold-path tile results are staged here and merged into the main
/// hierarchy as a single combined entry every `period` results, or at
/// whatever partial count remains when the tile sequence ends. Regardless
/// of where the period boundaries land, every staged result is summed into
/// the hierarchy exactly once.
#[derive(Debug)]
pub struct FoldCache {
    width: usize,
    period: usize,
    buf: Vec<f32>,
    count: usize,
}

impl FoldCache {
    pub fn new(width: usize, period: usize) -> Self {
        assert!(
            (1..=FOLD_CAPACITY).contains(&period),
            "fold period {period} outside 1..={FOLD_CAPACITY}"
        );
        Self {
            width,
            period,
            buf: vec![0.0; FOLD_CAPACITY * width],
            count: 0,
        }
    }

    /// Stage one fold-path tile result; merges into `cache` when the
    /// period elapses.
    pub fn push(&mut self, cache: &mut SumCache, row: &[f32]) {
        assert_eq!(row.len(), self.width, "fold result width mismatch");
        let at = self.count * self.width;
        self.buf[at..at + self.width].copy_from_slice(row);
        self.count += 1;
        if self.count == self.period {
            self.flush(cache);
        }
    }

    /// Merge any partial period into the hierarchy; no-op when empty.
    pub fn flush(&mut self, cache: &mut SumCache) {
        if self.count == 0 {
            return;
        }
        binary_add_rows(&mut self.buf, self.count, self.width);
        let row: Vec<f32> = self.buf[..self.width].to_vec();
        cache.update(&row);
        self.buf.fill(0.0);
        self.count = 0;
    }

    pub fn staged(&self) -> usize {
        self.count
    }
}
