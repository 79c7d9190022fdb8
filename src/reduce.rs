//! Tile-local binary-tree reduction.
//!
//! A tile's worth of reduction-axis elements is collapsed to one scalar per
//! keep-axis lane by pairwise halving: fold the non-power-of-two remainder
//! into the head of the buffer, halve the active length `stages` times, then
//! horizontally sum the lane-wide tail. Pairwise summation bounds error
//! growth to O(log n) where a running sum drifts with O(n).
//!
//! The tree shape for a given length is fixed by [`BinaryAddParams`], which
//! the host planner precomputes for the hot tile sizes; arbitrary tail
//! lengths derive the same shape inline via [`binary_add_dyn`].

use serde::{Deserialize, Serialize};

/// Number of f32 values a single vector lane holds. Stage counts and the
/// horizontal tail width are expressed against this.
pub const LANE: usize = 64;

/// Precomputed shape of the pairwise reduction tree for one tile length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryAddParams {
    /// Largest power of two not exceeding the tile length; the tree operates
    /// on this prefix after the remainder pre-fold.
    pub quotient: usize,
    /// Number of halving passes: `log2(quotient / last_num)`.
    pub stages: u32,
    /// Width of the final horizontal reduce, `min(quotient, LANE)`.
    pub last_num: usize,
}

impl BinaryAddParams {
    /// Derive the tree shape for a tile of `len` elements.
    pub fn for_len(len: usize) -> Self {
        if len <= LANE {
            return Self {
                quotient: len,
                stages: 0,
                last_num: len,
            };
        }
        let quotient = prev_power_of_two(len);
        let last_num = LANE;
        let stages = (quotient / last_num).trailing_zeros();
        Self {
            quotient,
            stages,
            last_num,
        }
    }

    /// Whether these params describe the tree for a tile of `len` elements.
    pub fn matches(&self, len: usize) -> bool {
        *self == Self::for_len(len)
    }
}

/// Largest power of two `<= n`. `n` must be non-zero.
#[inline]
pub(crate) fn prev_power_of_two(n: usize) -> usize {
    debug_assert!(n > 0);
    1 << (usize::BITS - 1 - n.leading_zeros())
}

/// Horizontal sum of one lane-wide (or shorter) run.
#[inline]
fn lane_sum(vals: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for &v in vals {
        acc += v;
    }
    acc
}

/// Pairwise-halving reduction of `buf[..len]` to a single scalar.
///
/// Destroys the prefix of `buf` as scratch. Tiles no longer than [`LANE`]
/// skip the tree entirely and go straight to the horizontal reduce.
pub fn binary_add(buf: &mut [f32], len: usize, params: BinaryAddParams) -> f32 {
    debug_assert!(len <= buf.len());
    debug_assert!(params.matches(len), "tree params do not match tile length {len}");
    if len <= LANE {
        return lane_sum(&buf[..len]);
    }
    let quotient = params.quotient;
    // Remainder pre-fold: one elementwise add per surplus element.
    for i in 0..len - quotient {
        buf[i] += buf[quotient + i];
    }
    // Halving stages: add the back half onto the front half in place.
    let mut width = quotient;
    for _ in 0..params.stages {
        width /= 2;
        let (head, tail) = buf.split_at_mut(width);
        for i in 0..width {
            head[i] += tail[i];
        }
    }
    debug_assert_eq!(width, params.last_num);
    lane_sum(&buf[..params.last_num])
}

/// [`binary_add`] with the tree shape derived inline; used on tail tiles
/// whose length the plan did not precompute.
pub fn binary_add_dyn(buf: &mut [f32], len: usize) -> f32 {
    binary_add(buf, len, BinaryAddParams::for_len(len))
}

/// "Fold" pre-step: sum a second half-tile onto the first before the
/// ordinary tree runs, letting one reduction call cover both sub-tiles.
#[inline]
pub fn fold_in(main: &mut [f32], fold: &[f32]) {
    debug_assert!(fold.len() <= main.len());
    for (m, f) in main.iter_mut().zip(fold) {
        *m += f;
    }
}

/// Pairwise row-tree over a row-major `rows x width` tile, leaving the
/// per-column sums in `buf[..width]`.
///
/// Same remainder-then-halving order as [`binary_add`], applied to whole
/// rows; this is the reduction used by (R x A) channel-last tiles.
pub fn binary_add_rows(buf: &mut [f32], rows: usize, width: usize) {
    debug_assert!(rows * width <= buf.len());
    if rows <= 1 {
        return;
    }
    let quotient = prev_power_of_two(rows);
    // Fold surplus rows onto the head rows.
    for r in 0..rows - quotient {
        let (head, tail) = buf.split_at_mut((quotient + r) * width);
        let dst = &mut head[r * width..r * width + width];
        let src = &tail[..width];
        for c in 0..width {
            dst[c] += src[c];
        }
    }
    // Halve the row count down to one.
    let mut active = quotient;
    while active > 1 {
        active /= 2;
        let (head, tail) = buf.split_at_mut(active * width);
        for r in 0..active {
            let dst = &mut head[r * width..r * width + width];
            let src = &tail[r * width..r * width + width];
            for c in 0..width {
                dst[c] += src[c];
            }
        }
    }
}
