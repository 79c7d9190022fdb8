//! Recompute strategy, split along the inner reduction axis R0.
//!
//! Channel-first streaming: per r1 block, whole tiles of `tile_r` feed the
//! sum hierarchy directly; the r0 tail goes through the fold path. A tail
//! longer than half a tile folds its overhang onto the first half and runs
//! the precomputed half tree; a shorter tail derives its tree inline.
//! Tail results are staged in the fold cache and merged into the hierarchy
//! in batches, so deep r1 loops with awkward tails still cost one hierarchy
//! entry per `fold_period` blocks.
//!
//! `dX` cannot be fused: the input tile is gone once reduced. A second
//! streaming pass re-reads `dy`/`x` under double buffering and applies the
//! closed form with the finalized channel sums.

use crate::buffer::{TileBufferPool, TransferDesc};
use crate::cache::{FoldCache, SumCache};
use crate::context::{ChannelStats, GradInputs};
use crate::element::Element;
use crate::plan::{TilingPlan, UnitAssignment};
use crate::reduce::{binary_add, binary_add_dyn, fold_in, BinaryAddParams};

use super::{channel_first_index, dx_value, SharedSlice};

const DY: usize = 0;
const X: usize = 1;

/// Reduce a tail tile of `len < tile_r` elements.
fn reduce_tail(buf: &mut [f32], len: usize, half: usize, half_params: BinaryAddParams) -> f32 {
    if half > 0 && len > half {
        let (head, rest) = buf.split_at_mut(half);
        fold_in(head, &rest[..len - half]);
        binary_add(head, half, half_params)
    } else {
        binary_add_dyn(buf, len)
    }
}

pub(super) fn run_unit<E: Element, W: Element>(
    plan: &TilingPlan,
    unit: &UnitAssignment,
    stats: &ChannelStats,
    inputs: &GradInputs<'_, E>,
    dx: &SharedSlice<E>,
    dgamma: &mut [W],
    dbeta: &mut [W],
) {
    let tile_r = plan.tile_r;
    let half = tile_r / 2;
    let whole = plan.r0_dim / tile_r;
    let tail = plan.r0_dim % tile_r;
    let inv_r = 1.0 / plan.r_total as f32;
    let pool = TileBufferPool::new(2, 2, plan.buffer_budget);

    for (slot, a) in (unit.a_offset..unit.a_offset + unit.a_len).enumerate() {
        let (mean, rstd, gamma) = (stats.mean[a], stats.rstd[a], stats.gamma[a]);
        let mut dbeta_cache = SumCache::new(1);
        let mut dgamma_cache = SumCache::new(1);
        let mut dbeta_fold = FoldCache::new(1, plan.fold_period);
        let mut dgamma_fold = FoldCache::new(1, plan.fold_period);

        for r1 in 0..plan.r1_dim {
            let base = channel_first_index(plan.a_dim, plan.r0_dim, a, r1, 0);
            for t in 0..whole {
                let offset = base + t * tile_r;
                let mut dy_buf = pool.acquire(DY);
                dy_buf.load(inputs.dy, TransferDesc::contiguous(offset, tile_r));
                let mut x_buf = pool.acquire(X);
                x_buf.load(inputs.x, TransferDesc::contiguous(offset, tile_r));

                xhat_dy(x_buf.as_mut_slice(), dy_buf.as_slice(), tile_r, mean, rstd);
                dbeta_cache
                    .update(&[binary_add(dy_buf.as_mut_slice(), tile_r, plan.main_binary)]);
                dgamma_cache
                    .update(&[binary_add(x_buf.as_mut_slice(), tile_r, plan.main_binary)]);
            }
            if tail > 0 {
                let offset = base + whole * tile_r;
                let mut dy_buf = pool.acquire(DY);
                dy_buf.load(inputs.dy, TransferDesc::contiguous(offset, tail));
                let mut x_buf = pool.acquire(X);
                x_buf.load(inputs.x, TransferDesc::contiguous(offset, tail));

                xhat_dy(x_buf.as_mut_slice(), dy_buf.as_slice(), tail, mean, rstd);
                let db = reduce_tail(dy_buf.as_mut_slice(), tail, half, plan.half_binary);
                let dg = reduce_tail(x_buf.as_mut_slice(), tail, half, plan.half_binary);
                dbeta_fold.push(&mut dbeta_cache, &[db]);
                dgamma_fold.push(&mut dgamma_cache, &[dg]);
            }
        }

        dbeta_fold.flush(&mut dbeta_cache);
        dgamma_fold.flush(&mut dgamma_cache);
        let mut out = [0.0f32];
        dbeta_cache.finalize(&mut out);
        let dbeta_sum = out[0];
        dgamma_cache.finalize(&mut out);
        let dgamma_sum = out[0];
        dbeta[slot] = W::from_f32(dbeta_sum);
        dgamma[slot] = W::from_f32(dgamma_sum);

        // Second pass: stream the input again and apply the closed form.
        for r1 in 0..plan.r1_dim {
            let base = channel_first_index(plan.a_dim, plan.r0_dim, a, r1, 0);
            let mut r0 = 0;
            while r0 < plan.r0_dim {
                let len = tile_r.min(plan.r0_dim - r0);
                let offset = base + r0;
                let mut dy_buf = pool.acquire(DY);
                dy_buf.load(inputs.dy, TransferDesc::contiguous(offset, len));
                let mut x_buf = pool.acquire(X);
                x_buf.load(inputs.x, TransferDesc::contiguous(offset, len));

                let dy_s = dy_buf.as_slice();
                let x_s = x_buf.as_slice();
                for i in 0..len {
                    let xhat = (x_s[i] - mean) * rstd;
                    let v = dx_value(dy_s[i], xhat, gamma, rstd, dgamma_sum, dbeta_sum, inv_r);
                    // Units own disjoint channels; validated by the plan.
                    unsafe { dx.write(offset + i, E::from_f32(v)) };
                }
                r0 += len;
            }
        }
    }
}

/// `xhat * dy` written over the x tile in place.
#[inline]
fn xhat_dy(x: &mut [f32], dy: &[f32], len: usize, mean: f32, rstd: f32) {
    for i in 0..len {
        x[i] = (x[i] - mean) * rstd * dy[i];
    }
}
