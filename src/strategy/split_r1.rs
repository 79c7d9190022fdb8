//! Split-outer-axis strategy for the channel-last `[R, A]` layout.
//!
//! Keep-axis chunks of `tile_a` channels are processed together: each row
//! tile gathers `rows x tile_a` elements (one strided load, rows `a_dim`
//! apart), the row tree collapses it to one row of per-channel sums, and a
//! `tile_a`-wide cache bank accumulates across tiles. Tail row counts go
//! through the same row tree with the shape derived inline, so no fold
//! cache is needed here.

use crate::buffer::{TileBufferPool, TransferDesc};
use crate::cache::SumCache;
use crate::context::{ChannelStats, GradInputs};
use crate::element::Element;
use crate::plan::{TilingPlan, UnitAssignment};
use crate::reduce::binary_add_rows;

use super::{dx_value, SharedSlice};

const DY: usize = 0;
const X: usize = 1;

pub(super) fn run_unit<E: Element, W: Element>(
    plan: &TilingPlan,
    unit: &UnitAssignment,
    stats: &ChannelStats,
    inputs: &GradInputs<'_, E>,
    dx: &SharedSlice<E>,
    dgamma: &mut [W],
    dbeta: &mut [W],
) {
    let a_dim = plan.a_dim;
    let r_dim = plan.r_dim();
    let tile_a = plan.tile_a.max(1);
    let tile_r = plan.tile_r;
    let inv_r = 1.0 / plan.r_total as f32;
    let pool = TileBufferPool::new(2, 2, plan.buffer_budget);

    let mut chunk = unit.a_offset;
    while chunk < unit.a_offset + unit.a_len {
        let w = tile_a.min(unit.a_offset + unit.a_len - chunk);
        let mean = &stats.mean[chunk..chunk + w];
        let rstd = &stats.rstd[chunk..chunk + w];
        let gamma = &stats.gamma[chunk..chunk + w];
        let mut dbeta_cache = SumCache::new(w);
        let mut dgamma_cache = SumCache::new(w);

        let mut r = 0;
        while r < r_dim {
            let rows = tile_r.min(r_dim - r);
            let desc = TransferDesc {
                offset: r * a_dim + chunk,
                rows,
                count: w,
                ext_stride: a_dim,
                local_stride: w,
            };
            let mut dy_buf = pool.acquire(DY);
            dy_buf.load(inputs.dy, desc);
            let mut x_buf = pool.acquire(X);
            x_buf.load(inputs.x, desc);

            {
                let xs = x_buf.as_mut_slice();
                let dys = dy_buf.as_slice();
                for row in 0..rows {
                    for c in 0..w {
                        let i = row * w + c;
                        xs[i] = (xs[i] - mean[c]) * rstd[c] * dys[i];
                    }
                }
            }
            binary_add_rows(dy_buf.as_mut_slice(), rows, w);
            dbeta_cache.update(&dy_buf.as_slice()[..w]);
            binary_add_rows(x_buf.as_mut_slice(), rows, w);
            dgamma_cache.update(&x_buf.as_slice()[..w]);
            r += rows;
        }

        let mut dbeta_sum = vec![0.0f32; w];
        dbeta_cache.finalize(&mut dbeta_sum);
        let mut dgamma_sum = vec![0.0f32; w];
        dgamma_cache.finalize(&mut dgamma_sum);
        for c in 0..w {
            dbeta[chunk - unit.a_offset + c] = W::from_f32(dbeta_sum[c]);
            dgamma[chunk - unit.a_offset + c] = W::from_f32(dgamma_sum[c]);
        }

        // Second pass: re-stream the chunk and apply the closed form.
        let mut r = 0;
        while r < r_dim {
            let rows = tile_r.min(r_dim - r);
            let desc = TransferDesc {
                offset: r * a_dim + chunk,
                rows,
                count: w,
                ext_stride: a_dim,
                local_stride: w,
            };
            let mut dy_buf = pool.acquire(DY);
            dy_buf.load(inputs.dy, desc);
            let mut x_buf = pool.acquire(X);
            x_buf.load(inputs.x, desc);

            let dys = dy_buf.as_slice();
            let xs = x_buf.as_slice();
            for row in 0..rows {
                for c in 0..w {
                    let i = row * w + c;
                    let xhat = (xs[i] - mean[c]) * rstd[c];
                    let v = dx_value(
                        dys[i],
                        xhat,
                        gamma[c],
                        rstd[c],
                        dgamma_sum[c],
                        dbeta_sum[c],
                        inv_r,
                    );
                    let idx = (r + row) * a_dim + chunk + c;
                    // Units own disjoint channels; validated by the plan.
                    unsafe { dx.write(idx, E::from_f32(v)) };
                }
            }
            r += rows;
        }

        chunk += w;
    }
}
