//! Full-load strategy: the whole per-channel reduction slice is resident at
//! once, so the statistics trees and the elementwise `dX` pass run fused
//! over the same tile with no second read of the input.

use crate::buffer::{TileBufferPool, TransferDesc};
use crate::context::{ChannelStats, GradInputs};
use crate::element::Element;
use crate::plan::{TilingPlan, UnitAssignment};
use crate::reduce::{binary_add, BinaryAddParams};

use super::{channel_first_index, dx_value, SharedSlice};

const DY: usize = 0;
const X: usize = 1;
const SCRATCH: usize = 2;

pub(super) fn run_unit<E: Element, W: Element>(
    plan: &TilingPlan,
    unit: &UnitAssignment,
    stats: &ChannelStats,
    inputs: &GradInputs<'_, E>,
    dx: &SharedSlice<E>,
    dgamma: &mut [W],
    dbeta: &mut [W],
) {
    let r_dim = plan.r_dim();
    let params = BinaryAddParams::for_len(r_dim);
    let inv_r = 1.0 / plan.r_total as f32;
    // dy and x stay resident for the fused dX pass; reductions run on the
    // scratch stream because the tree destroys its input.
    let pool = TileBufferPool::new(3, 1, plan.buffer_budget);

    for (slot, a) in (unit.a_offset..unit.a_offset + unit.a_len).enumerate() {
        let desc = TransferDesc {
            offset: a * plan.r0_dim,
            rows: plan.r1_dim,
            count: plan.r0_dim,
            ext_stride: plan.a_dim * plan.r0_dim,
            local_stride: plan.r0_dim,
        };
        let mut dy_buf = pool.acquire(DY);
        dy_buf.load(inputs.dy, desc);
        let mut x_buf = pool.acquire(X);
        x_buf.load(inputs.x, desc);
        let mut scratch = pool.acquire(SCRATCH);

        let (mean, rstd, gamma) = (stats.mean[a], stats.rstd[a], stats.gamma[a]);

        scratch.as_mut_slice()[..r_dim].copy_from_slice(&dy_buf.as_slice()[..r_dim]);
        let dbeta_sum = binary_add(scratch.as_mut_slice(), r_dim, params);

        {
            let s = scratch.as_mut_slice();
            let dy_s = dy_buf.as_slice();
            let x_s = x_buf.as_slice();
            for i in 0..r_dim {
                s[i] = (x_s[i] - mean) * rstd * dy_s[i];
            }
        }
        let dgamma_sum = binary_add(scratch.as_mut_slice(), r_dim, params);

        dbeta[slot] = W::from_f32(dbeta_sum);
        dgamma[slot] = W::from_f32(dgamma_sum);

        let dy_s = dy_buf.as_slice();
        let x_s = x_buf.as_slice();
        for r1 in 0..plan.r1_dim {
            for r0 in 0..plan.r0_dim {
                let local = r1 * plan.r0_dim + r0;
                let xhat = (x_s[local] - mean) * rstd;
                let v = dx_value(dy_s[local], xhat, gamma, rstd, dgamma_sum, dbeta_sum, inv_r);
                let idx = channel_first_index(plan.a_dim, plan.r0_dim, a, r1, r0);
                // Units own disjoint channels; validated by the plan.
                unsafe { dx.write(idx, E::from_f32(v)) };
            }
        }
    }
}
