//! Inference-mode strategies, both layouts.
//!
//! The running statistics are not being differentiated, so there is no
//! reduction at all: `dx = dy * rstd * gamma`, one broadcast-elementwise
//! streaming pass. The batch mean and `x` are never read, and the weight
//! gradients are not produced in this mode.

use crate::buffer::{TileBufferPool, TransferDesc};
use crate::context::{ChannelStats, GradInputs};
use crate::element::Element;
use crate::plan::{Strategy, TilingPlan, UnitAssignment};

use super::{channel_first_index, SharedSlice};

const DY: usize = 0;

pub(super) fn run_unit<E: Element>(
    plan: &TilingPlan,
    unit: &UnitAssignment,
    stats: &ChannelStats,
    inputs: &GradInputs<'_, E>,
    dx: &SharedSlice<E>,
) {
    match plan.strategy {
        Strategy::InferChannelFirst => channel_first(plan, unit, stats, inputs, dx),
        Strategy::InferChannelLast => channel_last(plan, unit, stats, inputs, dx),
        _ => unreachable!("not an inference strategy"),
    }
}

fn channel_first<E: Element>(
    plan: &TilingPlan,
    unit: &UnitAssignment,
    stats: &ChannelStats,
    inputs: &GradInputs<'_, E>,
    dx: &SharedSlice<E>,
) {
    let tile_r = plan.tile_r;
    let pool = TileBufferPool::new(1, 2, plan.buffer_budget);

    for a in unit.a_offset..unit.a_offset + unit.a_len {
        let scale = stats.rstd[a] * stats.gamma[a];
        for r1 in 0..plan.r1_dim {
            let base = channel_first_index(plan.a_dim, plan.r0_dim, a, r1, 0);
            let mut r0 = 0;
            while r0 < plan.r0_dim {
                let len = tile_r.min(plan.r0_dim - r0);
                let offset = base + r0;
                let mut dy_buf = pool.acquire(DY);
                dy_buf.load(inputs.dy, TransferDesc::contiguous(offset, len));
                let dy_s = dy_buf.as_slice();
                for i in 0..len {
                    // Units own disjoint channels; validated by the plan.
                    unsafe { dx.write(offset + i, E::from_f32(dy_s[i] * scale)) };
                }
                r0 += len;
            }
        }
    }
}

/// Channel-last inference is the one strategy where units may own a slice
/// of the reduction axis instead of the keep axis, since no partial sums
/// exist to keep within a unit.
fn channel_last<E: Element>(
    plan: &TilingPlan,
    unit: &UnitAssignment,
    stats: &ChannelStats,
    inputs: &GradInputs<'_, E>,
    dx: &SharedSlice<E>,
) {
    let a_dim = plan.a_dim;
    let tile_a = plan.tile_a.max(1);
    let tile_r = plan.tile_r;
    let pool = TileBufferPool::new(1, 2, plan.buffer_budget);

    let mut chunk = unit.a_offset;
    while chunk < unit.a_offset + unit.a_len {
        let w = tile_a.min(unit.a_offset + unit.a_len - chunk);
        let mut r = unit.r_offset;
        while r < unit.r_offset + unit.r_len {
            let rows = tile_r.min(unit.r_offset + unit.r_len - r);
            let mut dy_buf = pool.acquire(DY);
            dy_buf.load(
                inputs.dy,
                TransferDesc {
                    offset: r * a_dim + chunk,
                    rows,
                    count: w,
                    ext_stride: a_dim,
                    local_stride: w,
                },
            );
            let dy_s = dy_buf.as_slice();
            for row in 0..rows {
                for c in 0..w {
                    let scale = stats.rstd[chunk + c] * stats.gamma[chunk + c];
                    let idx = (r + row) * a_dim + chunk + c;
                    // Units own disjoint rows; validated by the plan.
                    unsafe { dx.write(idx, E::from_f32(dy_s[row * w + c] * scale)) };
                }
            }
            r += rows;
        }
        chunk += w;
    }
}
