//! The strategy selector and the per-unit execution scaffolding.
//!
//! [`launch`] is the single entry point of the engine: it validates the plan
//! against the actual tensor handles, prepares the per-channel statistics,
//! spawns one scoped thread per unit assignment, and dispatches exactly once
//! on the strategy selector. Units never exchange partial sums; each one
//! finishes its own channels end to end, so the only shared mutable state is
//! the interleaved `dX` tensor, reached through a length-checked raw-pointer
//! view.

mod full_load;
mod infer;
mod recompute;
mod split_r1;

use std::thread;

use crate::context::{ChannelStats, GradInputs, GradOutputs};
use crate::element::Element;
use crate::plan::{PlanError, Strategy, TilingPlan};

/// Shared mutable view of the `dX` tensor.
///
/// Per-unit output elements interleave in memory (channel-first units own
/// strided element sets), so the tensor cannot be split into per-thread
/// `&mut` regions. The validated plan guarantees unit index sets are
/// disjoint, which is the entire soundness argument for the `Sync` impl.
pub(crate) struct SharedSlice<E> {
    ptr: *mut E,
    len: usize,
}

unsafe impl<E: Send> Send for SharedSlice<E> {}
unsafe impl<E: Send> Sync for SharedSlice<E> {}

impl<E: Element> SharedSlice<E> {
    fn new(slice: &mut [E]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    /// # Safety
    /// Concurrent callers must write disjoint index sets; the bounds check
    /// is enforced here, disjointness comes from plan validation.
    pub(crate) unsafe fn write(&self, idx: usize, v: E) {
        assert!(
            idx < self.len,
            "shared write at index {idx} outside tensor of {} elements",
            self.len
        );
        unsafe { self.ptr.add(idx).write(v) };
    }
}

/// Run one backward invocation under `plan`.
///
/// This is the dispatcher boundary: every shape mismatch between the plan
/// and the tensor handles surfaces here as a [`PlanError`]. Past this point
/// the engine trusts the plan unconditionally and internal breaches are
/// fatal assertions, not recoverable errors.
pub fn launch<E: Element, W: Element>(
    plan: &TilingPlan,
    inputs: &GradInputs<'_, E>,
    outputs: &mut GradOutputs<'_, E, W>,
) -> Result<(), PlanError> {
    plan.validate()?;
    plan.validate_tensors(
        inputs.dy.len(),
        inputs.mean.len(),
        inputs.second.len(),
        inputs.gamma.len(),
        outputs.dgamma.len(),
        outputs.dbeta.len(),
    )?;
    for got in [inputs.x.len(), outputs.dx.len()] {
        if got != plan.tensor_len() {
            return Err(PlanError::TensorLength {
                got,
                expected: plan.tensor_len(),
            });
        }
    }

    tracing::debug!(
        strategy = ?plan.strategy,
        a = plan.a_dim,
        r0 = plan.r0_dim,
        r1 = plan.r1_dim,
        units = plan.units.len(),
        "launching backward pass"
    );

    let stats = ChannelStats::prepare(plan, inputs);
    let dx = SharedSlice::new(outputs.dx);

    if plan.strategy.is_inference() {
        // Inference never touches the weight gradients.
        thread::scope(|s| {
            for unit in &plan.units {
                let (dx, stats) = (&dx, &stats);
                s.spawn(move || infer::run_unit(plan, unit, stats, inputs, dx));
            }
        });
    } else {
        thread::scope(|s| {
            let mut dgamma = &mut *outputs.dgamma;
            let mut dbeta = &mut *outputs.dbeta;
            for unit in &plan.units {
                // Weight gradients split cleanly: units own contiguous
                // channel ranges.
                let (dg, dg_rest) = dgamma.split_at_mut(unit.a_len);
                let (db, db_rest) = dbeta.split_at_mut(unit.a_len);
                dgamma = dg_rest;
                dbeta = db_rest;
                let (dx, stats) = (&dx, &stats);
                s.spawn(move || match plan.strategy {
                    Strategy::FullLoad => {
                        full_load::run_unit(plan, unit, stats, inputs, dx, dg, db)
                    }
                    Strategy::RecomputeSplitR0 => {
                        recompute::run_unit(plan, unit, stats, inputs, dx, dg, db)
                    }
                    Strategy::SplitR1 => {
                        split_r1::run_unit(plan, unit, stats, inputs, dx, dg, db)
                    }
                    Strategy::InferChannelFirst | Strategy::InferChannelLast => {
                        unreachable!("inference strategies are dispatched above")
                    }
                });
            }
        });
    }

    tracing::debug!(strategy = ?plan.strategy, "backward pass complete");
    Ok(())
}

/// Flat index of `(a, r1, r0)` in the channel-first `[R1, A, R0]` layout.
#[inline]
pub(crate) fn channel_first_index(
    a_dim: usize,
    r0_dim: usize,
    a: usize,
    r1: usize,
    r0: usize,
) -> usize {
    r1 * (a_dim * r0_dim) + a * r0_dim + r0
}

/// The normalization backward closed form for one element. `inv_r` is the
/// reciprocal of the plan's true global reduction count, never the local
/// tile count.
#[inline]
pub(crate) fn dx_value(
    dy: f32,
    xhat: f32,
    gamma: f32,
    rstd: f32,
    dgamma: f32,
    dbeta: f32,
    inv_r: f32,
) -> f32 {
    gamma * rstd * (dy - (xhat * dgamma + dbeta) * inv_r)
}
