//! The tiling plan: the contract between the external host planner and the
//! engine.
//!
//! A plan is plain data. The planner decides, ahead of invocation, how many
//! parallel units run, how the keep and reduction axes are split, which
//! strategy applies, and the binary-tree parameters for the hot tile sizes.
//! The engine trusts a validated plan completely: every configuration error
//! is fatal here, at construction time, and none are re-checked inside the
//! reduction loops.

use serde::{Deserialize, Serialize};

use crate::cache::FOLD_CAPACITY;
use crate::reduce::{BinaryAddParams, LANE};

/// Storage layout of the data-side tensors.
///
/// Channel-first places the keep axis between an outer strided reduction
/// segment R1 and an inner contiguous segment R0 (`[R1, A, R0]`);
/// channel-last makes the keep axis fastest-varying (`[R, A]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    ChannelFirst,
    ChannelLast,
}

/// The closed set of tiling strategies the selector dispatches among.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Whole per-channel reduction slice resident at once; stats and dX in
    /// one fused sweep.
    FullLoad,
    /// Channel-first streaming over R0 tiles; dX recomputed in a second
    /// streaming pass.
    RecomputeSplitR0,
    /// Channel-last (R x A) row tiles; per-lane cache bank, second pass
    /// for dX.
    SplitR1,
    /// Inference mode, channel-first: pure elementwise dX, no reduction.
    InferChannelFirst,
    /// Inference mode, channel-last: pure elementwise dX; units may also
    /// own a disjoint slice of the reduction axis.
    InferChannelLast,
}

impl Strategy {
    pub fn layout(self) -> Layout {
        match self {
            Strategy::FullLoad | Strategy::RecomputeSplitR0 | Strategy::InferChannelFirst => {
                Layout::ChannelFirst
            }
            Strategy::SplitR1 | Strategy::InferChannelLast => Layout::ChannelLast,
        }
    }

    pub fn is_inference(self) -> bool {
        matches!(self, Strategy::InferChannelFirst | Strategy::InferChannelLast)
    }
}

/// Static work assignment for one parallel unit.
///
/// Units own disjoint contiguous keep-axis slices. The reduction-axis slice
/// is meaningful only for the channel-last inference strategy; reduction
/// strategies always give a unit the full axis, since partial sums never
/// cross units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAssignment {
    pub a_offset: usize,
    pub a_len: usize,
    pub r_offset: usize,
    pub r_len: usize,
}

/// Everything the engine needs to run one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingPlan {
    pub strategy: Strategy,
    /// Keep-axis (channel) length.
    pub a_dim: usize,
    /// Inner contiguous reduction segment (full R for channel-last).
    pub r0_dim: usize,
    /// Outer strided reduction segment (1 for channel-last).
    pub r1_dim: usize,
    /// True global reduction count behind the saved mean/variance. For a
    /// plan that covers the whole tensor this is `r0_dim * r1_dim`, but a
    /// sliced plan must still carry the global count.
    pub r_total: usize,
    pub epsilon: f32,
    /// Main tile length along the reduction axis, per keep-axis lane.
    pub tile_r: usize,
    /// Keep-axis width per tile (channel-last strategies).
    pub tile_a: usize,
    /// Fold-cache merge period.
    pub fold_period: usize,
    /// Per-buffer scratch capacity in f32 elements.
    pub buffer_budget: usize,
    /// Tree shape for `tile_r`.
    pub main_binary: BinaryAddParams,
    /// Tree shape for `tile_r / 2` (the fold path).
    pub half_binary: BinaryAddParams,
    pub units: Vec<UnitAssignment>,
}

/// Fatal plan-construction errors. None of these are recoverable by the
/// engine; a plan that validates is trusted unconditionally afterwards.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("axis lengths must be non-zero (a={a}, r0={r0}, r1={r1})")]
    EmptyAxis { a: usize, r0: usize, r1: usize },
    #[error("tile of {tile} elements exceeds buffer budget of {budget}")]
    TileExceedsBudget { tile: usize, budget: usize },
    #[error("plan produces {tiles} tiles per lane, above the 256^3 cache capacity")]
    CacheOverflow { tiles: u64 },
    #[error("fold period {period} outside 1..={max}", max = FOLD_CAPACITY)]
    BadFoldPeriod { period: usize },
    #[error("binary-add params inconsistent with tile length {len}")]
    BadBinaryParams { len: usize },
    #[error("plan has no unit assignments")]
    NoUnits,
    #[error("unit assignments must tile the keep axis contiguously (unit {unit} starts at {got}, expected {expected})")]
    UnitGap {
        unit: usize,
        got: usize,
        expected: usize,
    },
    #[error("unit assignments cover {covered} of {expected} channels")]
    UnitCoverage { covered: usize, expected: usize },
    #[error("unit {unit} owns reduction rows {offset}..{end} outside the axis of length {r}")]
    UnitReductionRange {
        unit: usize,
        offset: usize,
        end: usize,
        r: usize,
    },
    #[error("unit assignments must tile the reduction axis contiguously (unit {unit} starts at {got}, expected {expected})")]
    UnitReductionGap {
        unit: usize,
        got: usize,
        expected: usize,
    },
    #[error("unit assignments cover {covered} of {expected} reduction rows")]
    UnitReductionCoverage { covered: usize, expected: usize },
    #[error("tensor of {got} elements does not match the plan's {expected}")]
    TensorLength { got: usize, expected: usize },
    #[error("per-channel tensor of {got} values does not match {expected} channels")]
    ChannelLength { got: usize, expected: usize },
}

impl TilingPlan {
    /// Reduction elements per channel covered by this plan.
    pub fn r_dim(&self) -> usize {
        self.r0_dim * self.r1_dim
    }

    /// Total data-side tensor length the plan expects.
    pub fn tensor_len(&self) -> usize {
        self.a_dim * self.r_dim()
    }

    /// Validate every static property of the plan. All configuration
    /// errors surface here and only here.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.a_dim == 0 || self.r0_dim == 0 || self.r1_dim == 0 || self.r_total == 0 {
            return Err(PlanError::EmptyAxis {
                a: self.a_dim,
                r0: self.r0_dim,
                r1: self.r1_dim,
            });
        }
        if self.tile_r == 0 || self.tile_r > self.buffer_budget {
            return Err(PlanError::TileExceedsBudget {
                tile: self.tile_r,
                budget: self.buffer_budget,
            });
        }
        if self.tile_a > 0 && self.tile_a * self.tile_r > self.buffer_budget {
            return Err(PlanError::TileExceedsBudget {
                tile: self.tile_a * self.tile_r,
                budget: self.buffer_budget,
            });
        }
        if self.strategy == Strategy::FullLoad && self.r_dim() > self.buffer_budget {
            return Err(PlanError::TileExceedsBudget {
                tile: self.r_dim(),
                budget: self.buffer_budget,
            });
        }
        if !(1..=FOLD_CAPACITY).contains(&self.fold_period) {
            return Err(PlanError::BadFoldPeriod {
                period: self.fold_period,
            });
        }
        if !self.main_binary.matches(self.tile_r) {
            return Err(PlanError::BadBinaryParams { len: self.tile_r });
        }
        if !self.half_binary.matches(self.tile_r / 2) {
            return Err(PlanError::BadBinaryParams {
                len: self.tile_r / 2,
            });
        }
        // Tiles per lane across the whole reduction axis; the hierarchy
        // holds 256^3 before overflow.
        let tiles_per_r1 = self.r0_dim.div_ceil(self.tile_r) as u64;
        let tiles = tiles_per_r1 * self.r1_dim as u64;
        if tiles >= (1u64 << 24) {
            return Err(PlanError::CacheOverflow { tiles });
        }
        self.validate_units()
    }

    fn validate_units(&self) -> Result<(), PlanError> {
        if self.units.is_empty() {
            return Err(PlanError::NoUnits);
        }
        let split_r = self.strategy == Strategy::InferChannelLast;
        let mut next_a = 0usize;
        let mut next_r = 0usize;
        for (i, u) in self.units.iter().enumerate() {
            if split_r {
                // Reduction slices must be disjoint and cover the axis:
                // dX rows are written through a shared view, so an overlap
                // here would be a data race, not just a wrong answer.
                if u.r_offset != next_r {
                    return Err(PlanError::UnitReductionGap {
                        unit: i,
                        got: u.r_offset,
                        expected: next_r,
                    });
                }
                next_r += u.r_len;
            } else {
                if u.a_offset != next_a {
                    return Err(PlanError::UnitGap {
                        unit: i,
                        got: u.a_offset,
                        expected: next_a,
                    });
                }
                next_a += u.a_len;
                let r = self.r_dim();
                if u.r_offset + u.r_len > r {
                    return Err(PlanError::UnitReductionRange {
                        unit: i,
                        offset: u.r_offset,
                        end: u.r_offset + u.r_len,
                        r,
                    });
                }
            }
        }
        if split_r {
            if next_r != self.r_dim() {
                return Err(PlanError::UnitReductionCoverage {
                    covered: next_r,
                    expected: self.r_dim(),
                });
            }
        } else if next_a != self.a_dim {
            return Err(PlanError::UnitCoverage {
                covered: next_a,
                expected: self.a_dim,
            });
        }
        Ok(())
    }

    /// Validate the actual tensor handles against the plan. This is the
    /// dispatcher boundary: past this point shape mismatches are contract
    /// violations, not recoverable errors.
    pub fn validate_tensors(
        &self,
        data_len: usize,
        mean_len: usize,
        second_len: usize,
        gamma_len: usize,
        dgamma_len: usize,
        dbeta_len: usize,
    ) -> Result<(), PlanError> {
        let expected = self.tensor_len();
        if data_len != expected {
            return Err(PlanError::TensorLength {
                got: data_len,
                expected,
            });
        }
        for got in [mean_len, second_len, gamma_len, dgamma_len, dbeta_len] {
            if got != self.a_dim {
                return Err(PlanError::ChannelLength {
                    got,
                    expected: self.a_dim,
                });
            }
        }
        Ok(())
    }

    /// Minimal host-planner stand-in: derive tile sizes from a buffer
    /// budget and split the keep axis evenly across `units`.
    ///
    /// The real planner is an external collaborator; this constructor only
    /// mirrors its arithmetic so tests and simple callers can build plans.
    pub fn for_shape(
        strategy: Strategy,
        a_dim: usize,
        r0_dim: usize,
        r1_dim: usize,
        epsilon: f32,
        buffer_budget: usize,
        units: usize,
    ) -> Result<Self, PlanError> {
        if a_dim == 0 || r0_dim == 0 || r1_dim == 0 {
            return Err(PlanError::EmptyAxis {
                a: a_dim,
                r0: r0_dim,
                r1: r1_dim,
            });
        }
        let r_dim = r0_dim * r1_dim;
        let tile_a = match strategy.layout() {
            Layout::ChannelFirst => 1,
            Layout::ChannelLast => a_dim.min(LANE),
        };
        let per_lane = buffer_budget / tile_a.max(1);
        let tile_r = match strategy {
            // Full load keeps the whole per-channel slice resident.
            Strategy::FullLoad => r_dim,
            _ => r0_dim.min(per_lane).max(1),
        };
        let units = if strategy == Strategy::InferChannelLast {
            units.max(1)
        } else {
            units.max(1).min(a_dim)
        };
        let plan = Self {
            strategy,
            a_dim,
            r0_dim,
            r1_dim,
            r_total: r_dim,
            epsilon,
            tile_r,
            tile_a,
            fold_period: (FOLD_CAPACITY / 2).max(1),
            buffer_budget,
            main_binary: BinaryAddParams::for_len(tile_r),
            half_binary: BinaryAddParams::for_len(tile_r / 2),
            units: Self::split_units(strategy, a_dim, r_dim, units),
        };
        plan.validate()?;
        Ok(plan)
    }

    fn split_units(
        strategy: Strategy,
        a_dim: usize,
        r_dim: usize,
        units: usize,
    ) -> Vec<UnitAssignment> {
        if strategy == Strategy::InferChannelLast {
            // Elementwise pass: split the reduction rows, keep all channels.
            let rows_per = r_dim.div_ceil(units);
            return (0..units)
                .filter_map(|i| {
                    let r_offset = i * rows_per;
                    if r_offset >= r_dim {
                        return None;
                    }
                    Some(UnitAssignment {
                        a_offset: 0,
                        a_len: a_dim,
                        r_offset,
                        r_len: rows_per.min(r_dim - r_offset),
                    })
                })
                .collect();
        }
        let per = a_dim.div_ceil(units);
        (0..units)
            .filter_map(|i| {
                let a_offset = i * per;
                if a_offset >= a_dim {
                    return None;
                }
                Some(UnitAssignment {
                    a_offset,
                    a_len: per.min(a_dim - a_offset),
                    r_offset: 0,
                    r_len: r_dim,
                })
            })
            .collect()
    }
}
