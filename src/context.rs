//! Per-invocation tensor context.
//!
//! The host hands over the saved forward statistics either as a variance or
//! as an already-inverted reciprocal standard deviation; the engine folds
//! both into one prepared per-channel table so the strategy loops never
//! branch on the representation.

use crate::element::Element;
use crate::plan::TilingPlan;

/// The forward pass's second-moment statistic, in whichever form the host
/// saved it.
#[derive(Debug, Clone, Copy)]
pub enum SecondMoment<'a> {
    /// Per-channel batch variance; the engine derives rstd itself.
    Variance(&'a [f32]),
    /// Per-channel `1 / sqrt(var + eps)`, precomputed by the host.
    Rstd(&'a [f32]),
}

impl SecondMoment<'_> {
    pub fn len(&self) -> usize {
        match self {
            SecondMoment::Variance(v) | SecondMoment::Rstd(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `1 / sqrt(var + eps)` at better-than-f32 accuracy.
///
/// The quotient and square root run in f64, then one Newton-Raphson step
/// polishes the f64 estimate before the single narrowing to f32. The extra
/// step costs nothing measurable and keeps the scale factor exact to the
/// last f32 bit even for tiny variances.
pub fn reciprocal_std(variance: f32, epsilon: f32) -> f32 {
    let x = variance as f64 + epsilon as f64;
    let mut r = 1.0 / x.sqrt();
    r = r * (1.5 - 0.5 * x * r * r);
    r as f32
}

/// Read-only inputs of one backward invocation.
///
/// Data-side tensors (`dy`, `x`) are in the storage element type `E`; the
/// per-channel statistics arrive as f32 from the forward pass. `x` and
/// `mean` are unused (and unread) by the inference strategies.
pub struct GradInputs<'a, E: Element> {
    pub dy: &'a [E],
    pub x: &'a [E],
    pub mean: &'a [f32],
    pub second: SecondMoment<'a>,
    pub gamma: &'a [f32],
}

/// Mutable outputs of one backward invocation. Weight gradients may use a
/// different storage type than the data gradient.
pub struct GradOutputs<'a, E: Element, W: Element> {
    pub dx: &'a mut [E],
    pub dgamma: &'a mut [W],
    pub dbeta: &'a mut [W],
}

/// Per-channel constants prepared once per invocation: the strategy hot
/// loops read these instead of re-deriving rstd per tile.
#[derive(Debug)]
pub struct ChannelStats {
    pub mean: Vec<f32>,
    pub rstd: Vec<f32>,
    pub gamma: Vec<f32>,
}

impl ChannelStats {
    pub fn prepare<E: Element>(plan: &TilingPlan, inputs: &GradInputs<'_, E>) -> Self {
        let rstd = match inputs.second {
            SecondMoment::Rstd(r) => r.to_vec(),
            SecondMoment::Variance(v) => v
                .iter()
                .map(|&var| reciprocal_std(var, plan.epsilon))
                .collect(),
        };
        Self {
            mean: inputs.mean.to_vec(),
            rstd,
            gamma: inputs.gamma.to_vec(),
        }
    }
}
