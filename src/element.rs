//! Storage element types for the streamed tensors.
//!
//! All arithmetic inside the engine runs in f32; storage elements are widened
//! on load and narrowed exactly once on store. The weight-side outputs
//! (`dGamma`/`dBeta`) may use a different element type than the data-side
//! tensors (`dY`/`X`/`dX`), so the two are independent type parameters
//! throughout the strategy code.

use std::fmt::Debug;

use half::{bf16, f16};

/// A floating storage format the engine can stream.
///
/// The set is closed: the tiling planner only ever emits plans for these
/// three formats, and per-element conversion must be a plain widen/narrow
/// with no rescaling.
pub trait Element: Copy + Send + Sync + Debug + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Element for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl Element for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

impl Element for bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
    #[inline]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }
}
