//! Tiled reduction engine for the normalization-layer backward pass.
//!
//! Given upstream gradients `dY`, saved inputs `X`, per-channel forward
//! statistics and the scale parameter `Gamma`, the engine produces the
//! three gradients `dX`, `dGamma`, `dBeta` under a host-supplied
//! [`TilingPlan`]: static work partitioning across parallel units,
//! tile-local pairwise-tree reduction, a base-256 cross-tile accumulation
//! hierarchy, double-buffered streaming transfers, and a final elementwise
//! combination pass. Five tiling strategies cover the channel-first and
//! channel-last layouts, streaming and fully-resident regimes, and the
//! reduction-free inference mode.
//!
//! All accumulation runs in f32 regardless of the storage format; `f16`
//! and `bf16` tensors are widened on load and narrowed exactly once on
//! store.

pub mod buffer;
pub mod cache;
pub mod context;
pub mod element;
pub mod plan;
pub mod reduce;
pub mod strategy;
pub mod test_utils;

pub use context::{ChannelStats, GradInputs, GradOutputs, SecondMoment};
pub use element::Element;
pub use plan::{Layout, PlanError, Strategy, TilingPlan, UnitAssignment};
pub use strategy::launch;
