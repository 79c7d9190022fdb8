//! Shared helpers for unit and integration tests: tolerance-aware float
//! comparison, seeded random data, and an f64 reference implementation of
//! the backward pass that every strategy is checked against.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::element::Element;
use crate::plan::Layout;

/// Storage formats compared in tests, with per-format tolerances.
pub trait TestFloat: Element {
    const RTOL: f32;
    const ATOL: f32;
}

impl TestFloat for f32 {
    const RTOL: f32 = 1e-5;
    const ATOL: f32 = 1e-6;
}

impl TestFloat for half::f16 {
    const RTOL: f32 = 4e-3;
    const ATOL: f32 = 2e-3;
}

impl TestFloat for half::bf16 {
    const RTOL: f32 = 3e-2;
    const ATOL: f32 = 1e-2;
}

/// Relative comparison: `|a - b| <= rtol * max(1, |a|, |b|)`.
pub fn approx_eq_f32(a: f32, b: f32, rtol: f32) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= rtol * scale
}

pub fn approx_eq<E: TestFloat>(a: E, b: E) -> bool {
    let (a, b) = (a.to_f32(), b.to_f32());
    (a - b).abs() <= E::ATOL + E::RTOL * a.abs().max(b.abs())
}

/// Assert two slices agree elementwise within the format's tolerance.
#[track_caller]
pub fn assert_slices_eq<E: TestFloat>(got: &[E], want: &[E], what: &str) {
    assert_eq!(got.len(), want.len(), "{what}: length mismatch");
    for (i, (&g, &w)) in got.iter().zip(want).enumerate() {
        assert!(
            approx_eq(g, w),
            "{what}[{i}]: got {:?}, want {:?}",
            g,
            w
        );
    }
}

/// Deterministic uniform values in `[lo, hi)`.
pub fn random_f32_vec(seed: u64, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(lo..hi)).collect()
}

/// [`random_f32_vec`] narrowed to a storage format, so inputs are exactly
/// representable in that format before the engine widens them back.
pub fn random_vec<E: Element>(seed: u64, len: usize, lo: f32, hi: f32) -> Vec<E> {
    random_f32_vec(seed, len, lo, hi)
        .into_iter()
        .map(E::from_f32)
        .collect()
}

/// Reference results of one backward invocation, computed in f64.
pub struct Reference {
    pub dx: Vec<f32>,
    pub dgamma: Vec<f32>,
    pub dbeta: Vec<f32>,
}

fn index(layout: Layout, a_dim: usize, r0_dim: usize, a: usize, r0: usize, r1: usize) -> usize {
    match layout {
        Layout::ChannelFirst => r1 * (a_dim * r0_dim) + a * r0_dim + r0,
        Layout::ChannelLast => (r1 * r0_dim + r0) * a_dim + a,
    }
}

/// Straightforward f64 rendition of the training backward pass.
///
/// `r_total` is the global reduction count behind the saved statistics,
/// which may exceed the elements actually present when a sliced tensor is
/// checked.
#[allow(clippy::too_many_arguments)]
pub fn reference_backward(
    layout: Layout,
    a_dim: usize,
    r0_dim: usize,
    r1_dim: usize,
    r_total: usize,
    dy: &[f32],
    x: &[f32],
    mean: &[f32],
    rstd: &[f32],
    gamma: &[f32],
) -> Reference {
    let n = a_dim * r0_dim * r1_dim;
    assert_eq!(dy.len(), n);
    assert_eq!(x.len(), n);
    let mut out = Reference {
        dx: vec![0.0; n],
        dgamma: vec![0.0; a_dim],
        dbeta: vec![0.0; a_dim],
    };
    for a in 0..a_dim {
        let m = mean[a] as f64;
        let rs = rstd[a] as f64;
        let g = gamma[a] as f64;
        let mut dgamma = 0.0f64;
        let mut dbeta = 0.0f64;
        for r1 in 0..r1_dim {
            for r0 in 0..r0_dim {
                let i = index(layout, a_dim, r0_dim, a, r0, r1);
                let xhat = (x[i] as f64 - m) * rs;
                dgamma += xhat * dy[i] as f64;
                dbeta += dy[i] as f64;
            }
        }
        out.dgamma[a] = dgamma as f32;
        out.dbeta[a] = dbeta as f32;
        let inv_r = 1.0 / r_total as f64;
        for r1 in 0..r1_dim {
            for r0 in 0..r0_dim {
                let i = index(layout, a_dim, r0_dim, a, r0, r1);
                let xhat = (x[i] as f64 - m) * rs;
                let dx = g * rs * (dy[i] as f64 - (xhat * dgamma + dbeta) * inv_r);
                out.dx[i] = dx as f32;
            }
        }
    }
    out
}

/// Reference inference backward: elementwise `dy * rstd * gamma`.
pub fn reference_inference(
    layout: Layout,
    a_dim: usize,
    r0_dim: usize,
    r1_dim: usize,
    dy: &[f32],
    rstd: &[f32],
    gamma: &[f32],
) -> Vec<f32> {
    let n = a_dim * r0_dim * r1_dim;
    assert_eq!(dy.len(), n);
    let mut dx = vec![0.0; n];
    for a in 0..a_dim {
        let scale = rstd[a] as f64 * gamma[a] as f64;
        for r1 in 0..r1_dim {
            for r0 in 0..r0_dim {
                let i = index(layout, a_dim, r0_dim, a, r0, r1);
                dx[i] = (dy[i] as f64 * scale) as f32;
            }
        }
    }
    dx
}
