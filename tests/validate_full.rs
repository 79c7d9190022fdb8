//! End-to-end validation of every strategy against an f64 reference
//! implementation, across storage formats and unit counts.

use half::{bf16, f16};
use test_case::test_matrix;

use tilegrad::test_utils::{
    approx_eq, approx_eq_f32, assert_slices_eq, random_f32_vec, random_vec, reference_backward,
    reference_inference, TestFloat,
};
use tilegrad::{
    launch, Element, GradInputs, GradOutputs, Layout, PlanError, SecondMoment, Strategy,
    TilingPlan,
};

fn flat_index(layout: Layout, a_dim: usize, r0_dim: usize, a: usize, r0: usize, r1: usize) -> usize {
    match layout {
        Layout::ChannelFirst => r1 * (a_dim * r0_dim) + a * r0_dim + r0,
        Layout::ChannelLast => (r1 * r0_dim + r0) * a_dim + a,
    }
}

/// Per-channel batch mean and reciprocal std computed in f64.
fn batch_stats(
    layout: Layout,
    a_dim: usize,
    r0_dim: usize,
    r1_dim: usize,
    x: &[f32],
    eps: f32,
) -> (Vec<f32>, Vec<f32>) {
    let r = (r0_dim * r1_dim) as f64;
    let mut mean = vec![0.0f32; a_dim];
    let mut rstd = vec![0.0f32; a_dim];
    for a in 0..a_dim {
        let mut sum = 0.0f64;
        let mut sq = 0.0f64;
        for r1 in 0..r1_dim {
            for r0 in 0..r0_dim {
                let v = x[flat_index(layout, a_dim, r0_dim, a, r0, r1)] as f64;
                sum += v;
                sq += v * v;
            }
        }
        let m = sum / r;
        let var = (sq / r - m * m).max(0.0);
        mean[a] = m as f32;
        rstd[a] = (1.0 / (var + eps as f64).sqrt()) as f32;
    }
    (mean, rstd)
}

fn training_shape(strategy: Strategy) -> (usize, usize, usize, usize) {
    match strategy {
        // (a, r0, r1, buffer budget); shapes chosen so each strategy hits
        // its tail paths: recompute gets an r0 tail longer than half a
        // tile, split-r1 gets a partial row tile and a partial a chunk.
        Strategy::FullLoad => (4, 37, 3, 1024),
        Strategy::RecomputeSplitR0 => (5, 456, 2, 256),
        Strategy::SplitR1 => (10, 333, 1, 640),
        _ => panic!("not a training strategy"),
    }
}

fn check_training<E: TestFloat>(strategy: Strategy, units: usize, seed: u64) {
    let (a_dim, r0, r1, budget) = training_shape(strategy);
    check_training_shape::<E>(strategy, a_dim, r0, r1, budget, units, seed);
}

#[allow(clippy::too_many_arguments)]
fn check_training_shape<E: TestFloat>(
    strategy: Strategy,
    a_dim: usize,
    r0: usize,
    r1: usize,
    budget: usize,
    units: usize,
    seed: u64,
) {
    let layout = strategy.layout();
    let n = a_dim * r0 * r1;
    let eps = 1e-5f32;

    let dy: Vec<E> = random_vec(seed, n, -1.0, 1.0);
    let x: Vec<E> = random_vec(seed ^ 0x9e3779b9, n, -2.0, 2.0);
    let dy_f: Vec<f32> = dy.iter().map(|v| v.to_f32()).collect();
    let x_f: Vec<f32> = x.iter().map(|v| v.to_f32()).collect();
    let (mean, rstd) = batch_stats(layout, a_dim, r0, r1, &x_f, eps);
    let gamma = random_f32_vec(seed ^ 0x51, a_dim, 0.5, 1.5);

    let plan = TilingPlan::for_shape(strategy, a_dim, r0, r1, eps, budget, units).unwrap();
    let mut dx = vec![E::from_f32(0.0); n];
    let mut dgamma = vec![E::from_f32(0.0); a_dim];
    let mut dbeta = vec![E::from_f32(0.0); a_dim];
    launch(
        &plan,
        &GradInputs {
            dy: &dy,
            x: &x,
            mean: &mean,
            second: SecondMoment::Rstd(&rstd),
            gamma: &gamma,
        },
        &mut GradOutputs {
            dx: &mut dx,
            dgamma: &mut dgamma,
            dbeta: &mut dbeta,
        },
    )
    .unwrap();

    let want = reference_backward(
        layout, a_dim, r0, r1, r0 * r1, &dy_f, &x_f, &mean, &rstd, &gamma,
    );

    // Weight gradients: accumulation-order differences dominate the
    // format's own rounding for the wider types.
    let rtol = E::RTOL.max(1e-3);
    for c in 0..a_dim {
        assert!(
            approx_eq_f32(dgamma[c].to_f32(), want.dgamma[c], rtol),
            "dgamma[{c}]: got {:?}, want {}",
            dgamma[c],
            want.dgamma[c]
        );
        assert!(
            approx_eq_f32(dbeta[c].to_f32(), want.dbeta[c], rtol),
            "dbeta[{c}]: got {:?}, want {}",
            dbeta[c],
            want.dbeta[c]
        );
    }
    let want_dx: Vec<E> = want.dx.iter().map(|&v| E::from_f32(v)).collect();
    assert_slices_eq(&dx, &want_dx, "dx");
}

#[test_matrix(
    [Strategy::FullLoad, Strategy::RecomputeSplitR0, Strategy::SplitR1],
    [1, 3]
)]
fn training_matches_reference_f32(strategy: Strategy, units: usize) {
    check_training::<f32>(strategy, units, 101);
}

#[test_matrix(
    [Strategy::FullLoad, Strategy::RecomputeSplitR0, Strategy::SplitR1],
    [1, 3]
)]
fn training_matches_reference_f16(strategy: Strategy, units: usize) {
    check_training::<f16>(strategy, units, 202);
}

#[test_matrix(
    [Strategy::FullLoad, Strategy::RecomputeSplitR0, Strategy::SplitR1],
    [1, 3]
)]
fn training_matches_reference_bf16(strategy: Strategy, units: usize) {
    check_training::<bf16>(strategy, units, 303);
}

/// Channel-last with a decomposed reduction axis: R = R0 * R1 rows behave
/// as one flat axis, including a partial row tile and a partial a chunk.
#[test_matrix([1, 4])]
fn split_r1_decomposed_reduction_axis(units: usize) {
    check_training_shape::<f32>(Strategy::SplitR1, 6, 37, 3, 150, units, 707);
}

/// Unit partitioning must not change results at all: each channel's tile
/// sequence is identical whichever unit owns it.
#[test_matrix([Strategy::FullLoad, Strategy::RecomputeSplitR0, Strategy::SplitR1])]
fn partitioning_is_bit_invariant(strategy: Strategy) {
    let (a_dim, r0, r1, budget) = training_shape(strategy);
    let layout = strategy.layout();
    let n = a_dim * r0 * r1;
    let eps = 1e-5f32;
    let dy = random_f32_vec(7, n, -1.0, 1.0);
    let x = random_f32_vec(8, n, -2.0, 2.0);
    let (mean, rstd) = batch_stats(layout, a_dim, r0, r1, &x, eps);
    let gamma = random_f32_vec(9, a_dim, 0.5, 1.5);

    let mut runs = Vec::new();
    for units in [1, 4] {
        let plan = TilingPlan::for_shape(strategy, a_dim, r0, r1, eps, budget, units).unwrap();
        let mut dx = vec![0.0f32; n];
        let mut dgamma = vec![0.0f32; a_dim];
        let mut dbeta = vec![0.0f32; a_dim];
        launch(
            &plan,
            &GradInputs {
                dy: &dy,
                x: &x,
                mean: &mean,
                second: SecondMoment::Rstd(&rstd),
                gamma: &gamma,
            },
            &mut GradOutputs {
                dx: &mut dx,
                dgamma: &mut dgamma,
                dbeta: &mut dbeta,
            },
        )
        .unwrap();
        runs.push((dx, dgamma, dbeta));
    }
    assert_eq!(runs[0], runs[1]);
}

fn check_inference<E: TestFloat>(strategy: Strategy, units: usize, seed: u64) {
    let (a_dim, r0, r1, budget) = match strategy {
        Strategy::InferChannelFirst => (3, 100, 2, 64),
        Strategy::InferChannelLast => (7, 205, 1, 512),
        _ => panic!("not an inference strategy"),
    };
    let n = a_dim * r0 * r1;
    let dy: Vec<E> = random_vec(seed, n, -1.0, 1.0);
    let dy_f: Vec<f32> = dy.iter().map(|v| v.to_f32()).collect();
    let rstd = random_f32_vec(seed ^ 0x2a, a_dim, 0.1, 2.0);
    let gamma = random_f32_vec(seed ^ 0x2b, a_dim, 0.5, 1.5);

    // Deliberately wrong batch statistics and input: inference must never
    // read them.
    let x = vec![E::from_f32(1.0e4); n];
    let mean = vec![f32::NAN; a_dim];

    let plan = TilingPlan::for_shape(strategy, a_dim, r0, r1, 1e-5, budget, units).unwrap();
    let mut dx = vec![E::from_f32(0.0); n];
    let sentinel = 7.25f32;
    let mut dgamma = vec![sentinel; a_dim];
    let mut dbeta = vec![sentinel; a_dim];
    launch(
        &plan,
        &GradInputs {
            dy: &dy,
            x: &x,
            mean: &mean,
            second: SecondMoment::Rstd(&rstd),
            gamma: &gamma,
        },
        &mut GradOutputs {
            dx: &mut dx,
            dgamma: &mut dgamma,
            dbeta: &mut dbeta,
        },
    )
    .unwrap();

    let want = reference_inference(strategy.layout(), a_dim, r0, r1, &dy_f, &rstd, &gamma);
    for (i, (&got, &w)) in dx.iter().zip(&want).enumerate() {
        assert!(
            approx_eq(got, E::from_f32(w)),
            "dx[{i}]: got {got:?}, want {w}"
        );
    }
    // Weight gradients are not produced in inference mode.
    assert!(dgamma.iter().chain(&dbeta).all(|&v| v == sentinel));
}

#[test_matrix(
    [Strategy::InferChannelFirst, Strategy::InferChannelLast],
    [1, 3]
)]
fn inference_ignores_batch_stats_f32(strategy: Strategy, units: usize) {
    check_inference::<f32>(strategy, units, 404);
}

#[test_matrix(
    [Strategy::InferChannelFirst, Strategy::InferChannelLast],
    [1, 3]
)]
fn inference_ignores_batch_stats_f16(strategy: Strategy, units: usize) {
    check_inference::<f16>(strategy, units, 505);
}

#[test_matrix(
    [Strategy::InferChannelFirst, Strategy::InferChannelLast],
    [1, 3]
)]
fn inference_ignores_batch_stats_bf16(strategy: Strategy, units: usize) {
    check_inference::<bf16>(strategy, units, 606);
}

/// Degenerate two-channel case with exact expected outputs: x symmetric
/// around the mean and unit dy give dBeta = R, dGamma = 0, dX = 0.
#[test_matrix([Strategy::FullLoad, Strategy::RecomputeSplitR0, Strategy::SplitR1])]
fn symmetric_input_unit_gradient(strategy: Strategy) {
    let (a_dim, r) = (2usize, 5usize);
    let layout = strategy.layout();
    let n = a_dim * r;
    let rows = [[1.0f32, 2.0, 3.0, 4.0, 5.0], [10.0, 20.0, 30.0, 40.0, 50.0]];
    let mut x = vec![0.0f32; n];
    for a in 0..a_dim {
        for r0 in 0..r {
            x[flat_index(layout, a_dim, r, a, r0, 0)] = rows[a][r0];
        }
    }
    let dy = vec![1.0f32; n];
    let mean = vec![3.0f32, 30.0];
    let rstd = vec![1.0f32; a_dim];
    let gamma = vec![1.0f32; a_dim];

    let plan = TilingPlan::for_shape(strategy, a_dim, r, 1, 1e-5, 64, 2).unwrap();
    let mut dx = vec![f32::NAN; n];
    let mut dgamma = vec![f32::NAN; a_dim];
    let mut dbeta = vec![f32::NAN; a_dim];
    launch(
        &plan,
        &GradInputs {
            dy: &dy,
            x: &x,
            mean: &mean,
            second: SecondMoment::Rstd(&rstd),
            gamma: &gamma,
        },
        &mut GradOutputs {
            dx: &mut dx,
            dgamma: &mut dgamma,
            dbeta: &mut dbeta,
        },
    )
    .unwrap();

    assert_eq!(dbeta, vec![5.0, 5.0]);
    assert_eq!(dgamma, vec![0.0, 0.0]);
    assert_eq!(dx, vec![0.0; n]);
}

/// Supplying the saved variance or the precomputed reciprocal std must
/// produce bit-identical results.
#[test]
fn variance_and_rstd_forms_agree_end_to_end() {
    let (a_dim, r0, r1) = (3usize, 48usize, 2usize);
    let n = a_dim * r0 * r1;
    let eps = 1e-3f32;
    let dy = random_f32_vec(21, n, -1.0, 1.0);
    let x = random_f32_vec(22, n, -2.0, 2.0);
    let mean = random_f32_vec(23, a_dim, -0.5, 0.5);
    let var = random_f32_vec(24, a_dim, 0.1, 4.0);
    let gamma = random_f32_vec(25, a_dim, 0.5, 1.5);
    let rstd: Vec<f32> = var
        .iter()
        .map(|&v| tilegrad::context::reciprocal_std(v, eps))
        .collect();

    let plan = TilingPlan::for_shape(Strategy::FullLoad, a_dim, r0, r1, eps, 256, 2).unwrap();
    let mut runs = Vec::new();
    for second in [SecondMoment::Variance(&var), SecondMoment::Rstd(&rstd)] {
        let mut dx = vec![0.0f32; n];
        let mut dgamma = vec![0.0f32; a_dim];
        let mut dbeta = vec![0.0f32; a_dim];
        launch(
            &plan,
            &GradInputs {
                dy: &dy,
                x: &x,
                mean: &mean,
                second,
                gamma: &gamma,
            },
            &mut GradOutputs {
                dx: &mut dx,
                dgamma: &mut dgamma,
                dbeta: &mut dbeta,
            },
        )
        .unwrap();
        runs.push((dx, dgamma, dbeta));
    }
    assert_eq!(runs[0], runs[1]);
}

/// Data gradients in half precision, weight gradients kept in f32.
#[test]
fn mixed_weight_precision() {
    let strategy = Strategy::RecomputeSplitR0;
    let (a_dim, r0, r1, budget) = training_shape(strategy);
    let n = a_dim * r0 * r1;
    let eps = 1e-5f32;
    let dy: Vec<f16> = random_vec(31, n, -1.0, 1.0);
    let x: Vec<f16> = random_vec(32, n, -2.0, 2.0);
    let dy_f: Vec<f32> = dy.iter().map(|v| v.to_f32()).collect();
    let x_f: Vec<f32> = x.iter().map(|v| v.to_f32()).collect();
    let (mean, rstd) = batch_stats(strategy.layout(), a_dim, r0, r1, &x_f, eps);
    let gamma = random_f32_vec(33, a_dim, 0.5, 1.5);

    let plan = TilingPlan::for_shape(strategy, a_dim, r0, r1, eps, budget, 2).unwrap();
    let mut dx = vec![f16::from_f32(0.0); n];
    let mut dgamma = vec![0.0f32; a_dim];
    let mut dbeta = vec![0.0f32; a_dim];
    launch(
        &plan,
        &GradInputs {
            dy: &dy,
            x: &x,
            mean: &mean,
            second: SecondMoment::Rstd(&rstd),
            gamma: &gamma,
        },
        &mut GradOutputs {
            dx: &mut dx,
            dgamma: &mut dgamma,
            dbeta: &mut dbeta,
        },
    )
    .unwrap();

    let want = reference_backward(
        strategy.layout(),
        a_dim,
        r0,
        r1,
        r0 * r1,
        &dy_f,
        &x_f,
        &mean,
        &rstd,
        &gamma,
    );
    for c in 0..a_dim {
        assert!(approx_eq_f32(dgamma[c], want.dgamma[c], 1e-3));
        assert!(approx_eq_f32(dbeta[c], want.dbeta[c], 1e-3));
    }
}

#[test]
fn launch_rejects_mismatched_tensors() {
    let plan = TilingPlan::for_shape(Strategy::FullLoad, 2, 8, 1, 1e-5, 64, 1).unwrap();
    let dy = vec![0.0f32; 16];
    let x = vec![0.0f32; 15]; // short by one
    let mean = vec![0.0f32; 2];
    let rstd = vec![1.0f32; 2];
    let gamma = vec![1.0f32; 2];
    let mut dx = vec![0.0f32; 16];
    let mut dgamma = vec![0.0f32; 2];
    let mut dbeta = vec![0.0f32; 2];
    let err = launch(
        &plan,
        &GradInputs {
            dy: &dy,
            x: &x,
            mean: &mean,
            second: SecondMoment::Rstd(&rstd),
            gamma: &gamma,
        },
        &mut GradOutputs {
            dx: &mut dx,
            dgamma: &mut dgamma,
            dbeta: &mut dbeta,
        },
    )
    .unwrap_err();
    assert!(matches!(err, PlanError::TensorLength { got: 15, .. }));
}
