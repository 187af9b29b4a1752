use approx::assert_abs_diff_eq;
use capsnet::model::capsule::DigitCapsLayer;
use capsnet::model::loss::{CombinedLoss, LossFunction, MarginLoss};
use capsnet::model::mask::{CapsuleMask, MaskMode};
use capsnet::model::routing::DynamicRouting;
use capsnet::model::config::LossConfig;
use ndarray::{arr2, Array3, Array4};

fn identity_weights(input_caps: usize, output_caps: usize, dim: usize) -> Array4<f32> {
    Array4::from_shape_fn((input_caps, output_caps, dim, dim), |(_, _, r, c)| {
        if r == c {
            1.0
        } else {
            0.0
        }
    })
}

/// B=1, N_in=2, N_out=2, D=2, R=2 avec û choisis à la main:
/// û[0,0]=(1,0) û[0,1]=(0,1) û[1,0]=(1,0) û[1,1]=(0,-1)
#[test]
fn two_iterations_match_hand_computation() {
    let mut predictions = Array4::<f32>::zeros((1, 2, 2, 2));
    predictions[[0, 0, 0, 0]] = 1.0;
    predictions[[0, 0, 1, 1]] = 1.0;
    predictions[[0, 1, 0, 0]] = 1.0;
    predictions[[0, 1, 1, 1]] = -1.0;

    let routing = DynamicRouting::new(2, 1e-7).unwrap();
    let (routed, trace) = routing.route_traced(&predictions.view());
    assert_eq!(trace.couplings.len(), 2);

    // Itération 1: b = 0, c uniforme, s0 = (1, 0), s1 = 0
    assert!(trace.logits[0].iter().all(|&b| b == 0.0));
    assert!(trace.couplings[0].iter().all(|&c| (c - 0.5).abs() < 1e-7));
    assert_abs_diff_eq!(trace.outputs[0][[0, 0, 0]], 0.5, epsilon = 1e-5);
    assert_abs_diff_eq!(trace.outputs[0][[0, 0, 1]], 0.0, epsilon = 1e-7);
    assert!(trace.outputs[0].slice(ndarray::s![0, 1, ..]).iter().all(|&v| v == 0.0));

    // b[i,0] = û[i,0]·v0 = 0.5, b[i,1] = 0
    for i in 0..2 {
        assert_abs_diff_eq!(trace.logits[1][[0, i, 0]], 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(trace.logits[1][[0, i, 1]], 0.0, epsilon = 1e-7);
    }

    // Itération 2: c[i,0] = σ(0.5)
    let c0 = 1.0 / (1.0 + (-0.5_f32).exp());
    for i in 0..2 {
        assert_abs_diff_eq!(trace.couplings[1][[0, i, 0]], c0, epsilon = 1e-5);
        assert_abs_diff_eq!(trace.couplings[1][[0, i, 1]], 1.0 - c0, epsilon = 1e-5);
    }

    // s0 = (2·c0, 0), ‖v0‖ = ‖s0‖² / (1 + ‖s0‖²), s1 = 0
    let norm_sq = (2.0 * c0).powi(2);
    let expected_length = norm_sq / (1.0 + norm_sq);
    assert_abs_diff_eq!(expected_length, 0.607_819_4, epsilon = 1e-5);
    assert_abs_diff_eq!(routed.outputs[[0, 0, 0]], expected_length, epsilon = 1e-5);
    assert_abs_diff_eq!(routed.outputs[[0, 0, 1]], 0.0, epsilon = 1e-7);
    assert_abs_diff_eq!(routed.outputs[[0, 1, 0]], 0.0, epsilon = 1e-7);
    assert_abs_diff_eq!(routed.outputs[[0, 1, 1]], 0.0, epsilon = 1e-7);
    assert_eq!(routed.outputs, trace.outputs[1]);
}

/// Avec W = identité, û[i,j] = u[i] pour tout j: les couplages restent
/// uniformes et v[j] = squash(moyenne des u)
#[test]
fn identity_transform_keeps_uniform_coupling() {
    let input = Array3::from_shape_vec((1, 2, 2), vec![1.0_f32, 0.0, 0.0, 1.0]).unwrap();
    let routing = DynamicRouting::new(2, 1e-7).unwrap();
    let mut layer = DigitCapsLayer::with_weights(identity_weights(2, 2, 2), routing.clone());

    let predictions = layer.predict(&input.view()).unwrap();
    let (_, trace) = routing.route_traced(&predictions.view());
    assert!(trace.couplings.iter().flatten().all(|&c| (c - 0.5).abs() < 1e-6));

    // s = (0.5, 0.5), ‖s‖² = 0.5, ‖v‖ = 0.5 / 1.5
    let outputs = layer.forward(&input.view()).unwrap();
    let component = (1.0 / 3.0) / 2.0_f32.sqrt();
    for j in 0..2 {
        assert_abs_diff_eq!(outputs[[0, j, 0]], component, epsilon = 1e-6);
        assert_abs_diff_eq!(outputs[[0, j, 1]], component, epsilon = 1e-6);
    }
}

#[test]
fn zero_input_gives_zero_capsules_and_boundary_margin_loss() {
    let input = Array3::<f32>::zeros((2, 4, 3));
    let weights = Array4::from_shape_fn((4, 3, 3, 5), |(i, j, r, c)| ((i + j + r + c) % 3) as f32 - 1.0);
    let mut layer = DigitCapsLayer::with_weights(weights, DynamicRouting::new(3, 1e-7).unwrap());

    let outputs = layer.forward(&input.view()).unwrap();
    assert!(outputs.iter().all(|&v| v == 0.0));

    let labels = arr2(&[[0.0_f32, 1.0, 0.0], [1.0, 0.0, 0.0]]);
    let masked = CapsuleMask::new(1e-9)
        .apply(&outputs.view(), Some(&labels.view()), MaskMode::GroundTruth)
        .unwrap();
    assert!(masked.lengths.iter().all(|&l| l < 1e-4));

    // Σ_j T[j]·(m+)², le terme d'absence est nul car ‖v‖ ≤ m-
    let margin = MarginLoss::new(0.9, 0.1, 0.5);
    let loss = margin.compute(&masked.lengths.view(), &labels.view()).unwrap();
    assert_abs_diff_eq!(loss, 0.81, epsilon = 1e-3);

    let combined = CombinedLoss::new(&LossConfig::default());
    let breakdown = combined
        .compute_total(&masked.lengths.view(), &labels.view(), None)
        .unwrap();
    assert_eq!(breakdown.reconstruction, 0.0);
    assert_abs_diff_eq!(breakdown.total, breakdown.margin, epsilon = 1e-7);
}

#[test]
fn zero_routing_iterations_rejected() {
    assert!(DynamicRouting::new(0, 1e-7).is_err());
}
