use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rayon::prelude::*;

use super::config::Activation;
use super::layers::{squash, squash_backward, ConvLayer, Layer};
use super::optimizer::Optimizer;
use super::routing::{DynamicRouting, RoutingCache};
use crate::error::{config, ensure_shape, shape, Result};

/// Couche de capsules primaires.
///
/// Une convolution dont les canaux sont regroupés par `capsule_dim`: pour
/// chaque position spatiale (h, w) et chaque groupe g, la capsule d'indice
/// `(h·W + w)·G + g` reçoit les canaux `g·D .. (g+1)·D`.
pub struct PrimaryCapsLayer {
    pub conv: ConvLayer,
    pub num_capsules: usize,
    pub capsule_dim: usize,
    squash_epsilon: f32,
    raw_cache: Option<Array3<f32>>,
    grid_cache: Option<(usize, usize)>,
}

impl PrimaryCapsLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_capsules: usize,
        capsule_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        squash_epsilon: f32,
        rng: &mut R,
    ) -> Self {
        let conv = ConvLayer::new(
            in_channels,
            num_capsules * capsule_dim,
            kernel_size,
            stride,
            padding,
            activation,
            rng,
        );

        Self {
            conv,
            num_capsules,
            capsule_dim,
            squash_epsilon,
            raw_cache: None,
            grid_cache: None,
        }
    }

    /// [B, C, H, W] -> [B, H·W·G, D], capsules squashées
    pub fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array3<f32>> {
        let features = self.conv.forward(input)?;
        let (batch_size, channels, height, width) = features.dim();

        let raw = features
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch_size, height * width * channels / self.capsule_dim, self.capsule_dim))?;

        let capsules = squash(&raw.view(), self.squash_epsilon);
        log::debug!("capsules primaires: {:?}", capsules.dim());

        self.raw_cache = Some(raw);
        self.grid_cache = Some((height, width));
        Ok(capsules)
    }

    pub fn backward(&mut self, grad_capsules: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let (raw, (height, width)) = match (&self.raw_cache, self.grid_cache) {
            (Some(raw), Some(grid)) => (raw, grid),
            _ => return Err(shape("capsules primaires: backward appelé avant forward")),
        };
        let grad_raw = squash_backward(&raw.view(), grad_capsules, self.squash_epsilon)?;

        let batch_size = grad_raw.dim().0;
        let channels = self.num_capsules * self.capsule_dim;
        let grad_features = grad_raw
            .into_shape_with_order((batch_size, height, width, channels))?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();

        self.conv.backward(&grad_features.view())
    }

    pub fn apply_gradients(&mut self, param_id: &str, optimizer: &mut dyn Optimizer) -> Result<()> {
        self.conv.apply_gradients(param_id, optimizer)
    }
}

/// Couche de capsules de sortie: transformation par W puis routage dynamique
pub struct DigitCapsLayer {
    pub routing: DynamicRouting,
    pub num_capsules: usize,
    pub capsule_dim: usize,
    /// W, forme [N_in, N_out, D_in, D_out], partagé sur tout le batch
    pub weights: Array4<f32>,
    weight_grad: Array4<f32>,
    input_cache: Option<Array3<f32>>,
    routing_cache: Option<RoutingCache>,
}

impl DigitCapsLayer {
    pub fn new<R: Rng + ?Sized>(
        primary_capsules: usize,
        primary_capsule_dim: usize,
        digit_capsules: usize,
        digit_capsule_dim: usize,
        routing: DynamicRouting,
        weight_stddev: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let normal = Normal::new(0.0, weight_stddev)
            .map_err(|e| config(format!("weight_stddev invalide: {e}")))?;
        let weights = Array4::random_using(
            (primary_capsules, digit_capsules, primary_capsule_dim, digit_capsule_dim),
            normal,
            rng,
        );
        Ok(Self::with_weights(weights, routing))
    }

    /// Couche construite à partir d'un W explicite
    pub fn with_weights(weights: Array4<f32>, routing: DynamicRouting) -> Self {
        let (_, digit_capsules, _, digit_capsule_dim) = weights.dim();
        Self {
            routing,
            num_capsules: digit_capsules,
            capsule_dim: digit_capsule_dim,
            weight_grad: Array4::zeros(weights.dim()),
            weights,
            input_cache: None,
            routing_cache: None,
        }
    }

    pub fn weight_grad(&self) -> &Array4<f32> {
        &self.weight_grad
    }

    /// Vecteurs de prédiction û[b, i, j] = W[i, j]ᵀ · u[b, i],
    /// forme [B, N_in, N_out, D_out]
    pub fn predict(&self, input: &ArrayView3<f32>) -> Result<Array4<f32>> {
        let (batch_size, input_caps, input_dim) = input.dim();
        let (weight_caps, output_caps, weight_dim, output_dim) = self.weights.dim();
        if input_caps != weight_caps || input_dim != weight_dim {
            return Err(shape(format!(
                "capsules de sortie: entrée [{batch_size}, {input_caps}, {input_dim}], \
                 W attend [_, {weight_caps}, {weight_dim}]"
            )));
        }

        let mut predictions = Array4::zeros((batch_size, input_caps, output_caps, output_dim));
        predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut pred_batch)| {
                for ic in 0..input_caps {
                    let u = input.slice(s![b, ic, ..]);
                    for oc in 0..output_caps {
                        let transformed = self.weights.slice(s![ic, oc, .., ..]).t().dot(&u);
                        pred_batch.slice_mut(s![ic, oc, ..]).assign(&transformed);
                    }
                }
            });

        Ok(predictions)
    }

    /// [B, N_in, D_in] -> v, [B, N_out, D_out]
    pub fn forward(&mut self, input: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let predictions = self.predict(input)?;
        let routed = self.routing.route(&predictions.view());
        log::debug!(
            "capsules de sortie: {:?} après {} itérations",
            routed.outputs.dim(),
            self.routing.num_iterations()
        );

        self.input_cache = Some(input.to_owned());
        self.routing_cache = Some(routed.cache);
        Ok(routed.outputs)
    }

    /// Rétropropage ∂L/∂v vers W (stocké) et vers l'entrée (retourné)
    pub fn backward(&mut self, grad_outputs: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let (input, cache) = match (&self.input_cache, &self.routing_cache) {
            (Some(input), Some(cache)) => (input, cache),
            _ => return Err(shape("capsules de sortie: backward appelé avant forward")),
        };
        let grad_predictions = self.routing.backward(cache, grad_outputs)?;

        let (batch_size, input_caps, input_dim) = input.dim();
        let (_, output_caps, _, output_dim) = self.weights.dim();
        ensure_shape(
            "gradient des prédictions",
            grad_predictions.shape(),
            &[batch_size, input_caps, output_caps, output_dim],
        )?;

        // ∂L/∂W[i, j] = Σ_b u[b, i] ⊗ ∂L/∂û[b, i, j]
        let mut weight_grad = Array4::zeros(self.weights.dim());
        weight_grad
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(ic, mut grad_ic)| {
                let u = input.slice(s![.., ic, ..]);
                for oc in 0..output_caps {
                    let g = grad_predictions.slice(s![.., ic, oc, ..]);
                    grad_ic.slice_mut(s![oc, .., ..]).assign(&u.t().dot(&g));
                }
            });

        // ∂L/∂u[b, i] = Σ_j W[i, j] · ∂L/∂û[b, i, j]
        let weights = &self.weights;
        let mut grad_input = Array3::zeros((batch_size, input_caps, input_dim));
        grad_input
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut grad_batch)| {
                for ic in 0..input_caps {
                    let mut row = grad_batch.slice_mut(s![ic, ..]);
                    for oc in 0..output_caps {
                        let g = grad_predictions.slice(s![b, ic, oc, ..]);
                        row += &weights.slice(s![ic, oc, .., ..]).dot(&g);
                    }
                }
            });

        self.weight_grad = weight_grad;
        Ok(grad_input)
    }

    pub fn apply_gradients(&mut self, param_id: &str, optimizer: &mut dyn Optimizer) -> Result<()> {
        optimizer.step(
            &format!("{param_id}.weights"),
            self.weights.view_mut().into_dyn(),
            self.weight_grad.view().into_dyn(),
        )
    }
}
