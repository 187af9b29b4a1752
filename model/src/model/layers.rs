use ndarray::{s, Array, Array1, Array4, ArrayView, ArrayView4, Axis, Dimension, Zip};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rayon::prelude::*;

use super::config::Activation;
use super::optimizer::Optimizer;
use crate::error::{ensure_shape, shape, Result};

/// Trait pour les couches d'extraction de caractéristiques (NCHW) avec forward et backward
pub trait Layer: Send + Sync {
    fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>>;
    fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>>;
    fn apply_gradients(&mut self, param_id: &str, optimizer: &mut dyn Optimizer) -> Result<()>;
}

impl Activation {
    pub fn apply(&self, v: f32) -> f32 {
        match *self {
            Activation::ReLU => v.max(0.0),
            Activation::LeakyReLU(alpha) => {
                if v > 0.0 {
                    v
                } else {
                    alpha * v
                }
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-v).exp()),
            Activation::Tanh => v.tanh(),
            Activation::None => v,
        }
    }

    /// Dérivée évaluée à partir de la pré-activation
    pub fn derivative(&self, pre: f32) -> f32 {
        match *self {
            Activation::ReLU => {
                if pre > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU(alpha) => {
                if pre > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => {
                let sig = self.apply(pre);
                sig * (1.0 - sig)
            }
            Activation::Tanh => {
                let t = pre.tanh();
                1.0 - t * t
            }
            Activation::None => 1.0,
        }
    }
}

/// Couche de convolution avec backpropagation
pub struct ConvLayer {
    pub weights: Array4<f32>,
    pub biases: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
    pub activation: Activation,

    // Pour backprop
    input_cache: Option<Array4<f32>>,
    pre_activation_cache: Option<Array4<f32>>,
    weight_grad: Array4<f32>,
    bias_grad: Array1<f32>,
}

impl ConvLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        // Initialisation He
        let scale = (2.0 / (in_channels * kernel_size * kernel_size) as f32).sqrt();
        let weights = Array4::random_using(
            (out_channels, in_channels, kernel_size, kernel_size),
            Uniform::new(-scale, scale),
            rng,
        );
        let biases = Array1::zeros(out_channels);

        Self {
            weight_grad: Array4::zeros(weights.dim()),
            bias_grad: Array1::zeros(out_channels),
            weights,
            biases,
            stride,
            padding,
            activation,
            input_cache: None,
            pre_activation_cache: None,
        }
    }

    pub fn output_size(&self, in_height: usize, in_width: usize) -> Result<(usize, usize)> {
        let kernel_size = self.weights.dim().2;
        let padded_h = in_height + 2 * self.padding;
        let padded_w = in_width + 2 * self.padding;
        if padded_h < kernel_size || padded_w < kernel_size {
            return Err(shape(format!(
                "noyau {kernel_size} plus grand que l'entrée {in_height}x{in_width}"
            )));
        }
        Ok((
            (padded_h - kernel_size) / self.stride + 1,
            (padded_w - kernel_size) / self.stride + 1,
        ))
    }

    fn pad_input(&self, input: &ArrayView4<f32>) -> Array4<f32> {
        if self.padding == 0 {
            return input.to_owned();
        }
        let (batch_size, channels, height, width) = input.dim();
        let p = self.padding;
        let mut padded = Array4::zeros((batch_size, channels, height + 2 * p, width + 2 * p));
        padded
            .slice_mut(s![.., .., p..height + p, p..width + p])
            .assign(input);
        padded
    }

    /// Convolution parallélisée par batch
    fn convolve(&self, padded: &Array4<f32>, out_height: usize, out_width: usize) -> Array4<f32> {
        let batch_size = padded.dim().0;
        let (out_channels, in_channels, kernel_size, _) = self.weights.dim();
        let mut output = Array4::zeros((batch_size, out_channels, out_height, out_width));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut out_batch)| {
                let input_batch = padded.index_axis(Axis(0), b);

                for oc in 0..out_channels {
                    for oh in 0..out_height {
                        for ow in 0..out_width {
                            let ih_start = oh * self.stride;
                            let iw_start = ow * self.stride;
                            let mut sum = self.biases[oc];

                            for ic in 0..in_channels {
                                for kh in 0..kernel_size {
                                    for kw in 0..kernel_size {
                                        sum += input_batch[[ic, ih_start + kh, iw_start + kw]]
                                            * self.weights[[oc, ic, kh, kw]];
                                    }
                                }
                            }

                            out_batch[[oc, oh, ow]] = sum;
                        }
                    }
                }
            });

        output
    }
}

impl Layer for ConvLayer {
    fn forward(&mut self, input: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (_, in_channels, in_height, in_width) = input.dim();
        if in_channels != self.weights.dim().1 {
            return Err(shape(format!(
                "convolution: {in_channels} canaux en entrée, attendus {}",
                self.weights.dim().1
            )));
        }
        let (out_height, out_width) = self.output_size(in_height, in_width)?;

        let padded = self.pad_input(input);
        let pre_activation = self.convolve(&padded, out_height, out_width);
        let activation = self.activation;
        let output = pre_activation.mapv(|v| activation.apply(v));

        log::debug!("conv: {:?} -> {:?}", input.dim(), output.dim());
        self.input_cache = Some(padded);
        self.pre_activation_cache = Some(pre_activation);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &ArrayView4<f32>) -> Result<Array4<f32>> {
        let (padded, pre_activation) = match (&self.input_cache, &self.pre_activation_cache) {
            (Some(padded), Some(pre)) => (padded, pre),
            _ => return Err(shape("convolution: backward appelé avant forward")),
        };
        ensure_shape("gradient de convolution", grad_output.shape(), pre_activation.shape())?;

        // Gradient à travers l'activation
        let activation = self.activation;
        let mut grad = grad_output.to_owned();
        Zip::from(&mut grad)
            .and(pre_activation)
            .for_each(|g, &pre| *g *= activation.derivative(pre));

        let (batch_size, out_channels, out_height, out_width) = grad.dim();
        let (_, in_channels, kernel_size, _) = self.weights.dim();
        let stride = self.stride;
        let weights = &self.weights;

        // Gradients des poids et biais, accumulés par échantillon puis réduits
        let (weight_grad, bias_grad) = (0..batch_size)
            .into_par_iter()
            .map(|b| {
                let mut wg = Array4::<f32>::zeros(weights.dim());
                let mut bg = Array1::<f32>::zeros(out_channels);
                for oc in 0..out_channels {
                    for oh in 0..out_height {
                        for ow in 0..out_width {
                            let g = grad[[b, oc, oh, ow]];
                            if g == 0.0 {
                                continue;
                            }
                            bg[oc] += g;
                            for ic in 0..in_channels {
                                for kh in 0..kernel_size {
                                    for kw in 0..kernel_size {
                                        wg[[oc, ic, kh, kw]] +=
                                            g * padded[[b, ic, oh * stride + kh, ow * stride + kw]];
                                    }
                                }
                            }
                        }
                    }
                }
                (wg, bg)
            })
            .reduce(
                || (Array4::zeros(weights.dim()), Array1::zeros(out_channels)),
                |(wa, ba), (wb, bb)| (wa + wb, ba + bb),
            );
        self.weight_grad = weight_grad;
        self.bias_grad = bias_grad;

        // Gradient par rapport à l'entrée (pour la couche précédente)
        let mut grad_padded = Array4::<f32>::zeros(padded.dim());
        grad_padded
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut grad_batch)| {
                for oc in 0..out_channels {
                    for oh in 0..out_height {
                        for ow in 0..out_width {
                            let g = grad[[b, oc, oh, ow]];
                            if g == 0.0 {
                                continue;
                            }
                            for ic in 0..in_channels {
                                for kh in 0..kernel_size {
                                    for kw in 0..kernel_size {
                                        grad_batch[[ic, oh * stride + kh, ow * stride + kw]] +=
                                            g * weights[[oc, ic, kh, kw]];
                                    }
                                }
                            }
                        }
                    }
                }
            });

        let p = self.padding;
        let (_, _, padded_h, padded_w) = padded.dim();
        Ok(grad_padded
            .slice(s![.., .., p..padded_h - p, p..padded_w - p])
            .to_owned())
    }

    fn apply_gradients(&mut self, param_id: &str, optimizer: &mut dyn Optimizer) -> Result<()> {
        optimizer.step(
            &format!("{param_id}.weights"),
            self.weights.view_mut().into_dyn(),
            self.weight_grad.view().into_dyn(),
        )?;
        optimizer.step(
            &format!("{param_id}.biases"),
            self.biases.view_mut().into_dyn(),
            self.bias_grad.view().into_dyn(),
        )
    }
}

/// Fonction squash appliquée indépendamment le long du dernier axe:
/// `‖s‖² / (1 + ‖s‖²) · s / sqrt(‖s‖² + ε)`.
///
/// Le vecteur nul donne le vecteur nul; `epsilon` évite la division par zéro.
pub fn squash<D: Dimension>(vectors: &ArrayView<f32, D>, epsilon: f32) -> Array<f32, D> {
    let mut result = vectors.to_owned();
    let last = Axis(result.ndim() - 1);

    for mut lane in result.lanes_mut(last) {
        let norm_squared: f32 = lane.iter().map(|v| v * v).sum();
        let norm = (norm_squared + epsilon).sqrt();
        let factor = norm_squared / (1.0 + norm_squared) / norm;
        lane.mapv_inplace(|v| v * factor);
    }

    result
}

/// Produit vecteur-jacobien du squash: gradient par rapport à `vectors`
/// étant donné le gradient `grad_output` par rapport à la sortie.
///
/// Avec x = ‖s‖² et g(x) = x / ((1 + x)·sqrt(x + ε)), squash(s) = g(x)·s et
/// ∂L/∂s = g·∂L/∂v + 2·g'(x)·(s·∂L/∂v)·s.
pub fn squash_backward<D: Dimension>(
    vectors: &ArrayView<f32, D>,
    grad_output: &ArrayView<f32, D>,
    epsilon: f32,
) -> Result<Array<f32, D>> {
    ensure_shape("gradient du squash", grad_output.shape(), vectors.shape())?;
    let last = Axis(vectors.ndim() - 1);
    let mut grad_input = Array::<f32, D>::zeros(vectors.raw_dim());

    Zip::from(grad_input.lanes_mut(last))
        .and(vectors.lanes(last))
        .and(grad_output.lanes(last))
        .for_each(|mut grad_in, s, grad_out| {
            let x: f32 = s.iter().map(|v| v * v).sum();
            let x_eps = x + epsilon;
            let root = x_eps.sqrt();
            let g = x / ((1.0 + x) * root);
            // g'(x) = (2(x + ε) − x(1 + x)) / (2 (1 + x)² (x + ε)^{3/2})
            let g_prime = (2.0 * x_eps - x * (1.0 + x)) / (2.0 * (1.0 + x).powi(2) * x_eps * root);
            let dot: f32 = s.iter().zip(grad_out.iter()).map(|(a, b)| a * b).sum();
            let coeff = 2.0 * g_prime * dot;

            Zip::from(&mut grad_in)
                .and(&s)
                .and(&grad_out)
                .for_each(|gi, &sv, &go| *gi = g * go + coeff * sv);
        });

    Ok(grad_input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::optimizer::SGD;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array2, Array3};
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;

    #[test]
    fn test_squash_length_below_one() {
        let vectors = arr2(&[[3.0_f32, 4.0], [0.01, 0.0], [-100.0, 20.0]]);
        let squashed = squash(&vectors.view(), 1e-7);

        for row in squashed.rows() {
            let norm = row.dot(&row).sqrt();
            assert!(norm < 1.0);
        }
        // ‖s‖ = 5 → 25/26
        let norm = squashed.row(0).dot(&squashed.row(0)).sqrt();
        assert_abs_diff_eq!(norm, 25.0 / 26.0, epsilon = 1e-5);
    }

    #[test]
    fn test_squash_preserves_direction() {
        let vector = arr1(&[0.3_f32, -1.2, 2.0]);
        let squashed = squash(&vector.view(), 1e-7);
        let ratio = squashed[0] / vector[0];
        assert!(ratio > 0.0);
        for (a, b) in squashed.iter().zip(vector.iter()) {
            assert_abs_diff_eq!(a / b, ratio, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_squash_zero_vector() {
        let zeros = Array3::<f32>::zeros((2, 3, 4));
        let squashed = squash(&zeros.view(), 1e-7);
        assert!(squashed.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_squash_backward_matches_finite_differences() {
        let s = arr2(&[[0.4_f32, -0.7, 1.1], [0.05, 0.02, -0.01]]);
        let upstream = arr2(&[[1.0_f32, 0.5, -0.3], [0.2, -1.0, 0.7]]);
        let epsilon = 1e-7;
        let analytic = squash_backward(&s.view(), &upstream.view(), epsilon).unwrap();

        let objective = |x: &Array2<f32>| -> f64 {
            let out = squash(&x.view(), epsilon);
            out.iter()
                .zip(upstream.iter())
                .map(|(&a, &b)| a as f64 * b as f64)
                .sum()
        };
        let h = 1e-3_f32;
        for idx in [(0, 0), (0, 2), (1, 1)] {
            let mut plus = s.clone();
            plus[idx] += h;
            let mut minus = s.clone();
            minus[idx] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h as f64);
            assert_abs_diff_eq!(analytic[idx] as f64, numeric, epsilon = 2e-3);
        }
    }

    #[test]
    fn test_conv_output_dimensions() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = ConvLayer::new(1, 4, 3, 2, 1, Activation::ReLU, &mut rng);
        let input = Array4::ones((2, 1, 7, 7));
        let output = conv.forward(&input.view()).unwrap();
        assert_eq!(output.dim(), (2, 4, 4, 4));

        let grad = conv.backward(&Array4::ones(output.dim()).view()).unwrap();
        assert_eq!(grad.dim(), input.dim());
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = ConvLayer::new(3, 4, 3, 1, 0, Activation::None, &mut rng);
        let input = Array4::ones((1, 1, 5, 5));
        assert!(conv.forward(&input.view()).is_err());
    }

    #[test]
    fn test_conv_input_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut conv = ConvLayer::new(2, 3, 3, 2, 1, Activation::Tanh, &mut rng);
        let input = Array4::random_using((1, 2, 5, 5), Uniform::new(-1.0_f32, 1.0), &mut rng);

        let output = conv.forward(&input.view()).unwrap();
        let upstream = Array4::random_using(output.dim(), Uniform::new(-1.0_f32, 1.0), &mut rng);
        let grad = conv.backward(&upstream.view()).unwrap();

        let h = 1e-2_f32;
        for idx in [[0, 0, 0, 0], [0, 1, 2, 3], [0, 0, 4, 4]] {
            let mut plus = input.clone();
            plus[idx] += h;
            let mut minus = input.clone();
            minus[idx] -= h;
            let f_plus = (conv.forward(&plus.view()).unwrap() * &upstream).sum();
            let f_minus = (conv.forward(&minus.view()).unwrap() * &upstream).sum();
            let numeric = (f_plus - f_minus) / (2.0 * h);
            assert_abs_diff_eq!(grad[idx], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_conv_gradient_step_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut conv = ConvLayer::new(1, 2, 3, 1, 0, Activation::None, &mut rng);
        let input = Array4::random_using((2, 1, 5, 5), Uniform::new(0.0_f32, 1.0), &mut rng);

        // L = ½ Σ y²
        let output = conv.forward(&input.view()).unwrap();
        let before = output.mapv(|v| v * v).sum() * 0.5;
        conv.backward(&output.view()).unwrap();

        let mut optimizer = SGD::new(0.01, 0.0);
        conv.apply_gradients("conv", &mut optimizer).unwrap();
        let after = conv.forward(&input.view()).unwrap().mapv(|v| v * v).sum() * 0.5;
        assert!(after < before);
    }
}
