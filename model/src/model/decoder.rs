use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use super::config::Activation;
use super::optimizer::Optimizer;
use crate::error::{ensure_shape, shape, Result};

/// Couche dense y = f(x · W + b)
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,
    input_cache: Option<Array2<f32>>,
    pre_activation_cache: Option<Array2<f32>>,
    weight_grad: Array2<f32>,
    bias_grad: Array1<f32>,
}

impl DenseLayer {
    pub fn new<R: Rng + ?Sized>(inputs: usize, outputs: usize, activation: Activation, rng: &mut R) -> Self {
        // Initialisation Glorot uniforme
        let limit = (6.0 / (inputs + outputs) as f32).sqrt();
        let weights = Array2::random_using((inputs, outputs), Uniform::new(-limit, limit), rng);

        Self {
            weight_grad: Array2::zeros((inputs, outputs)),
            bias_grad: Array1::zeros(outputs),
            weights,
            biases: Array1::zeros(outputs),
            activation,
            input_cache: None,
            pre_activation_cache: None,
        }
    }

    pub fn forward(&mut self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.weights.nrows() {
            return Err(shape(format!(
                "couche dense: {} entrées, attendues {}",
                input.ncols(),
                self.weights.nrows()
            )));
        }
        let pre_activation = input.dot(&self.weights) + &self.biases;
        let activation = self.activation;
        let output = pre_activation.mapv(|v| activation.apply(v));

        self.input_cache = Some(input.to_owned());
        self.pre_activation_cache = Some(pre_activation);
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let (input, pre_activation) = match (&self.input_cache, &self.pre_activation_cache) {
            (Some(input), Some(pre)) => (input, pre),
            _ => return Err(shape("couche dense: backward appelé avant forward")),
        };
        ensure_shape("gradient dense", grad_output.shape(), pre_activation.shape())?;

        let activation = self.activation;
        let mut grad = grad_output.to_owned();
        Zip::from(&mut grad)
            .and(pre_activation)
            .for_each(|g, &pre| *g *= activation.derivative(pre));

        self.weight_grad = input.t().dot(&grad);
        self.bias_grad = grad.sum_axis(Axis(0));
        Ok(grad.dot(&self.weights.t()))
    }

    pub fn apply_gradients(&mut self, param_id: &str, optimizer: &mut dyn Optimizer) -> Result<()> {
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

/// Décodeur: poses masquées [B, N_out·D_out] -> pixels [B, C·H·W].
///
/// Couches cachées en ReLU, sortie en sigmoïde.
pub struct Decoder {
    pub layers: Vec<DenseLayer>,
}

impl Decoder {
    pub fn new<R: Rng + ?Sized>(input_size: usize, hidden_units: &[usize], output_size: usize, rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(hidden_units.len() + 1);
        let mut inputs = input_size;
        for &units in hidden_units {
            layers.push(DenseLayer::new(inputs, units, Activation::ReLU, rng));
            inputs = units;
        }
        layers.push(DenseLayer::new(inputs, output_size, Activation::Sigmoid, rng));
        Self { layers }
    }

    pub fn forward(&mut self, input: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let mut output = input.to_owned();
        for layer in &mut self.layers {
            output = layer.forward(&output.view())?;
        }
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let mut grad = grad_output.to_owned();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad.view())?;
        }
        Ok(grad)
    }

    pub fn apply_gradients(&mut self, param_id: &str, optimizer: &mut dyn Optimizer) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.apply_gradients(&format!("{param_id}.fc{}", i + 1), optimizer)?;
        }
        Ok(())
    }
}
