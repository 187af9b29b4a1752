use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use std::collections::HashMap;

use crate::error::{ensure_shape, Result};

/// Trait pour les optimiseurs.
///
/// Chaque paramètre est identifié par `param_id` afin de conserver son état
/// (vélocité, moments) d'une étape à l'autre.
pub trait Optimizer: Send + Sync {
    fn step(&mut self, param_id: &str, param: ArrayViewMutD<f32>, grad: ArrayViewD<f32>) -> Result<()>;
}

/// Optimiseur SGD avec momentum
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl SGD {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, param_id: &str, mut param: ArrayViewMutD<f32>, grad: ArrayViewD<f32>) -> Result<()> {
        ensure_shape(param_id, grad.shape(), param.shape())?;
        let velocity = self
            .velocity
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
        ensure_shape(param_id, velocity.shape(), param.shape())?;

        // v = momentum * v - lr * grad ; param += v
        let (momentum, lr) = (self.momentum, self.learning_rate);
        Zip::from(&mut param)
            .and(velocity)
            .and(&grad)
            .for_each(|p, v, &g| {
                *v = momentum * *v - lr * g;
                *p += *v;
            });
        Ok(())
    }
}

struct AdamState {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
    timestep: i32,
}

/// Optimiseur Adam
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    states: HashMap<String, AdamState>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            states: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param_id: &str, mut param: ArrayViewMutD<f32>, grad: ArrayViewD<f32>) -> Result<()> {
        ensure_shape(param_id, grad.shape(), param.shape())?;
        let state = self
            .states
            .entry(param_id.to_string())
            .or_insert_with(|| AdamState {
                m: ArrayD::zeros(param.raw_dim()),
                v: ArrayD::zeros(param.raw_dim()),
                timestep: 0,
            });
        ensure_shape(param_id, state.m.shape(), param.shape())?;
        state.timestep += 1;

        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        // Correction du biais
        let bias1 = 1.0 - beta1.powi(state.timestep);
        let bias2 = 1.0 - beta2.powi(state.timestep);

        Zip::from(&mut param)
            .and(&mut state.m)
            .and(&mut state.v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        Ok(())
    }
}
