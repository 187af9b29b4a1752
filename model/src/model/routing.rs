use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

use super::layers::{squash, squash_backward};
use crate::error::{config, ensure_shape, Result};

/// Routage dynamique par accord.
///
/// Les prédictions `û` ont la forme [batch, N_in, N_out, D_out]. Les logits
/// de couplage `b` naissent à zéro à chaque passe et ne sont jamais conservés
/// d'une passe à l'autre.
#[derive(Debug, Clone)]
pub struct DynamicRouting {
    num_iterations: usize,
    squash_epsilon: f32,
}

/// Prédictions exclues du calcul de gradient.
///
/// Elles ne servent qu'aux itérations intermédiaires et à la mise à jour des
/// logits; rien de ce qui en dérive n'est mis en cache pour le backward.
struct Detached<'a> {
    predictions: ArrayView4<'a, f32>,
}

impl<'a> Detached<'a> {
    fn new(predictions: &ArrayView4<'a, f32>) -> Self {
        Self {
            predictions: predictions.clone(),
        }
    }

    fn view(&self) -> &ArrayView4<'a, f32> {
        &self.predictions
    }

    /// Accord a[b, i, j] = û[b, i, j] · v[b, j]
    fn agreement(&self, outputs: &ArrayView3<f32>) -> Array3<f32> {
        let (batch_size, input_caps, output_caps, dim) = self.predictions.dim();
        let mut agreement = Array3::zeros((batch_size, input_caps, output_caps));

        agreement
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut agreement_batch)| {
                for ic in 0..input_caps {
                    for oc in 0..output_caps {
                        let mut dot = 0.0;
                        for d in 0..dim {
                            dot += self.predictions[[b, ic, oc, d]] * outputs[[b, oc, d]];
                        }
                        agreement_batch[[ic, oc]] = dot;
                    }
                }
            });

        agreement
    }
}

/// État de la dernière itération, nécessaire au backward
#[derive(Debug, Clone)]
pub struct RoutingCache {
    /// Coefficients c[b, i, j] de la dernière itération, traités comme constantes
    pub coupling: Array3<f32>,
    /// s[b, j] avant squash
    pub pre_squash: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct Routed {
    /// v[b, j], forme [batch, N_out, D_out]
    pub outputs: Array3<f32>,
    pub cache: RoutingCache,
}

/// Historique complet d'un routage, itération par itération
#[derive(Debug, Clone, Default)]
pub struct RoutingTrace {
    /// Logits b au début de chaque itération
    pub logits: Vec<Array3<f32>>,
    /// Coefficients c de chaque itération
    pub couplings: Vec<Array3<f32>>,
    /// Sorties v de chaque itération
    pub outputs: Vec<Array3<f32>>,
}

impl DynamicRouting {
    pub fn new(num_iterations: usize, squash_epsilon: f32) -> Result<Self> {
        if num_iterations < 1 {
            return Err(config("le routage exige au moins une itération"));
        }
        Ok(Self {
            num_iterations,
            squash_epsilon,
        })
    }

    pub fn num_iterations(&self) -> usize {
        self.num_iterations
    }

    pub fn route(&self, predictions: &ArrayView4<f32>) -> Routed {
        self.run(predictions, None)
    }

    /// Routage avec retour des logits et coefficients de chaque itération
    pub fn route_traced(&self, predictions: &ArrayView4<f32>) -> (Routed, RoutingTrace) {
        let mut trace = RoutingTrace::default();
        let routed = self.run(predictions, Some(&mut trace));
        (routed, trace)
    }

    fn run(&self, predictions: &ArrayView4<f32>, mut trace: Option<&mut RoutingTrace>) -> Routed {
        let (batch_size, input_caps, output_caps, _) = predictions.dim();
        let detached = Detached::new(predictions);

        // Initialisation des logits (b_ij): aucune préférence
        let mut logits = Array3::zeros((batch_size, input_caps, output_caps));

        // Itérations internes: pas de rétropropagation
        for _ in 1..self.num_iterations {
            let coupling = softmax_over_outputs(&logits.view());
            let pre_squash = weighted_sum(detached.view(), &coupling.view());
            let outputs = squash(&pre_squash.view(), self.squash_epsilon);
            let next_logits = &logits + &detached.agreement(&outputs.view());

            if let Some(trace) = trace.as_deref_mut() {
                trace.logits.push(logits);
                trace.couplings.push(coupling);
                trace.outputs.push(outputs);
            }
            logits = next_logits;
        }

        // Dernière itération: les prédictions porteuses de gradient
        let coupling = softmax_over_outputs(&logits.view());
        let pre_squash = weighted_sum(predictions, &coupling.view());
        let outputs = squash(&pre_squash.view(), self.squash_epsilon);

        if let Some(trace) = trace {
            trace.logits.push(logits);
            trace.couplings.push(coupling.clone());
            trace.outputs.push(outputs.clone());
        }

        Routed {
            outputs,
            cache: RoutingCache { coupling, pre_squash },
        }
    }

    /// Gradient par rapport aux prédictions û.
    ///
    /// Seule la dernière itération est différenciée: ∂L/∂û[b,i,j] =
    /// c[b,i,j] · ∂L/∂s[b,j], avec c constant.
    pub fn backward(&self, cache: &RoutingCache, grad_outputs: &ArrayView3<f32>) -> Result<Array4<f32>> {
        ensure_shape("gradient du routage", grad_outputs.shape(), cache.pre_squash.shape())?;
        let grad_pre_squash = squash_backward(&cache.pre_squash.view(), grad_outputs, self.squash_epsilon)?;

        let (batch_size, input_caps, output_caps) = cache.coupling.dim();
        let dim = grad_pre_squash.dim().2;
        let mut grad_predictions = Array4::zeros((batch_size, input_caps, output_caps, dim));

        grad_predictions
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(b, mut grad_batch)| {
                for ic in 0..input_caps {
                    for oc in 0..output_caps {
                        let coeff = cache.coupling[[b, ic, oc]];
                        for d in 0..dim {
                            grad_batch[[ic, oc, d]] = coeff * grad_pre_squash[[b, oc, d]];
                        }
                    }
                }
            });

        Ok(grad_predictions)
    }
}

/// Softmax sur l'axe des capsules de sortie: Σ_j c[b, i, j] = 1
pub fn softmax_over_outputs(logits: &ArrayView3<f32>) -> Array3<f32> {
    let mut result = logits.to_owned();

    result
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut batch| {
            for mut row in batch.rows_mut() {
                // Max pour la stabilité numérique
                let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                row.mapv_inplace(|v| (v - max_val).exp());
                let exp_sum = row.sum();
                row.mapv_inplace(|v| v / exp_sum);
            }
        });

    result
}

/// Somme pondérée s[b, j] = Σ_i c[b, i, j] · û[b, i, j]
fn weighted_sum(predictions: &ArrayView4<f32>, coupling: &ArrayView3<f32>) -> Array3<f32> {
    let (batch_size, input_caps, output_caps, dim) = predictions.dim();
    let mut outputs = Array3::zeros((batch_size, output_caps, dim));

    outputs
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut output_batch)| {
            for oc in 0..output_caps {
                for d in 0..dim {
                    let mut sum = 0.0;
                    for ic in 0..input_caps {
                        sum += coupling[[b, ic, oc]] * predictions[[b, ic, oc, d]];
                    }
                    output_batch[[oc, d]] = sum;
                }
            }
        });

    outputs
}
