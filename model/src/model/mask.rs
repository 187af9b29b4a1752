use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{config, ensure_shape, Result};

/// Source de la cible de reconstruction, fixée une fois pour tout le batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskMode {
    /// Entraînement supervisé: étiquettes réelles
    GroundTruth,
    /// Inférence: classe prédite
    Predicted,
}

/// Résultat du masquage d'un batch de capsules de sortie
#[derive(Debug, Clone)]
pub struct Masked {
    /// ‖v[b, j]‖, forme [B, N_out]
    pub lengths: Array2<f32>,
    /// argmax_j ‖v[b, j]‖, forme [B]
    pub predictions: Array1<usize>,
    /// One-hot de la capsule conservée, forme [B, N_out]
    pub targets: Array2<f32>,
    /// Poses masquées aplaties, forme [B, N_out · D_out]
    pub decoder_input: Array2<f32>,
}

/// Longueurs des capsules avec la norme sûre sqrt(Σ v² + ε)
pub fn capsule_lengths(capsules: &ArrayView3<f32>, epsilon: f32) -> Array2<f32> {
    capsules.map_axis(Axis(2), |v| (v.dot(&v) + epsilon).sqrt())
}

/// Gradient des longueurs vers les capsules: ∂‖v‖/∂v = v / ‖v‖
pub fn capsule_lengths_backward(
    capsules: &ArrayView3<f32>,
    lengths: &ArrayView2<f32>,
    grad_lengths: &ArrayView2<f32>,
) -> Result<Array3<f32>> {
    let (batch_size, num_caps, _) = capsules.dim();
    ensure_shape("longueurs", lengths.shape(), &[batch_size, num_caps])?;
    ensure_shape("gradient des longueurs", grad_lengths.shape(), &[batch_size, num_caps])?;

    let mut grad = capsules.to_owned();
    Zip::from(grad.lanes_mut(Axis(2)))
        .and(lengths)
        .and(grad_lengths)
        .for_each(|mut v, &len, &g| v.mapv_inplace(|x| x * g / len));
    Ok(grad)
}

/// Classe prédite par échantillon; le premier indice l'emporte en cas d'égalité
pub fn predicted_classes(lengths: &ArrayView2<f32>) -> Array1<usize> {
    lengths.map_axis(Axis(1), |row| {
        let mut best = 0;
        for (c, &len) in row.iter().enumerate() {
            if len > row[best] {
                best = c;
            }
        }
        best
    })
}

pub fn one_hot(classes: &Array1<usize>, depth: usize) -> Array2<f32> {
    let mut encoded = Array2::zeros((classes.len(), depth));
    for (b, &c) in classes.iter().enumerate() {
        encoded[[b, c]] = 1.0;
    }
    encoded
}

/// Masquage des capsules de sortie avant le décodeur
#[derive(Debug, Clone)]
pub struct CapsuleMask {
    pub length_epsilon: f32,
}

impl CapsuleMask {
    pub fn new(length_epsilon: f32) -> Self {
        Self { length_epsilon }
    }

    /// Ne conserve que la pose de la capsule cible de chaque échantillon.
    ///
    /// `labels` est obligatoire en mode `GroundTruth`.
    pub fn apply(
        &self,
        capsules: &ArrayView3<f32>,
        labels: Option<&ArrayView2<f32>>,
        mode: MaskMode,
    ) -> Result<Masked> {
        let (batch_size, num_caps, dim) = capsules.dim();
        let lengths = capsule_lengths(capsules, self.length_epsilon);
        let predictions = predicted_classes(&lengths.view());

        let targets = match mode {
            MaskMode::GroundTruth => {
                let labels = labels
                    .ok_or_else(|| config("masquage par étiquettes sans étiquettes"))?;
                ensure_shape("étiquettes", labels.shape(), &[batch_size, num_caps])?;
                labels.to_owned()
            }
            MaskMode::Predicted => one_hot(&predictions, num_caps),
        };

        let mut masked = capsules.to_owned();
        Zip::from(masked.lanes_mut(Axis(2)))
            .and(&targets)
            .for_each(|mut pose, &t| pose.mapv_inplace(|v| v * t));
        let decoder_input = masked.into_shape_with_order((batch_size, num_caps * dim))?;

        Ok(Masked {
            lengths,
            predictions,
            targets,
            decoder_input,
        })
    }

    /// Gradient de l'entrée du décodeur vers les capsules: seule la tranche
    /// de la capsule cible reçoit un gradient.
    pub fn backward(
        targets: &ArrayView2<f32>,
        grad_decoder_input: &ArrayView2<f32>,
        capsule_dim: usize,
    ) -> Result<Array3<f32>> {
        let (batch_size, num_caps) = targets.dim();
        ensure_shape(
            "gradient de l'entrée du décodeur",
            grad_decoder_input.shape(),
            &[batch_size, num_caps * capsule_dim],
        )?;

        let mut grad = grad_decoder_input
            .to_owned()
            .into_shape_with_order((batch_size, num_caps, capsule_dim))?;
        Zip::from(grad.lanes_mut(Axis(2)))
            .and(targets)
            .for_each(|mut g, &t| g.mapv_inplace(|v| v * t));
        Ok(grad)
    }
}
