use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::config::LossConfig;
use crate::error::{ensure_shape, Result};

/// Trait pour les fonctions de perte sur des tableaux [batch, n]
pub trait LossFunction: Send + Sync {
    fn compute(&self, predictions: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<f32>;
    fn gradient(&self, predictions: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<Array2<f32>>;
}

/// Margin Loss pour CapsNet (Sabour et al., 2017), calculée sur les longueurs
/// des capsules de sortie
#[derive(Debug, Clone)]
pub struct MarginLoss {
    pub positive_margin: f32, // m+ = 0.9
    pub negative_margin: f32, // m- = 0.1
    pub down_weighting: f32,  // λ = 0.5
}

impl MarginLoss {
    pub fn new(positive_margin: f32, negative_margin: f32, down_weighting: f32) -> Self {
        Self {
            positive_margin,
            negative_margin,
            down_weighting,
        }
    }

    /// L[b, j] = T·max(0, m+ − ‖v‖)² + λ(1 − T)·max(0, ‖v‖ − m-)²
    pub fn per_class(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<Array2<f32>> {
        ensure_shape("cibles de la margin loss", targets.shape(), lengths.shape())?;
        let mut losses = Array2::zeros(lengths.raw_dim());
        Zip::from(&mut losses)
            .and(lengths)
            .and(targets)
            .for_each(|l, &len, &t| {
                let present_error = (self.positive_margin - len).max(0.0).powi(2);
                let absent_error = (len - self.negative_margin).max(0.0).powi(2);
                *l = t * present_error + self.down_weighting * (1.0 - t) * absent_error;
            });
        Ok(losses)
    }
}

impl LossFunction for MarginLoss {
    /// Moyenne sur le batch de Σ_j L[b, j]
    fn compute(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<f32> {
        let losses = self.per_class(lengths, targets)?;
        Ok(losses.sum_axis(Axis(1)).mean().unwrap_or(0.0))
    }

    /// Gradient par rapport aux longueurs
    fn gradient(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<Array2<f32>> {
        ensure_shape("cibles de la margin loss", targets.shape(), lengths.shape())?;
        let batch_size = lengths.nrows().max(1) as f32;
        let mut grad = Array2::zeros(lengths.raw_dim());
        Zip::from(&mut grad)
            .and(lengths)
            .and(targets)
            .for_each(|g, &len, &t| {
                let present = -2.0 * (self.positive_margin - len).max(0.0);
                let absent = 2.0 * (len - self.negative_margin).max(0.0);
                *g = (t * present + self.down_weighting * (1.0 - t) * absent) / batch_size;
            });
        Ok(grad)
    }
}

/// Perte de reconstruction: somme des carrés des écarts sur le batch et les
/// pixels (somme, pas moyenne)
#[derive(Debug, Clone, Default)]
pub struct ReconstructionLoss;

impl LossFunction for ReconstructionLoss {
    fn compute(&self, reconstruction: &ArrayView2<f32>, original: &ArrayView2<f32>) -> Result<f32> {
        ensure_shape("image originale", original.shape(), reconstruction.shape())?;
        Ok(Zip::from(reconstruction)
            .and(original)
            .fold(0.0, |acc, &r, &o| acc + (r - o) * (r - o)))
    }

    fn gradient(&self, reconstruction: &ArrayView2<f32>, original: &ArrayView2<f32>) -> Result<Array2<f32>> {
        ensure_shape("image originale", original.shape(), reconstruction.shape())?;
        Ok((reconstruction - original) * 2.0)
    }
}

/// Détail des pertes d'un batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub margin: f32,
    pub reconstruction: f32,
    pub total: f32,
}

/// Perte combinée: margin loss + α · reconstruction
#[derive(Debug, Clone)]
pub struct CombinedLoss {
    pub margin_loss: MarginLoss,
    pub reconstruction_loss: ReconstructionLoss,
    pub reconstruction_weight: f32,
}

impl CombinedLoss {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            margin_loss: MarginLoss::new(
                config.positive_margin,
                config.negative_margin,
                config.down_weighting,
            ),
            reconstruction_loss: ReconstructionLoss,
            reconstruction_weight: config.reconstruction_weight,
        }
    }

    /// `reconstruction` et `original` sont aplatis en [B, pixels]; sans
    /// décodeur la perte de reconstruction vaut 0.
    pub fn compute_total(
        &self,
        lengths: &ArrayView2<f32>,
        targets: &ArrayView2<f32>,
        reconstruction: Option<(&ArrayView2<f32>, &ArrayView2<f32>)>,
    ) -> Result<LossBreakdown> {
        let margin = self.margin_loss.compute(lengths, targets)?;
        let reconstruction = match reconstruction {
            Some((decoded, original)) => self.reconstruction_loss.compute(decoded, original)?,
            None => 0.0,
        };

        Ok(LossBreakdown {
            margin,
            reconstruction,
            total: margin + self.reconstruction_weight * reconstruction,
        })
    }

    /// ∂(margin)/∂longueurs
    pub fn gradient_lengths(&self, lengths: &ArrayView2<f32>, targets: &ArrayView2<f32>) -> Result<Array2<f32>> {
        self.margin_loss.gradient(lengths, targets)
    }

    /// ∂(α · reconstruction)/∂sortie du décodeur
    pub fn gradient_reconstruction(
        &self,
        decoded: &ArrayView2<f32>,
        original: &ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        Ok(self.reconstruction_loss.gradient(decoded, original)? * self.reconstruction_weight)
    }
}

/// Nombre d'échantillons dont la classe prédite est l'argmax de l'étiquette
pub fn correct_predictions(predictions: &ArrayView1<usize>, labels: &ArrayView2<f32>) -> usize {
    predictions
        .iter()
        .zip(labels.rows())
        .filter(|(&pred, row)| argmax(row) == pred)
        .count()
}

fn argmax(row: &ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (c, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = c;
        }
    }
    best
}

/// Métriques d'évaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub accuracy: f32,
    pub precision: Vec<f32>,
    pub recall: Vec<f32>,
    pub f1_score: Vec<f32>,
    pub confusion_matrix: Vec<Vec<usize>>,
}

impl Metrics {
    /// Matrice de confusion et scores par classe, à partir des classes
    /// prédites et des étiquettes one-hot
    pub fn compute(predictions: &Array1<usize>, labels: &ArrayView2<f32>) -> Self {
        let num_classes = labels.ncols();
        let mut confusion = vec![vec![0; num_classes]; num_classes];
        let mut correct = 0;

        for (&pred_class, row) in predictions.iter().zip(labels.rows()) {
            let true_class = argmax(&row);
            confusion[true_class][pred_class] += 1;
            if pred_class == true_class {
                correct += 1;
            }
        }

        let accuracy = if predictions.is_empty() {
            0.0
        } else {
            correct as f32 / predictions.len() as f32
        };

        // Calcul precision, recall, F1 par classe
        let mut precision = Vec::with_capacity(num_classes);
        let mut recall = Vec::with_capacity(num_classes);
        let mut f1_score = Vec::with_capacity(num_classes);

        for c in 0..num_classes {
            let tp = confusion[c][c] as f32;
            let fp: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[i][c] as f32)
                .sum();
            let fn_: f32 = (0..num_classes)
                .filter(|&i| i != c)
                .map(|i| confusion[c][i] as f32)
                .sum();

            let prec = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
            let rec = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
            let f1 = if prec + rec > 0.0 { 2.0 * prec * rec / (prec + rec) } else { 0.0 };

            precision.push(prec);
            recall.push(rec);
            f1_score.push(f1);
        }

        Self {
            accuracy,
            precision,
            recall,
            f1_score,
            confusion_matrix: confusion,
        }
    }

    pub fn log(&self) {
        log::info!("📊 Métriques: accuracy {:.4}", self.accuracy);
        for (i, ((p, r), f1)) in self
            .precision
            .iter()
            .zip(&self.recall)
            .zip(&self.f1_score)
            .enumerate()
        {
            log::info!("   Classe {i}: precision={p:.4}, recall={r:.4}, F1={f1:.4}");
        }
        for row in &self.confusion_matrix {
            log::debug!("   {row:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    fn default_loss() -> CombinedLoss {
        CombinedLoss::new(&LossConfig::default())
    }

    #[test]
    fn test_margin_loss_values() {
        let loss = MarginLoss::new(0.9, 0.1, 0.5);
        let lengths = arr2(&[[0.5_f32, 0.5], [0.95, 0.3]]);
        let targets = arr2(&[[1.0_f32, 0.0], [1.0, 0.0]]);

        // échantillon 0: 0.4² + 0.5·0.4² = 0.24 ; échantillon 1: 0 + 0.5·0.2² = 0.02
        let value = loss.compute(&lengths.view(), &targets.view()).unwrap();
        assert_abs_diff_eq!(value, (0.24 + 0.02) / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_margin_loss_zero_inside_margins() {
        let loss = MarginLoss::new(0.9, 0.1, 0.5);
        let lengths = arr2(&[[0.92_f32, 0.05, 0.1], [0.0, 0.99, 0.02]]);
        let targets = arr2(&[[1.0_f32, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_eq!(loss.compute(&lengths.view(), &targets.view()).unwrap(), 0.0);
        assert!(loss
            .gradient(&lengths.view(), &targets.view())
            .unwrap()
            .iter()
            .all(|&g| g == 0.0));
    }

    #[test]
    fn test_margin_gradient_matches_finite_differences() {
        let loss = MarginLoss::new(0.9, 0.1, 0.5);
        let lengths = arr2(&[[0.3_f32, 0.6], [0.8, 0.4]]);
        let targets = arr2(&[[1.0_f32, 0.0], [0.0, 1.0]]);
        let grad = loss.gradient(&lengths.view(), &targets.view()).unwrap();

        let h = 1e-3_f32;
        for idx in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let mut plus = lengths.clone();
            plus[idx] += h;
            let mut minus = lengths.clone();
            minus[idx] -= h;
            let numeric = (loss.compute(&plus.view(), &targets.view()).unwrap()
                - loss.compute(&minus.view(), &targets.view()).unwrap())
                / (2.0 * h);
            assert_abs_diff_eq!(grad[idx], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_reconstruction_is_sum_of_squares() {
        let decoded = arr2(&[[0.0_f32, 1.0], [0.5, 0.5]]);
        let original = arr2(&[[1.0_f32, 1.0], [0.0, 0.5]]);
        let value = ReconstructionLoss
            .compute(&decoded.view(), &original.view())
            .unwrap();
        assert_abs_diff_eq!(value, 1.25, epsilon = 1e-6);
        assert_eq!(ReconstructionLoss.compute(&original.view(), &original.view()).unwrap(), 0.0);
    }

    #[test]
    fn test_total_loss_composition() {
        let loss = default_loss();
        let lengths = arr2(&[[0.0_f32, 0.0]]);
        let targets = arr2(&[[0.0_f32, 1.0]]);
        let decoded = arr2(&[[1.0_f32, 1.0]]);
        let original = arr2(&[[0.0_f32, 0.0]]);

        let breakdown = loss
            .compute_total(
                &lengths.view(),
                &targets.view(),
                Some((&decoded.view(), &original.view())),
            )
            .unwrap();
        assert_abs_diff_eq!(breakdown.margin, 0.81, epsilon = 1e-6);
        assert_abs_diff_eq!(breakdown.reconstruction, 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(breakdown.total, 0.81 + 0.0005 * 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mismatched_targets_rejected() {
        let loss = MarginLoss::new(0.9, 0.1, 0.5);
        let lengths = arr2(&[[0.5_f32, 0.5]]);
        let targets = arr2(&[[1.0_f32, 0.0, 0.0]]);
        assert!(loss.compute(&lengths.view(), &targets.view()).is_err());
    }

    #[test]
    fn test_correct_predictions_count() {
        let predictions = arr1(&[0_usize, 2, 1]);
        let labels = arr2(&[[1.0_f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 1.0, 0.0]]);
        assert_eq!(correct_predictions(&predictions.view(), &labels.view()), 2);
    }

    #[test]
    fn test_metrics() {
        let predictions = arr1(&[0_usize, 1, 1, 0]);
        let labels = arr2(&[[1.0_f32, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]]);
        let metrics = Metrics::compute(&predictions, &labels.view());

        assert_abs_diff_eq!(metrics.accuracy, 0.5);
        assert_eq!(metrics.confusion_matrix, vec![vec![1, 1], vec![1, 1]]);
        assert_abs_diff_eq!(metrics.precision[0], 0.5);
        assert_abs_diff_eq!(metrics.f1_score[1], 0.5);
    }
}
