use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{
    capsule::{DigitCapsLayer, PrimaryCapsLayer},
    config::{NetworkConfig, OptimizerType, TrainingConfig},
    decoder::Decoder,
    layers::Layer,
    loss::{correct_predictions, CombinedLoss, LossBreakdown, Metrics},
    mask::{capsule_lengths_backward, CapsuleMask, MaskMode, Masked},
    optimizer::{Adam, Optimizer, SGD},
};
use crate::error::{config, ensure_shape, Result};
use crate::train_data::data_loader::{save_image, Dataset};

/// Modèle CapsNet principal
pub struct CapNet {
    pub network_config: NetworkConfig,
    pub training_config: TrainingConfig,
    pub features: Vec<Box<dyn Layer>>,
    pub primary: PrimaryCapsLayer,
    pub digit_caps: DigitCapsLayer,
    pub decoder: Option<Decoder>,
    pub mask: CapsuleMask,
    pub loss_fn: CombinedLoss,
    pub history: TrainingHistory,
    pub state: ModelState,
}

/// Sorties d'une passe avant
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Capsules de sortie v, [B, N_out, D_out]
    pub capsules: Array3<f32>,
    pub masked: Masked,
    /// Reconstruction aplatie [B, C·H·W], absente sans décodeur
    pub reconstruction: Option<Array2<f32>>,
}

/// Résultat d'une étape d'entraînement
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub loss: LossBreakdown,
    pub correct: usize,
    pub batch_size: usize,
}

impl StepMetrics {
    pub fn accuracy(&self) -> f32 {
        if self.batch_size == 0 {
            0.0
        } else {
            self.correct as f32 / self.batch_size as f32
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: LossBreakdown,
    pub accuracy: f32,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub train_accuracy: Vec<f32>,
    pub val_accuracy: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelState {
    pub is_trained: bool,
    pub best_loss: f32,
    pub current_epoch: usize,
    pub early_stopping_counter: usize,
}

impl CapNet {
    pub fn new(
        network_config: NetworkConfig,
        training_config: TrainingConfig,
        features: Vec<Box<dyn Layer>>,
        primary: PrimaryCapsLayer,
        digit_caps: DigitCapsLayer,
        decoder: Option<Decoder>,
    ) -> Self {
        let loss_fn = CombinedLoss::new(&training_config.loss_config);
        let mask = CapsuleMask::new(network_config.length_epsilon);

        Self {
            network_config,
            training_config,
            features,
            primary,
            digit_caps,
            decoder,
            mask,
            loss_fn,
            history: TrainingHistory::new(),
            state: ModelState::new(),
        }
    }

    /// Passe avant complète: convolutions, capsules primaires, capsules de
    /// sortie, masquage et reconstruction.
    ///
    /// `labels` est requis en mode `GroundTruth`.
    pub fn forward(
        &mut self,
        images: &ArrayView4<f32>,
        labels: Option<&ArrayView2<f32>>,
        mode: MaskMode,
    ) -> Result<ForwardOutput> {
        let (channels, height, width) = self.network_config.input_shape;
        ensure_shape("images", &images.shape()[1..], &[channels, height, width])?;

        let mut features = images.to_owned();
        for layer in &mut self.features {
            features = layer.forward(&features.view())?;
        }

        let primary = self.primary.forward(&features.view())?;
        let capsules = self.digit_caps.forward(&primary.view())?;
        let masked = self.mask.apply(&capsules.view(), labels, mode)?;

        let reconstruction = match &mut self.decoder {
            Some(decoder) => Some(decoder.forward(&masked.decoder_input.view())?),
            None => None,
        };

        Ok(ForwardOutput {
            capsules,
            masked,
            reconstruction,
        })
    }

    /// Rétropropagation de la perte totale; retourne ∂L/∂images.
    ///
    /// Les gradients des paramètres restent stockés dans les couches jusqu'à
    /// `apply_gradients`.
    pub fn backward(
        &mut self,
        output: &ForwardOutput,
        labels: &ArrayView2<f32>,
        flat_images: &ArrayView2<f32>,
    ) -> Result<Array4<f32>> {
        let lengths = &output.masked.lengths;
        let grad_lengths = self.loss_fn.gradient_lengths(&lengths.view(), labels)?;
        let mut grad_capsules =
            capsule_lengths_backward(&output.capsules.view(), &lengths.view(), &grad_lengths.view())?;

        if let (Some(decoder), Some(reconstruction)) = (&mut self.decoder, &output.reconstruction) {
            let grad_reconstruction = self
                .loss_fn
                .gradient_reconstruction(&reconstruction.view(), flat_images)?;
            let grad_decoder_input = decoder.backward(&grad_reconstruction.view())?;
            grad_capsules += &CapsuleMask::backward(
                &output.masked.targets.view(),
                &grad_decoder_input.view(),
                self.digit_caps.capsule_dim,
            )?;
        }

        let grad_primary = self.digit_caps.backward(&grad_capsules.view())?;
        let mut grad = self.primary.backward(&grad_primary.view())?;
        for layer in self.features.iter_mut().rev() {
            grad = layer.backward(&grad.view())?;
        }
        Ok(grad)
    }

    /// Mise à jour des poids
    pub fn apply_gradients(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        for (i, layer) in self.features.iter_mut().enumerate() {
            layer.apply_gradients(&format!("conv{}", i + 1), optimizer)?;
        }
        self.primary.apply_gradients("primary_caps", optimizer)?;
        self.digit_caps.apply_gradients("digit_caps", optimizer)?;
        if let Some(decoder) = &mut self.decoder {
            decoder.apply_gradients("decoder", optimizer)?;
        }
        Ok(())
    }

    /// Une étape de descente sur un batch, masquage par les étiquettes réelles
    pub fn train_step(
        &mut self,
        images: &ArrayView4<f32>,
        labels: &ArrayView2<f32>,
        optimizer: &mut dyn Optimizer,
    ) -> Result<StepMetrics> {
        let output = self.forward(images, Some(labels), MaskMode::GroundTruth)?;
        let flat_images = flatten_images(images)?;
        let loss = self.batch_loss(&output, labels, &flat_images.view())?;

        self.backward(&output, labels, &flat_images.view())?;
        self.apply_gradients(optimizer)?;

        Ok(StepMetrics {
            loss,
            correct: correct_predictions(&output.masked.predictions.view(), labels),
            batch_size: labels.nrows(),
        })
    }

    fn batch_loss(
        &self,
        output: &ForwardOutput,
        labels: &ArrayView2<f32>,
        flat_images: &ArrayView2<f32>,
    ) -> Result<LossBreakdown> {
        let reconstruction = output.reconstruction.as_ref().map(|r| r.view());
        self.loss_fn.compute_total(
            &output.masked.lengths.view(),
            labels,
            reconstruction.as_ref().map(|r| (r, flat_images)),
        )
    }

    /// Évaluation en mode inférence (masquage par la classe prédite), tous
    /// les échantillons inclus
    pub fn evaluate(&mut self, data: &Dataset, batch_size: usize) -> Result<Evaluation> {
        let mut total = LossBreakdown::default();
        let mut predictions = Vec::with_capacity(data.len());

        for (images, labels) in data.batches(batch_size) {
            let output = self.forward(&images, None, MaskMode::Predicted)?;
            let flat_images = flatten_images(&images)?;
            let loss = self.batch_loss(&output, &labels, &flat_images.view())?;

            // Moyenne pondérée par la taille du batch, comme à l'entraînement
            let weight = labels.nrows() as f32;
            total.margin += loss.margin * weight;
            total.reconstruction += loss.reconstruction * weight;
            total.total += loss.total * weight;
            predictions.extend(output.masked.predictions.iter().copied());
        }

        let samples = data.len().max(1) as f32;
        total.margin /= samples;
        total.reconstruction /= samples;
        total.total /= samples;

        let metrics = Metrics::compute(&Array1::from(predictions), &data.labels.view());
        Ok(Evaluation {
            loss: total,
            accuracy: metrics.accuracy,
            metrics,
        })
    }

    /// Écrit `original_<i>.png` et `reconstruction_<i>.png` pour les
    /// `count` premières images, reconstruites depuis la classe prédite
    pub fn save_reconstructions(
        &mut self,
        images: &ArrayView4<f32>,
        dir: &Path,
        count: usize,
    ) -> Result<Vec<PathBuf>> {
        if self.decoder.is_none() {
            return Err(config("reconstructions demandées sans décodeur"));
        }
        let count = count.min(images.dim().0);
        let selected = images.slice(s![..count, .., .., ..]);
        let output = self.forward(&selected, None, MaskMode::Predicted)?;
        let reconstruction = output
            .reconstruction
            .ok_or_else(|| config("reconstructions demandées sans décodeur"))?
            .into_shape_with_order(selected.raw_dim())?;

        fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(2 * count);
        for i in 0..count {
            let original = dir.join(format!("original_{i}.png"));
            save_image(&selected.index_axis(Axis(0), i), &original)?;
            let decoded = dir.join(format!("reconstruction_{i}.png"));
            save_image(&reconstruction.index_axis(Axis(0), i), &decoded)?;
            written.push(original);
            written.push(decoded);
        }
        log::info!("🖼️  {} reconstructions écrites dans {}", count, dir.display());
        Ok(written)
    }

    /// Classe prédite par image
    pub fn predict(&mut self, images: &ArrayView4<f32>) -> Result<Array1<usize>> {
        let output = self.forward(images, None, MaskMode::Predicted)?;
        Ok(output.masked.predictions)
    }

    fn build_optimizer(&self) -> Box<dyn Optimizer> {
        let lr = self.training_config.learning_rate;
        match self.training_config.optimizer_type {
            OptimizerType::Adam { beta1, beta2, epsilon } => Box::new(Adam::new(lr, beta1, beta2, epsilon)),
            OptimizerType::SGD { momentum } => Box::new(SGD::new(lr, momentum)),
        }
    }

    /// Entraînement complet avec validation à chaque époque et arrêt précoce
    pub fn train(&mut self, train: &Dataset, validation: &Dataset) -> Result<()> {
        log::info!("🎯 DÉBUT DE L'ENTRAÎNEMENT");
        log::info!("   Échantillons train: {}", train.len());
        log::info!("   Échantillons validation: {}", validation.len());

        let mut optimizer = self.build_optimizer();
        let mut rng = StdRng::seed_from_u64(self.training_config.seed);
        let num_epochs = self.training_config.num_epochs;
        let start = Instant::now();

        for epoch in 0..num_epochs {
            self.state.current_epoch = epoch;
            log::info!("📅 Époque {}/{}", epoch + 1, num_epochs);

            let shuffled = train.randomize(&mut rng);
            let (train_loss, train_acc) = self.train_epoch(&shuffled, optimizer.as_mut())?;

            let (val_loss, val_acc) = if validation.is_empty() {
                (train_loss, train_acc)
            } else {
                let evaluation = self.evaluate(validation, self.training_config.batch_size)?;
                (evaluation.loss.total, evaluation.accuracy)
            };

            self.history.update(train_loss, val_loss, train_acc, val_acc);
            log::info!(
                "📊 Loss: {:.4} (train) {:.4} (val) | Acc: {:.2}% (train) {:.2}% (val)",
                train_loss,
                val_loss,
                train_acc * 100.0,
                val_acc * 100.0
            );

            if self.check_early_stopping(val_loss) {
                log::info!("🛑 Arrêt précoce à l'époque {}", epoch + 1);
                break;
            }
        }

        self.state.is_trained = true;
        log::info!("✅ ENTRAÎNEMENT TERMINÉ en {:?}", start.elapsed());
        Ok(())
    }

    /// Entraînement sur une époque; retourne (perte moyenne, accuracy)
    fn train_epoch(&mut self, data: &Dataset, optimizer: &mut dyn Optimizer) -> Result<(f32, f32)> {
        let batch_size = self.training_config.batch_size;
        let log_interval = self.training_config.log_interval;
        let num_batches = data.len().div_ceil(batch_size);

        let mut total_loss = 0.0;
        let mut correct = 0;
        let mut seen = 0;

        for (batch_idx, (images, labels)) in data.batches(batch_size).enumerate() {
            let step = self.train_step(&images, &labels, optimizer)?;

            total_loss += step.loss.total * step.batch_size as f32;
            correct += step.correct;
            seen += step.batch_size;

            if log_interval > 0 && (batch_idx + 1) % log_interval == 0 {
                log::info!(
                    "   Batch {}/{} - Loss: {:.4} (margin {:.4}, reconstruction {:.2}), Acc: {:.2}%",
                    batch_idx + 1,
                    num_batches,
                    step.loss.total,
                    step.loss.margin,
                    step.loss.reconstruction,
                    step.accuracy() * 100.0
                );
            }
        }

        let seen_f = seen.max(1) as f32;
        Ok((total_loss / seen_f, correct as f32 / seen_f))
    }

    /// Early stopping
    fn check_early_stopping(&mut self, current_loss: f32) -> bool {
        if self.training_config.early_stopping_patience == 0 {
            return false;
        }

        if current_loss < self.state.best_loss {
            self.state.best_loss = current_loss;
            self.state.early_stopping_counter = 0;
        } else {
            self.state.early_stopping_counter += 1;
        }

        self.state.early_stopping_counter >= self.training_config.early_stopping_patience
    }

    /// Diagnostic rapide: passe avant sur une image nulle
    pub fn diagnostic(&mut self) -> Result<ForwardOutput> {
        log::info!("🔍 DIAGNOSTIC RAPIDE");
        log::info!("   Convolutions: {}", self.features.len());
        log::info!("   Input shape: {:?}", self.network_config.input_shape);

        let (c, h, w) = self.network_config.input_shape;
        let zeros = Array4::zeros((1, c, h, w));
        let output = self.forward(&zeros.view(), None, MaskMode::Predicted)?;

        log::info!("   Capsules de sortie: {:?}", output.capsules.dim());
        log::info!("   Longueurs: {:?}", output.masked.lengths.row(0).to_vec());
        log::info!("✅ Modèle opérationnel");
        Ok(output)
    }
}

/// [B, C, H, W] -> [B, C·H·W] en ordre ligne
pub fn flatten_images(images: &ArrayView4<f32>) -> Result<Array2<f32>> {
    let (batch_size, c, h, w) = images.dim();
    Ok(images.to_shape((batch_size, c * h * w))?.into_owned())
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self {
            train_loss: Vec::new(),
            val_loss: Vec::new(),
            train_accuracy: Vec::new(),
            val_accuracy: Vec::new(),
        }
    }

    pub fn update(&mut self, train_loss: f32, val_loss: f32, train_acc: f32, val_acc: f32) {
        self.train_loss.push(train_loss);
        self.val_loss.push(val_loss);
        self.train_accuracy.push(train_acc);
        self.val_accuracy.push(val_acc);
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }
}

impl ModelState {
    pub fn new() -> Self {
        Self {
            is_trained: false,
            best_loss: f32::INFINITY,
            current_epoch: 0,
            early_stopping_counter: 0,
        }
    }
}

impl Default for TrainingHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ModelState {
    fn default() -> Self {
        Self::new()
    }
}
